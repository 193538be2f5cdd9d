// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Link bring-up and teardown
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (host), tests/lifecycle.rs
//!
//! ```text
//! Uninitialized -> MemoryAllocated -> QueuesInitialized -> VersionVerified -> Started
//! Started -> Stopping -> Stopped
//! any failed step -> Faulted
//! ```
//!
//! `init()` allocates the shared region, lays out the queue table and claims the
//! interrupt line; it runs once and is reused by every later `start()`.
//! `start()` resyncs stale ring indices, performs the legacy INIT handshake,
//! verifies the firmware version, pushes the static tables and sends the final
//! start command. Lifecycle calls are serialised; sends on the link are not.

use std::sync::{Arc, Weak};

use gmu_hal::{Doorbell, InterruptLine, RegionAllocator, SharedMemory};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::budget::Clock;
use crate::cmd::{feature, value, Request};
use crate::codec;
use crate::config::LinkConfig;
use crate::events::EventSink;
use crate::irq::IrqStatus;
use crate::link::HfiLink;
use crate::table::{QueueSpec, QueueTable, QUEUE_SLOTS};
use crate::{Error, Result};

/// Environment collaborators a link is built on.
#[derive(Clone)]
pub struct Platform {
    pub allocator: Arc<dyn RegionAllocator>,
    pub doorbell: Arc<dyn Doorbell>,
    pub irq: Arc<dyn InterruptLine>,
    pub clock: Arc<dyn Clock + Send + Sync>,
    pub events: Arc<dyn EventSink>,
}

/// Limits management settings pushed on protocol 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LmConfig {
    pub throttle_mask: u32,
    pub isense_slope: u32,
}

/// Board tables pushed during start. Their contents are opaque here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaticTables {
    pub perf: Vec<u32>,
    pub bw: Vec<u32>,
    pub acd: Option<Vec<u32>>,
    pub lm: Option<LmConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    MemoryAllocated,
    QueuesInitialized,
    VersionVerified,
    Started,
    Stopping,
    Stopped,
    Faulted,
}

/// Owns one link from allocation to teardown.
pub struct LinkLifecycle {
    config: LinkConfig,
    platform: Platform,
    tables: StaticTables,
    ops: Mutex<()>,
    state: Mutex<LinkState>,
    link: Mutex<Option<Arc<HfiLink>>>,
    fw_version: Mutex<Option<u32>>,
}

impl LinkLifecycle {
    pub fn new(config: LinkConfig, platform: Platform, tables: StaticTables) -> Self {
        Self {
            config,
            platform,
            tables,
            ops: Mutex::new(()),
            state: Mutex::new(LinkState::Uninitialized),
            link: Mutex::new(None),
            fw_version: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Current state. A started link whose fault flag is up reports `Faulted`.
    pub fn state(&self) -> LinkState {
        let state = *self.state.lock();
        if state == LinkState::Started && self.link.lock().as_ref().is_some_and(|l| l.is_faulted()) {
            return LinkState::Faulted;
        }
        state
    }

    /// Firmware version word verified by the last successful start.
    pub fn fw_version(&self) -> Option<u32> {
        *self.fw_version.lock()
    }

    /// The running link. Fails with `NotStarted` outside `Started`.
    pub fn link(&self) -> Result<Arc<HfiLink>> {
        if *self.state.lock() != LinkState::Started {
            return Err(Error::NotStarted);
        }
        self.link.lock().clone().ok_or(Error::NotStarted)
    }

    /// Allocates the region, initialises the queue table and claims the interrupt.
    pub fn init(&self) -> Result<()> {
        let _ops = self.ops.lock();
        self.init_locked().map(|_| ())
    }

    /// Brings the link up. On failure the link is stopped and left `Faulted`.
    pub fn start(&self) -> Result<()> {
        let _ops = self.ops.lock();
        let link = self.init_locked()?;
        match self.bring_up(&link) {
            Ok(()) => {
                self.transition(LinkState::Started);
                Ok(())
            }
            Err(err) => {
                error!("hfi: start failed: {err}");
                self.stop_locked();
                self.transition(LinkState::Faulted);
                Err(err)
            }
        }
    }

    /// Closes the link. Messages still queued are reported and dropped; every
    /// waiting sender fails with `LinkStopped`.
    pub fn stop(&self) {
        let _ops = self.ops.lock();
        self.stop_locked();
    }

    /// Stops the link and gives back the interrupt line and shared region.
    pub fn deinit(&self) {
        let _ops = self.ops.lock();
        self.stop_locked();
        if let Some(link) = self.link.lock().take() {
            self.platform.irq.release();
            self.platform.allocator.release(link.table().memory());
        }
        self.transition(LinkState::Uninitialized);
    }

    fn init_locked(&self) -> Result<Arc<HfiLink>> {
        if let Some(link) = self.link.lock().clone() {
            return Ok(link);
        }
        let words = QueueTable::region_words(QUEUE_SLOTS, self.config.queue_words);
        let mem = match self.platform.allocator.allocate(words) {
            Ok(mem) => mem,
            Err(err) => {
                error!("hfi: unable to allocate {words} words of queue memory: {err}");
                self.transition(LinkState::Faulted);
                return Err(Error::Allocation(err));
            }
        };
        self.transition(LinkState::MemoryAllocated);

        let specs = QueueSpec::standard(self.config.legacy_layout, self.config.dispatch_queue);
        let table = match QueueTable::initialize(mem.clone(), &specs, self.config.queue_words, self.config.protocol())
        {
            Ok(table) => table,
            Err(err) => {
                error!("hfi: queue table init failed: {err}");
                self.unwind_allocation(&mem);
                return Err(err);
            }
        };
        let link = Arc::new(HfiLink::new(
            table,
            &self.config,
            self.platform.doorbell.clone(),
            self.platform.clock.clone(),
            self.platform.events.clone(),
        ));

        let weak: Weak<HfiLink> = Arc::downgrade(&link);
        let handler = Box::new(move |status: u32| {
            if let Some(link) = weak.upgrade() {
                link.on_interrupt(IrqStatus::from_raw(status));
            }
        });
        if let Err(err) = self.platform.irq.on_interrupt(handler) {
            error!("hfi: unable to claim interrupt: {err}");
            self.unwind_allocation(&mem);
            return Err(Error::Interrupt(err));
        }

        *self.link.lock() = Some(link.clone());
        self.transition(LinkState::QueuesInitialized);
        Ok(link)
    }

    fn unwind_allocation(&self, mem: &Arc<dyn SharedMemory>) {
        self.platform.allocator.release(mem);
        self.transition(LinkState::Faulted);
    }

    fn bring_up(&self, link: &HfiLink) -> Result<()> {
        for queue in link.table().enabled_queues() {
            if !queue.is_empty() {
                let (rd, wt) = queue.indices();
                warn!("hfi: queue {} is not empty: rd={rd} wt={wt}; resetting", queue.id().name());
                queue.resync();
            }
        }
        link.clear_fault();
        link.open();

        let long = self.config.long_op_timeout();
        if self.config.legacy_layout {
            let init = Request::Init {
                dbg_buffer_addr: self.config.dbg_buffer_addr,
                dbg_buffer_size: self.config.dbg_buffer_size,
            };
            link.send_request_timeout(&init.encode()?, long)?;
        }

        self.verify_version(link)?;
        self.transition(LinkState::VersionVerified);

        link.send_request_retrying(&Request::PerfTable(self.tables.perf.clone()).encode()?)?;
        link.send_request_retrying(&Request::BwTable(self.tables.bw.clone()).encode()?)?;
        if link.protocol().is_v2() {
            if let Some(acd) = &self.tables.acd {
                link.send_request_retrying(&Request::AcdTable(acd.clone()).encode()?)?;
                link.feature_ctrl(feature::ACD, true, 0)?;
            }
            if let Some(lm) = self.tables.lm {
                link.feature_ctrl(feature::LM, true, lm.throttle_mask)?;
                let slope = Request::SetValue { ty: value::LM_CS0, subtype: 0, data: lm.isense_slope };
                link.request(&slope).inspect_err(|err| error!("hfi: unable to set LM slope: {err}"))?;
            }
            link.send_request_timeout(&Request::CoreFwStart { handle: 0 }.encode()?, long)?;
        } else {
            if self.config.test_handshake {
                link.request(&Request::Test)?;
            }
            link.send_request_timeout(&Request::Start.encode()?, long)?;
        }
        Ok(())
    }

    fn verify_version(&self, link: &HfiLink) -> Result<()> {
        if let Some(version) = *self.fw_version.lock() {
            info!("hfi: firmware version {version:#010x} already verified");
            return Ok(());
        }
        let offer = Request::FwVersion { supported: self.config.fw_version_word() };
        let payload = link.transact(&offer.encode()?, self.config.long_op_timeout())?;
        let (status, version) = match payload[..] {
            [status, version, ..] => (status, version),
            _ => return Err(Error::MalformedMessage("short firmware version ack")),
        };
        if status != 0 {
            error!("hfi: firmware rejected version query with status {status:#x}");
            return Err(Error::RemoteError { code: status });
        }
        let expected = self.config.fw_major;
        if codec::version_major(version) != expected {
            error!("hfi: firmware version {version:#010x} does not match major {expected}");
            return Err(Error::VersionMismatch { expected, actual: version });
        }
        if codec::version_minor(version) < self.config.fw_minor {
            warn!(
                "hfi: firmware minor {} is older than expected {}",
                codec::version_minor(version),
                self.config.fw_minor
            );
        }
        info!("hfi: firmware version {version:#010x}");
        *self.fw_version.lock() = Some(version);
        Ok(())
    }

    fn stop_locked(&self) {
        let Some(link) = self.link.lock().clone() else {
            return;
        };
        if matches!(*self.state.lock(), LinkState::Stopped | LinkState::Uninitialized) {
            return;
        }
        self.transition(LinkState::Stopping);
        for queue in link.table().enabled_queues() {
            if !queue.is_empty() {
                let (rd, wt) = queue.indices();
                warn!("hfi: queue {} is not empty before close: rd={rd} wt={wt}", queue.id().name());
            }
        }
        let cancelled = link.close(&Error::LinkStopped);
        if cancelled > 0 {
            warn!("hfi: {cancelled} waiting request(s) cancelled by stop");
        }
        self.transition(LinkState::Stopped);
    }

    fn transition(&self, next: LinkState) {
        let mut state = self.state.lock();
        if *state != next {
            info!("hfi: link {:?} -> {next:?}", *state);
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::HostClock;
    use crate::events::LogSink;
    use gmu_hal::{HalError, HostAllocator, SoftIrqLine};

    struct NullDoorbell;

    impl Doorbell for NullDoorbell {
        fn notify(&self) {}
    }

    fn platform(allocator: Arc<HostAllocator>, irq: Arc<SoftIrqLine>) -> Platform {
        Platform {
            allocator,
            doorbell: Arc::new(NullDoorbell),
            irq,
            clock: Arc::new(HostClock::new()),
            events: Arc::new(LogSink),
        }
    }

    fn small() -> LinkConfig {
        LinkConfig { queue_words: 64, response_timeout_ms: 5, long_op_timeout_ms: 5, ..LinkConfig::default() }
    }

    #[test]
    fn init_claims_irq_and_lays_out_table() {
        let irq = Arc::new(SoftIrqLine::new());
        let alloc = Arc::new(HostAllocator::new(0x1000));
        let lc = LinkLifecycle::new(small(), platform(alloc.clone(), irq.clone()), StaticTables::default());
        lc.init().unwrap();
        lc.init().unwrap();
        assert_eq!(lc.state(), LinkState::QueuesInitialized);
        assert!(irq.is_claimed());
        assert_eq!(alloc.allocations(), 1);
        assert_eq!(lc.link().unwrap_err(), Error::NotStarted);

        lc.deinit();
        assert!(!irq.is_claimed());
        assert_eq!(alloc.allocations(), 0);
        assert_eq!(lc.state(), LinkState::Uninitialized);
    }

    #[test]
    fn allocation_failure_faults() {
        let alloc = Arc::new(HostAllocator::new(0x1000).with_limit(16));
        let lc = LinkLifecycle::new(small(), platform(alloc, Arc::new(SoftIrqLine::new())), StaticTables::default());
        let words = QueueTable::region_words(QUEUE_SLOTS, 64);
        assert_eq!(lc.init(), Err(Error::Allocation(HalError::OutOfMemory { requested: words })));
        assert_eq!(lc.state(), LinkState::Faulted);
    }

    #[test]
    fn busy_interrupt_line_unwinds() {
        let irq = Arc::new(SoftIrqLine::new());
        irq.on_interrupt(Box::new(|_| {})).unwrap();
        let alloc = Arc::new(HostAllocator::new(0x1000));
        let lc = LinkLifecycle::new(small(), platform(alloc.clone(), irq), StaticTables::default());
        for _ in 0..3 {
            assert_eq!(lc.init(), Err(Error::Interrupt(HalError::IrqBusy)));
            assert_eq!(alloc.allocations(), 0);
        }
        assert_eq!(lc.state(), LinkState::Faulted);
        assert!(lc.link.lock().is_none());
    }

    #[test]
    fn rejected_geometry_returns_the_region() {
        let alloc = Arc::new(HostAllocator::new(0x1000));
        let config = LinkConfig { queue_words: 3, ..small() };
        let lc = LinkLifecycle::new(config, platform(alloc.clone(), Arc::new(SoftIrqLine::new())), StaticTables::default());
        assert!(lc.init().is_err());
        assert_eq!(lc.state(), LinkState::Faulted);
        assert_eq!(alloc.allocations(), 0);
    }

    #[test]
    fn start_without_firmware_times_out_and_faults() {
        let lc = LinkLifecycle::new(
            small(),
            platform(Arc::new(HostAllocator::new(0x1000)), Arc::new(SoftIrqLine::new())),
            StaticTables::default(),
        );
        assert_eq!(lc.start(), Err(Error::Timeout));
        assert_eq!(lc.state(), LinkState::Faulted);
        assert_eq!(lc.fw_version(), None);
        assert!(lc.link().is_err());
    }
}
