// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Request/ack transport over the command and message queues
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (host), tests/link.rs
//!
//! Any number of threads may send at once. Every outgoing command gets the next
//! 12-bit sequence number; acks are matched on the echoed request header only,
//! never on arrival order. The message queue has one consumer at a time: the
//! interrupt path, or a waiting sender that drains it itself between poll slices
//! when no interrupt arrives.
//!
//! A fatal condition (core fault interrupt, corrupt ring index, or a timeout
//! while `fault_on_timeout` is set) raises the fault flag. Every later call
//! fails with `Error::DeviceFaulted` until the lifecycle restarts the link.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gmu_hal::Doorbell;
use log::{error, trace, warn};
use parking_lot::Mutex;

use crate::budget::{self, Clock};
use crate::cmd::{self, Request};
use crate::codec::{self, ProtocolVersion, ACK_ERROR, MAX_RCVD_PAYLOAD_WORDS, MAX_RCVD_WORDS};
use crate::config::LinkConfig;
use crate::events::{EventSink, FirmwareEvent};
use crate::irq::IrqStatus;
use crate::pending::{PendingRequest, PendingTable};
use crate::table::{QueueId, QueueTable};
use crate::{Error, Result};

/// Counters exposed for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub acked: u64,
    pub timeouts: u64,
    pub unmatched: u64,
    pub events: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    acked: AtomicU64,
    timeouts: AtomicU64,
    unmatched: AtomicU64,
    events: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug)]
struct Timing {
    response: Duration,
    poll: Duration,
    busy: Duration,
    fault_on_timeout: bool,
}

/// One host-firmware link over an initialised [`QueueTable`].
pub struct HfiLink {
    table: QueueTable,
    protocol: ProtocolVersion,
    timing: Timing,
    doorbell: Arc<dyn Doorbell>,
    clock: Arc<dyn Clock + Send + Sync>,
    events: Arc<dyn EventSink>,
    seqnum: AtomicU32,
    pending: PendingTable,
    tx: Mutex<()>,
    rx: Mutex<()>,
    dbg: Mutex<()>,
    faulted: AtomicBool,
    open: AtomicBool,
    counters: Counters,
}

impl HfiLink {
    /// Builds a closed link; call [`HfiLink::open`] before sending.
    pub fn new(
        table: QueueTable,
        config: &LinkConfig,
        doorbell: Arc<dyn Doorbell>,
        clock: Arc<dyn Clock + Send + Sync>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            table,
            protocol: config.protocol(),
            timing: Timing {
                response: config.response_timeout(),
                poll: config.poll_interval(),
                busy: config.busy_budget(),
                fault_on_timeout: config.fault_on_timeout,
            },
            doorbell,
            clock,
            events,
            seqnum: AtomicU32::new(0),
            pending: PendingTable::new(),
            tx: Mutex::new(()),
            rx: Mutex::new(()),
            dbg: Mutex::new(()),
            faulted: AtomicBool::new(false),
            open: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn table(&self) -> &QueueTable {
        &self.table
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Next sequence number; the first one handed out is 1.
    pub fn next_sequence(&self) -> u16 {
        (self.seqnum.fetch_add(1, Ordering::AcqRel).wrapping_add(1) & codec::SEQ_MASK) as u16
    }

    /// Sends `cmd` and waits up to the configured response timeout for its ack.
    ///
    /// Returns the ack payload (the words after the echoed request header).
    /// A first payload word of `0xFFFFFFFF` is reported as `RemoteError`.
    pub fn send_request(&self, cmd: &[u32]) -> Result<Vec<u32>> {
        self.send_request_timeout(cmd, self.timing.response)
    }

    pub fn send_request_timeout(&self, cmd: &[u32], timeout: Duration) -> Result<Vec<u32>> {
        let payload = self.exchange(cmd, timeout, false)?;
        check_status(cmd, &payload)?;
        Ok(payload)
    }

    /// Like [`HfiLink::send_request`], but retries while the command queue is
    /// full, for up to the configured busy budget.
    pub fn send_request_retrying(&self, cmd: &[u32]) -> Result<Vec<u32>> {
        let payload = self.exchange(cmd, self.timing.response, true)?;
        check_status(cmd, &payload)?;
        Ok(payload)
    }

    /// Sends `cmd` and returns the raw ack payload without interpreting it.
    pub fn transact(&self, cmd: &[u32], timeout: Duration) -> Result<Vec<u32>> {
        self.exchange(cmd, timeout, false)
    }

    /// Writes `cmd` without waiting for an ack. Returns the sequence used.
    pub fn send_fire_and_forget(&self, cmd: &[u32]) -> Result<u16> {
        self.ensure_usable()?;
        let mut msg = validate(cmd)?;
        let seq = self.next_sequence();
        msg[0] = codec::set_sequence(msg[0], seq);
        self.write_command(&msg, false)?;
        Ok(seq)
    }

    /// Encodes and sends a typed request, returning its ack payload.
    ///
    /// For `GetValue` the payload is trimmed to the at most 16 data words.
    pub fn request(&self, req: &Request) -> Result<Vec<u32>> {
        let msg = req.encode()?;
        let mut payload = self.send_request(&msg)?;
        if let Request::GetValue { .. } = req {
            payload.truncate(MAX_RCVD_PAYLOAD_WORDS);
        }
        Ok(payload)
    }

    /// FEATURE_CTRL with a logged failure naming the feature.
    pub fn feature_ctrl(&self, feature: u32, enable: bool, data: u32) -> Result<()> {
        self.request(&Request::FeatureCtrl { feature, enable, data })
            .map(|_| ())
            .inspect_err(|err| {
                error!(
                    "hfi: unable to {} feature {} ({feature}): {err}",
                    if enable { "enable" } else { "disable" },
                    cmd::feature::name(feature)
                )
            })
    }

    /// Handles a firmware-to-host interrupt.
    pub fn on_interrupt(&self, status: IrqStatus) {
        if status.contains(IrqStatus::DBGQ) {
            if let Err(err) = self.process_queue(QueueId::Debug) {
                self.report_drain_error(QueueId::Debug, &err);
            }
        }
        if status.has_messages() {
            if let Err(err) = self.drain_messages() {
                self.report_drain_error(QueueId::Message, &err);
            }
        }
        if status.contains(IrqStatus::CM3_FAULT) {
            error!("hfi: GMU CM3 fault interrupt received");
            self.raise_fault();
            self.events.deliver(FirmwareEvent::Fault);
        }
        let unhandled = status.unhandled();
        if !unhandled.is_empty() {
            warn!("hfi: unhandled interrupts {:#x}", unhandled.bits());
        }
    }

    /// Reads every pending message and dispatches it. Returns how many were read.
    pub fn drain_messages(&self) -> Result<usize> {
        self.process_queue(QueueId::Message)
    }

    /// Reads every pending debug-queue message and logs it.
    pub fn drain_debug(&self) -> Result<usize> {
        self.process_queue(QueueId::Debug)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Sets the fault flag and fails every waiting sender.
    pub fn raise_fault(&self) {
        self.faulted.store(true, Ordering::Release);
        self.pending.cancel_all(&Error::DeviceFaulted);
    }

    pub fn clear_fault(&self) {
        self.faulted.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Rejects new sends and fails every waiting sender with `reason`.
    pub fn close(&self, reason: &Error) -> usize {
        self.open.store(false, Ordering::Release);
        self.pending.cancel_all(reason)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.counters;
        LinkStats {
            sent: c.sent.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            events: c.events.load(Ordering::Relaxed),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_faulted() {
            return Err(Error::DeviceFaulted);
        }
        if !self.is_open() {
            return Err(Error::LinkStopped);
        }
        Ok(())
    }

    fn exchange(&self, cmd: &[u32], timeout: Duration, retry_busy: bool) -> Result<Vec<u32>> {
        self.ensure_usable()?;
        let mut msg = validate(cmd)?;
        let seq = self.next_sequence();
        msg[0] = codec::set_sequence(msg[0], seq);

        let waiter = self.pending.register(msg[0])?;
        let result = self
            .write_command(&msg, retry_busy)
            .and_then(|()| self.wait_ack(&waiter, timeout));
        self.pending.remove(seq);
        result
    }

    fn write_command(&self, msg: &[u32], retry_busy: bool) -> Result<()> {
        let write = || {
            let _tx = self.tx.lock();
            self.table.queue(QueueId::Command)?.write(msg)
        };
        if retry_busy {
            budget::retry_while_busy(self.clock.as_ref(), self.timing.busy, write)?;
        } else {
            write()?;
        }

        let fields = codec::unpack(msg[0]);
        trace!("hfi: send id={} size={} seq={}", fields.id, fields.size_words, fields.seq);
        Counters::bump(&self.counters.sent);
        gmu_hal::wmb();
        self.doorbell.notify();
        Ok(())
    }

    fn wait_ack(&self, waiter: &PendingRequest, timeout: Duration) -> Result<Vec<u32>> {
        let deadline = budget::deadline_after(self.clock.as_ref(), timeout);
        loop {
            if let Some(outcome) = waiter.try_take() {
                return outcome;
            }
            if self.is_faulted() {
                return Err(Error::DeviceFaulted);
            }
            self.poll_messages();
            if let Some(outcome) = waiter.try_take() {
                return outcome;
            }

            let now = self.clock.now_ns();
            if now >= deadline {
                // The interrupt path may have completed it since the last check.
                return waiter.try_take().unwrap_or_else(|| Err(self.timed_out(waiter.sent_hdr())));
            }
            let left = Duration::from_nanos(deadline - now);
            if let Some(outcome) = waiter.wait_for(left.min(self.timing.poll)) {
                return outcome;
            }
        }
    }

    /// Drains the message queue unless another thread already is.
    fn poll_messages(&self) {
        let Some(_rx) = self.rx.try_lock() else {
            return;
        };
        if let Err(err) = self.drain_locked(QueueId::Message) {
            self.report_drain_error(QueueId::Message, &err);
        }
    }

    fn timed_out(&self, sent_hdr: u32) -> Error {
        let fields = codec::unpack(sent_hdr);
        error!(
            "hfi: timed out waiting on ack for {sent_hdr:#010x} (id {} {}, sequence {})",
            fields.id,
            codec::id::name(fields.id),
            fields.seq
        );
        Counters::bump(&self.counters.timeouts);
        if self.timing.fault_on_timeout {
            self.raise_fault();
        }
        Error::Timeout
    }

    fn process_queue(&self, id: QueueId) -> Result<usize> {
        let lock = match id {
            QueueId::Debug => &self.dbg,
            _ => &self.rx,
        };
        let _consumer = lock.lock();
        self.drain_locked(id)
    }

    fn drain_locked(&self, id: QueueId) -> Result<usize> {
        let queue = self.table.queue(id)?;
        let mut rcvd = [0u32; MAX_RCVD_WORDS];
        let mut handled = 0;
        loop {
            match queue.read(&mut rcvd) {
                Ok(words) => {
                    handled += 1;
                    let fields = codec::unpack(rcvd[0]);
                    trace!("hfi: receive id={} size={} seq={}", fields.id, fields.size_words, fields.seq);
                    self.dispatch(&rcvd[..words]);
                }
                Err(Error::Empty) => return Ok(handled),
                Err(err) => return Err(err),
            }
        }
    }

    fn dispatch(&self, msg: &[u32]) {
        let hdr = msg[0];
        if codec::msg_type(hdr) == self.protocol.ack_type() {
            self.receive_ack(msg);
            return;
        }
        Counters::bump(&self.counters.events);
        self.events.deliver(FirmwareEvent::decode(msg));
    }

    fn receive_ack(&self, msg: &[u32]) {
        let Some(&req_hdr) = msg.get(1) else {
            error!("hfi: ack {:#010x} without request header", msg[0]);
            return;
        };
        if self.pending.complete(req_hdr, &msg[2..]) {
            Counters::bump(&self.counters.acked);
            return;
        }
        error!(
            "hfi: ack {:#010x} for request {req_hdr:#010x} has no waiting sender",
            msg[0]
        );
        Counters::bump(&self.counters.unmatched);
        self.events.deliver(FirmwareEvent::UnmatchedAck { req_hdr });
    }

    fn report_drain_error(&self, id: QueueId, err: &Error) {
        if err.is_transient() {
            return;
        }
        error!("hfi: {} queue read failed: {err}", id.name());
        if matches!(err, Error::IndexOutOfRange { .. }) {
            self.raise_fault();
        }
    }
}

impl core::fmt::Debug for HfiLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HfiLink")
            .field("protocol", &self.protocol)
            .field("open", &self.is_open())
            .field("faulted", &self.is_faulted())
            .field("pending", &self.pending_len())
            .finish()
    }
}

fn validate(cmd: &[u32]) -> Result<Vec<u32>> {
    let Some(&hdr) = cmd.first() else {
        return Err(Error::InvalidArgument("empty command"));
    };
    if codec::size_words(hdr) != cmd.len() {
        return Err(Error::InvalidArgument("command header size disagrees with its length"));
    }
    Ok(cmd.to_vec())
}

fn check_status(cmd: &[u32], payload: &[u32]) -> Result<()> {
    if payload.first() == Some(&ACK_ERROR) {
        error!("hfi: ack failure: request {:#010x}", cmd[0]);
        return Err(Error::RemoteError { code: ACK_ERROR });
    }
    Ok(())
}
