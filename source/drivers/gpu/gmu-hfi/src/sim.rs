// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process firmware endpoint for host tests and tooling
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Exercised by tests/link.rs, tests/lifecycle.rs and tools/hfi-sim
//!
//! `SimFirmware` plays the remote side of the link. It owns the memory window
//! (it is the link's `RegionAllocator`), exposes a tiny register file on `Bus`
//! so that a `RegisterDoorbell` write services the command queue synchronously,
//! and raises the host interrupt through a `SoftIrqLine`.
//!
//! Behaviour is driven by a [`FirmwareModel`]: firmware version, per-id status
//! overrides and canned replies, ids that are never acknowledged, reversed ack
//! order per batch, and holding acks until the test releases them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gmu_hal::{
    Bus, HostAllocator, RegionAllocator, RegisterDoorbell, SharedMemory, SoftIrqLine, WordRegion,
};
use log::{trace, warn};
use parking_lot::Mutex;

use crate::budget::HostClock;
use crate::codec::{self, id, ty, ProtocolVersion, MAX_MSG_WORDS};
use crate::events::LogSink;
use crate::irq::IrqStatus;
use crate::lifecycle::Platform;
use crate::table::{QueueId, QueueTable};
use crate::{Error, Result};

/// Host-to-firmware doorbell register.
pub const REG_HOST2GMU_INTR_SET: usize = 0;
/// Firmware-to-host interrupt clear register.
pub const REG_GMU2HOST_INTR_CLR: usize = 1;
/// Firmware-to-host interrupt status register.
pub const REG_GMU2HOST_INTR_INFO: usize = 2;

/// Device address the simulated memory window starts at.
pub const SIM_DEVICE_BASE: u32 = 0x6000_0000;

/// Doorbell that rings the simulated firmware.
pub type SimDoorbell = RegisterDoorbell<Arc<SimFirmware>>;

/// How the simulated firmware answers.
#[derive(Clone, Debug)]
pub struct FirmwareModel {
    pub protocol: ProtocolVersion,
    /// Version word returned for FW_VER.
    pub version: u32,
    /// Status word per message id; default 0.
    pub status: HashMap<u8, u32>,
    /// Full ack payload per message id, replacing the default.
    pub replies: HashMap<u8, Vec<u32>>,
    /// Ids consumed without an ack.
    pub silent: HashSet<u8>,
    /// Acks of one service pass are published newest first.
    pub reverse_batches: bool,
    /// Acks are kept until [`SimFirmware::release_held`].
    pub hold_acks: bool,
    /// Raise the host interrupt after publishing; otherwise the host must poll.
    pub interrupts: bool,
}

impl Default for FirmwareModel {
    fn default() -> Self {
        Self::for_protocol(ProtocolVersion::V2)
    }
}

impl FirmwareModel {
    /// Firmware whose version matches `protocol`'s major.
    pub fn for_protocol(protocol: ProtocolVersion) -> Self {
        Self {
            protocol,
            version: codec::version_word(u32::from(protocol.major), 0),
            status: HashMap::new(),
            replies: HashMap::new(),
            silent: HashSet::new(),
            reverse_batches: false,
            hold_acks: false,
            interrupts: true,
        }
    }

    fn ack_for(&self, cmd: &[u32]) -> Option<Vec<u32>> {
        let hdr = cmd[0];
        let msg_id = codec::msg_id(hdr);
        if self.silent.contains(&msg_id) {
            return None;
        }
        let status = self.status.get(&msg_id).copied().unwrap_or(0);
        let payload = match self.replies.get(&msg_id) {
            Some(words) => words.clone(),
            None if msg_id == id::H2F_FW_VER => vec![status, self.version],
            // Echo the query so callers can check which request was answered.
            None if msg_id == id::H2F_GET_VALUE => cmd[1..].to_vec(),
            None => vec![status],
        };
        Some(ack_message(self.protocol, hdr, &payload))
    }
}

/// Builds an ack for `req_hdr` as the firmware would.
pub fn ack_message(protocol: ProtocolVersion, req_hdr: u32, payload: &[u32]) -> Vec<u32> {
    let mut msg = Vec::with_capacity(payload.len() + 2);
    msg.push(codec::header_for_words(id::F2H_ACK, payload.len() + 2, protocol.ack_type()));
    msg.push(req_hdr);
    msg.extend_from_slice(payload);
    msg
}

/// Simulated remote processor.
pub struct SimFirmware {
    memory: HostAllocator,
    irq: Arc<SoftIrqLine>,
    model: Mutex<FirmwareModel>,
    consumer: Mutex<()>,
    producer: Mutex<()>,
    received: Mutex<Vec<Vec<u32>>>,
    held: Mutex<Vec<Vec<u32>>>,
    intr_info: AtomicU32,
}

impl SimFirmware {
    pub fn new(model: FirmwareModel) -> Arc<Self> {
        Arc::new(Self {
            memory: HostAllocator::new(SIM_DEVICE_BASE),
            irq: Arc::new(SoftIrqLine::new()),
            model: Mutex::new(model),
            consumer: Mutex::new(()),
            producer: Mutex::new(()),
            received: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            intr_info: AtomicU32::new(0),
        })
    }

    pub fn irq_line(&self) -> Arc<SoftIrqLine> {
        self.irq.clone()
    }

    pub fn doorbell(self: &Arc<Self>) -> SimDoorbell {
        RegisterDoorbell::new(self.clone(), REG_HOST2GMU_INTR_SET, 1)
    }

    /// Collaborators for a [`crate::LinkLifecycle`] talking to this firmware.
    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform {
            allocator: self.clone(),
            doorbell: Arc::new(self.doorbell()),
            irq: self.irq_line(),
            clock: Arc::new(HostClock::new()),
            events: Arc::new(LogSink),
        }
    }

    /// Region most recently handed to the host.
    pub fn region(&self) -> Option<Arc<WordRegion>> {
        self.memory.last()
    }

    /// Regions the host currently holds.
    pub fn allocations(&self) -> usize {
        self.memory.allocations()
    }

    /// Attaches to the queue table the host initialised.
    pub fn table(&self) -> Result<QueueTable> {
        let region = self.region().ok_or(Error::NotStarted)?;
        let protocol = self.model.lock().protocol;
        QueueTable::attach(region as Arc<dyn SharedMemory>, protocol)
    }

    /// Adjusts the model in place.
    pub fn with_model<R>(&self, f: impl FnOnce(&mut FirmwareModel) -> R) -> R {
        f(&mut self.model.lock())
    }

    /// Every command consumed so far, header first.
    pub fn received(&self) -> Vec<Vec<u32>> {
        self.received.lock().clone()
    }

    pub fn received_ids(&self) -> Vec<u8> {
        self.received.lock().iter().map(|cmd| codec::msg_id(cmd[0])).collect()
    }

    pub fn held_len(&self) -> usize {
        self.held.lock().len()
    }

    /// Consumes the command queue and answers it. Returns commands consumed.
    pub fn service(&self) -> Result<usize> {
        let table = self.table()?;
        let model = self.model.lock().clone();
        let mut acks = Vec::new();
        let mut consumed = 0;
        {
            let _consumer = self.consumer.lock();
            let queue = table.queue(QueueId::Command)?;
            let mut buf = [0u32; MAX_MSG_WORDS];
            loop {
                match queue.read(&mut buf) {
                    Ok(words) => {
                        let cmd = buf[..words].to_vec();
                        trace!("hfi-sim: command {:#010x}", cmd[0]);
                        acks.extend(model.ack_for(&cmd));
                        self.received.lock().push(cmd);
                        consumed += 1;
                    }
                    Err(Error::Empty) => break,
                    Err(err) => return Err(err),
                }
            }
        }
        if model.reverse_batches {
            acks.reverse();
        }
        if model.hold_acks {
            self.held.lock().extend(acks);
            return Ok(consumed);
        }
        self.publish(&table, QueueId::Message, &acks, model.interrupts)?;
        Ok(consumed)
    }

    /// Publishes held acks after `order` has arranged them.
    pub fn release_held(&self, order: impl FnOnce(&mut Vec<Vec<u32>>)) -> Result<usize> {
        let mut acks = std::mem::take(&mut *self.held.lock());
        order(&mut acks);
        let table = self.table()?;
        let interrupts = self.model.lock().interrupts;
        self.publish(&table, QueueId::Message, &acks, interrupts)?;
        Ok(acks.len())
    }

    /// Posts an ack for `req_hdr` carrying `payload`.
    pub fn post_ack(&self, req_hdr: u32, payload: &[u32]) -> Result<()> {
        let protocol = self.model.lock().protocol;
        self.post(QueueId::Message, ack_message(protocol, req_hdr, payload))
    }

    /// Posts an F2H_MSG_ERR with `text` packed as NUL-terminated bytes.
    pub fn post_error(&self, code: u32, text: &str) -> Result<()> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let mut msg = vec![0, code];
        msg.extend(bytes.chunks(4).map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        }));
        msg[0] = codec::header_for_words(id::F2H_ERR, msg.len(), ty::CMD);
        self.post(QueueId::Message, msg)
    }

    /// Posts an F2H_MSG_DEBUG on the debug queue.
    pub fn post_debug(&self, debug_ty: u32, timestamp: u32, data: u32) -> Result<()> {
        let msg = vec![codec::header_for_words(id::F2H_DEBUG, 4, ty::CMD), debug_ty, timestamp, data];
        self.post(QueueId::Debug, msg)
    }

    /// Raises the host interrupt with an arbitrary status word.
    pub fn raise(&self, status: IrqStatus) -> bool {
        self.intr_info.fetch_or(status.bits(), Ordering::AcqRel);
        self.irq.raise(status.bits())
    }

    fn post(&self, queue: QueueId, msg: Vec<u32>) -> Result<()> {
        let table = self.table()?;
        let interrupts = self.model.lock().interrupts;
        self.publish(&table, queue, &[msg], interrupts)
    }

    fn publish(&self, table: &QueueTable, id: QueueId, msgs: &[Vec<u32>], interrupt: bool) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        {
            let _producer = self.producer.lock();
            let queue = table.queue(id)?;
            for msg in msgs {
                queue.write(msg)?;
            }
        }
        gmu_hal::wmb();
        let bit = if id == QueueId::Debug { IrqStatus::DBGQ } else { IrqStatus::MSGQ };
        self.intr_info.fetch_or(bit.bits(), Ordering::AcqRel);
        if interrupt {
            self.irq.raise(bit.bits());
        }
        Ok(())
    }
}

impl RegionAllocator for SimFirmware {
    fn allocate(&self, len_words: usize) -> gmu_hal::Result<Arc<dyn SharedMemory>> {
        self.memory.allocate(len_words)
    }

    fn release(&self, region: &Arc<dyn SharedMemory>) {
        self.memory.release(region)
    }
}

impl Bus for SimFirmware {
    fn read(&self, offset: usize) -> u32 {
        match offset {
            REG_GMU2HOST_INTR_INFO => self.intr_info.load(Ordering::Acquire),
            _ => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        match offset {
            REG_HOST2GMU_INTR_SET if value & 1 != 0 => {
                if let Err(err) = self.service() {
                    warn!("hfi-sim: command service failed: {err}");
                }
            }
            REG_GMU2HOST_INTR_CLR => {
                self.intr_info.fetch_and(!value, Ordering::AcqRel);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::QueueSpec;
    use gmu_hal::{Doorbell, InterruptLine};

    fn attached(model: FirmwareModel) -> (Arc<SimFirmware>, QueueTable) {
        let fw = SimFirmware::new(model);
        let mem = fw.allocate(QueueTable::region_words(4, 64)).unwrap();
        let host = QueueTable::initialize(mem, &QueueSpec::standard(false, false), 64, ProtocolVersion::V2)
            .unwrap();
        (fw, host)
    }

    #[test]
    fn answers_fw_version_with_status_and_version() {
        let (fw, host) = attached(FirmwareModel::default());
        let cmd = codec::set_sequence(codec::header_for_words(id::H2F_FW_VER, 2, ty::CMD), 3);
        host.queue(QueueId::Command).unwrap().write(&[cmd, 0x2000_0000]).unwrap();
        fw.doorbell().notify();

        let mut out = [0u32; 8];
        let words = host.queue(QueueId::Message).unwrap().read(&mut out).unwrap();
        assert_eq!(&out[..words], &[codec::header_for_words(id::F2H_ACK, 4, ty::ACK), cmd, 0, 0x2000_0000]);
        assert_eq!(fw.received_ids(), vec![id::H2F_FW_VER]);
        assert_eq!(fw.read(REG_GMU2HOST_INTR_INFO) & IrqStatus::MSGQ.bits(), 1);
        fw.write(REG_GMU2HOST_INTR_CLR, IrqStatus::MSGQ.bits());
        assert_eq!(fw.read(REG_GMU2HOST_INTR_INFO), 0);
    }

    #[test]
    fn silent_ids_and_held_acks() {
        let mut model = FirmwareModel::default();
        model.silent.insert(id::H2F_TEST);
        model.hold_acks = true;
        let (fw, host) = attached(model);
        let cmd = host.queue(QueueId::Command).unwrap();
        cmd.write(&[codec::header_for_words(id::H2F_TEST, 1, ty::CMD)]).unwrap();
        cmd.write(&[codec::header_for_words(id::H2F_START, 1, ty::CMD)]).unwrap();
        assert_eq!(fw.service().unwrap(), 2);
        assert_eq!(fw.held_len(), 1);
        assert!(host.queue(QueueId::Message).unwrap().is_empty());
        assert_eq!(fw.release_held(|_| {}).unwrap(), 1);
        assert!(!host.queue(QueueId::Message).unwrap().is_empty());
    }

    #[test]
    fn posts_raise_the_matching_interrupt() {
        let (fw, _host) = attached(FirmwareModel::default());
        let seen = Arc::new(AtomicU32::new(0));
        let sink = seen.clone();
        fw.irq_line().on_interrupt(Box::new(move |status| {
            sink.fetch_or(status, Ordering::SeqCst);
        }))
        .unwrap();
        fw.post_debug(1, 2, 3).unwrap();
        fw.post_error(7, "bad").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), (IrqStatus::DBGQ | IrqStatus::MSGQ).bits());
    }

    #[test]
    fn v1_acks_use_v1_type() {
        let ack = ack_message(ProtocolVersion::V1, 0x10, &[0]);
        assert_eq!(codec::msg_type(ack[0]), ty::V1_ACK);
        assert_eq!(codec::size_words(ack[0]), 3);
    }
}
