// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Queue table directory at the start of the shared region
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (host)
//!
//! Region layout (words):
//!
//! ```text
//! 0                 6              6 + 12*n        16-byte boundary
//! +-----------------+--------------+------...------+----------+----------+---
//! | table header    | queue hdr 0  | queue hdr n-1 | ring 0   | ring 1   | ...
//! +-----------------+--------------+------...------+----------+----------+---
//! ```
//!
//! Queue headers are written in slot order; the remote side identifies slot
//! `i` by position, so slots follow `QueueId::ALL` order.

use std::sync::Arc;

use gmu_hal::SharedMemory;

use crate::codec::ProtocolVersion;
use crate::queue::{hdr, RingQueue, QUEUE_DISABLED, QUEUE_ENABLED};
use crate::{Error, Result};

/// Words in the table header.
pub const TABLE_HEADER_WORDS: usize = 6;
/// Words in each queue header.
pub const QUEUE_HEADER_WORDS: usize = 12;
/// Maximum number of queues a table describes.
pub const QUEUE_SLOTS: usize = 4;
/// Default ring size: 4 KiB.
pub const DEFAULT_QUEUE_WORDS: usize = 1024;

const TABLE_VERSION: u32 = 0;
const BODY_ALIGN_WORDS: usize = 4;

mod tbl {
    pub const VERSION: usize = 0;
    pub const SIZE: usize = 1;
    pub const QHDR0_OFFSET: usize = 2;
    pub const QHDR_SIZE: usize = 3;
    pub const NUM_Q: usize = 4;
    pub const NUM_ACTIVE_Q: usize = 5;
}

/// Logical queue identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueId {
    /// Host to firmware commands.
    Command,
    /// Firmware to host acks and events.
    Message,
    /// Firmware debug output.
    Debug,
    /// First dispatch queue.
    Dispatch,
}

impl QueueId {
    /// Slot order inside the table.
    pub const ALL: [QueueId; QUEUE_SLOTS] =
        [QueueId::Command, QueueId::Message, QueueId::Debug, QueueId::Dispatch];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Message => "message",
            Self::Debug => "debug",
            Self::Dispatch => "dispatch",
        }
    }

    /// Hardware index written into the header type word.
    pub const fn hw_index(self, legacy: bool) -> u8 {
        match (self, legacy) {
            (Self::Command, _) => 0,
            (Self::Message, false) => 1,
            (Self::Debug, false) => 2,
            (Self::Dispatch, false) => 3,
            (Self::Message, true) => 4,
            (Self::Debug, true) => 5,
            (Self::Dispatch, true) => 1,
        }
    }

    pub const fn priority(self) -> u8 {
        match self {
            Self::Command | Self::Message => 10,
            Self::Debug => 40,
            Self::Dispatch => 20,
        }
    }
}

/// Per-queue parameters used by [`QueueTable::initialize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub id: QueueId,
    pub hw_index: u8,
    pub priority: u8,
    pub enabled: bool,
}

impl QueueSpec {
    pub const fn new(id: QueueId, legacy: bool, enabled: bool) -> Self {
        Self { id, hw_index: id.hw_index(legacy), priority: id.priority(), enabled }
    }

    /// The standard four slots; the dispatch queue is enabled on request only.
    pub fn standard(legacy: bool, dispatch: bool) -> [QueueSpec; QUEUE_SLOTS] {
        [
            Self::new(QueueId::Command, legacy, true),
            Self::new(QueueId::Message, legacy, true),
            Self::new(QueueId::Debug, legacy, true),
            Self::new(QueueId::Dispatch, legacy, dispatch),
        ]
    }

    /// Type word: index, priority, then two zero bytes of read/submit type.
    pub const fn type_word(&self) -> u32 {
        self.hw_index as u32 | ((self.priority as u32) << 8)
    }
}

/// Table header as stored in shared memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableHeader {
    pub version: u32,
    pub size_words: u32,
    pub qhdr0_offset: u32,
    pub qhdr_size: u32,
    pub num_q: u32,
    pub num_active_q: u32,
}

/// Snapshot of one queue header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueHeader {
    pub status: u32,
    pub start_addr: u32,
    pub ty: u32,
    pub queue_size: u32,
    pub msg_size: u32,
    pub read_index: u32,
    pub write_index: u32,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    id: QueueId,
    header: usize,
    body: usize,
    capacity: usize,
}

/// Directory of queues over one shared region.
pub struct QueueTable {
    mem: Arc<dyn SharedMemory>,
    slots: Vec<Slot>,
    aligned: bool,
}

impl QueueTable {
    /// Words needed for a table of `num_q` queues of `queue_words` each.
    pub const fn region_words(num_q: usize, queue_words: usize) -> usize {
        body_offset(num_q) + num_q * queue_words
    }

    /// Lays out a fresh table in `mem`: header, one queue header per `QueueSpec` in
    /// order, rings placed back to back after a 16-byte aligned table.
    pub fn initialize(
        mem: Arc<dyn SharedMemory>,
        specs: &[QueueSpec],
        queue_words: usize,
        protocol: ProtocolVersion,
    ) -> Result<Self> {
        let num_q = specs.len();
        if num_q == 0 || num_q > QUEUE_SLOTS {
            return Err(Error::InvalidArgument("queue count must be 1..=4"));
        }
        if queue_words < 8 || queue_words % BODY_ALIGN_WORDS != 0 {
            return Err(Error::InvalidArgument("queue size must be a multiple of 4 words, at least 8"));
        }
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|other| other.id == spec.id) {
                return Err(Error::InvalidArgument("duplicate queue id"));
            }
        }
        if mem.len_words() < Self::region_words(num_q, queue_words) {
            return Err(Error::InvalidArgument("shared region too small for queue table"));
        }

        let table_words = TABLE_HEADER_WORDS + num_q * QUEUE_HEADER_WORDS;
        mem.store(tbl::VERSION, TABLE_VERSION);
        mem.store(tbl::SIZE, table_words as u32);
        mem.store(tbl::QHDR0_OFFSET, TABLE_HEADER_WORDS as u32);
        mem.store(tbl::QHDR_SIZE, QUEUE_HEADER_WORDS as u32);
        mem.store(tbl::NUM_Q, num_q as u32);
        mem.store(tbl::NUM_ACTIVE_Q, num_q as u32);

        let base = body_offset(num_q);
        let mut slots = Vec::with_capacity(num_q);
        for (i, spec) in specs.iter().enumerate() {
            let header = TABLE_HEADER_WORDS + i * QUEUE_HEADER_WORDS;
            let body = base + i * queue_words;
            for word in 0..QUEUE_HEADER_WORDS {
                mem.store(header + word, 0);
            }
            let start = mem.device_addr().wrapping_add((body * 4) as u32);
            mem.store(header + hdr::START_ADDR, start);
            mem.store(header + hdr::TYPE, spec.type_word());
            mem.store(header + hdr::QUEUE_SIZE, queue_words as u32);
            mem.store(header + hdr::MSG_SIZE, 0);
            mem.store(header + hdr::STATUS, if spec.enabled { QUEUE_ENABLED } else { QUEUE_DISABLED });
            slots.push(Slot { id: spec.id, header, body, capacity: queue_words });
        }

        Ok(Self { mem, slots, aligned: protocol.aligned_framing() })
    }

    /// Re-derives the layout from an already initialised region, as the remote
    /// side does.
    pub fn attach(mem: Arc<dyn SharedMemory>, protocol: ProtocolVersion) -> Result<Self> {
        let len = mem.len_words();
        if len < TABLE_HEADER_WORDS {
            return Err(Error::CorruptTable("region smaller than table header"));
        }
        let num_q = mem.load(tbl::NUM_Q) as usize;
        if num_q == 0 || num_q > QUEUE_SLOTS {
            return Err(Error::CorruptTable("queue count"));
        }
        if mem.load(tbl::QHDR0_OFFSET) as usize != TABLE_HEADER_WORDS
            || mem.load(tbl::QHDR_SIZE) as usize != QUEUE_HEADER_WORDS
            || mem.load(tbl::SIZE) as usize != TABLE_HEADER_WORDS + num_q * QUEUE_HEADER_WORDS
        {
            return Err(Error::CorruptTable("header geometry"));
        }
        if len < body_offset(num_q) {
            return Err(Error::CorruptTable("region smaller than queue headers"));
        }

        let mut slots = Vec::with_capacity(num_q);
        for (i, id) in QueueId::ALL.iter().copied().take(num_q).enumerate() {
            let header = TABLE_HEADER_WORDS + i * QUEUE_HEADER_WORDS;
            let capacity = mem.load(header + hdr::QUEUE_SIZE) as usize;
            let offset = mem.load(header + hdr::START_ADDR).wrapping_sub(mem.device_addr()) as usize;
            if capacity == 0 || offset % 4 != 0 {
                return Err(Error::CorruptTable("queue geometry"));
            }
            let body = offset / 4;
            if body < body_offset(num_q) || body.saturating_add(capacity) > len {
                return Err(Error::CorruptTable("queue outside region"));
            }
            slots.push(Slot { id, header, body, capacity });
        }

        Ok(Self { mem, slots, aligned: protocol.aligned_framing() })
    }

    /// Handle to the queue with logical id `id`.
    pub fn queue(&self, id: QueueId) -> Result<RingQueue<'_>> {
        self.slots
            .iter()
            .find(|slot| slot.id == id)
            .map(|slot| self.ring(slot))
            .ok_or(Error::UnknownQueue(id.name()))
    }

    /// All queues in slot order, enabled or not.
    pub fn queues(&self) -> impl Iterator<Item = RingQueue<'_>> {
        self.slots.iter().map(move |slot| self.ring(slot))
    }

    pub fn enabled_queues(&self) -> impl Iterator<Item = RingQueue<'_>> {
        self.queues().filter(|q| q.is_enabled())
    }

    pub fn header(&self) -> TableHeader {
        let word = |off: usize| self.mem.load(off);
        TableHeader {
            version: word(tbl::VERSION),
            size_words: word(tbl::SIZE),
            qhdr0_offset: word(tbl::QHDR0_OFFSET),
            qhdr_size: word(tbl::QHDR_SIZE),
            num_q: word(tbl::NUM_Q),
            num_active_q: word(tbl::NUM_ACTIVE_Q),
        }
    }

    /// Table header plus every queue header, for diagnostics.
    pub fn snapshot(&self) -> (TableHeader, Vec<(QueueId, QueueHeader)>) {
        (self.header(), self.queues().map(|q| (q.id(), q.header())).collect())
    }

    pub fn memory(&self) -> &Arc<dyn SharedMemory> {
        &self.mem
    }

    fn ring(&self, slot: &Slot) -> RingQueue<'_> {
        RingQueue::new(self.mem.as_ref(), slot.id, slot.header, slot.body, slot.capacity, self.aligned)
    }
}

impl core::fmt::Debug for QueueTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueTable")
            .field("queues", &self.slots.iter().map(|s| s.id).collect::<Vec<_>>())
            .field("aligned", &self.aligned)
            .finish()
    }
}

/// First ring word: table size rounded up to 16 bytes.
const fn body_offset(num_q: usize) -> usize {
    let table = TABLE_HEADER_WORDS + num_q * QUEUE_HEADER_WORDS;
    (table + BODY_ALIGN_WORDS - 1) & !(BODY_ALIGN_WORDS - 1)
}
