// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Single-producer/single-consumer ring of 32-bit words in shared memory
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests + proptest (host)
//!
//! A queue is a 12-word header plus a ring body. The producer owns the write
//! index and the consumer owns the read index; each side only ever stores its
//! own index and publishes it after the payload words, so a concurrent reader
//! never observes an index ahead of the data it covers.
//!
//! One word of the ring always stays free so that `read == write` means empty.

use gmu_hal::SharedMemory;
use log::trace;

use crate::codec::{self, MAX_MSG_WORDS, PAD_COOKIE};
use crate::table::{QueueHeader, QueueId};
use crate::{Error, Result};

/// Word offsets inside a queue header.
pub(crate) mod hdr {
    pub const STATUS: usize = 0;
    pub const START_ADDR: usize = 1;
    pub const TYPE: usize = 2;
    pub const QUEUE_SIZE: usize = 3;
    pub const MSG_SIZE: usize = 4;
    pub const READ_INDEX: usize = 10;
    pub const WRITE_INDEX: usize = 11;
}

/// Header status value for a live queue.
pub const QUEUE_ENABLED: u32 = 1;
/// Header status value for an unused slot.
pub const QUEUE_DISABLED: u32 = 0;

/// View of one queue inside a [`crate::QueueTable`] region.
///
/// Ring geometry comes from the table layout held by the host; only the status
/// word and the two indices are re-read from shared memory on every call.
#[derive(Clone, Copy)]
pub struct RingQueue<'a> {
    mem: &'a dyn SharedMemory,
    id: QueueId,
    header: usize,
    body: usize,
    capacity: usize,
    aligned: bool,
}

impl<'a> RingQueue<'a> {
    pub(crate) fn new(
        mem: &'a dyn SharedMemory,
        id: QueueId,
        header: usize,
        body: usize,
        capacity: usize,
        aligned: bool,
    ) -> Self {
        Self { mem, id, header, body, capacity, aligned }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Ring size in words.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.mem.load(self.header + hdr::STATUS) != QUEUE_DISABLED
    }

    /// `(read, write)` as currently published.
    pub fn indices(&self) -> (u32, u32) {
        (
            self.mem.load(self.header + hdr::READ_INDEX),
            self.mem.load(self.header + hdr::WRITE_INDEX),
        )
    }

    pub fn is_empty(&self) -> bool {
        let (read, write) = self.indices();
        read == write
    }

    pub fn header(&self) -> QueueHeader {
        let word = |off: usize| self.mem.load(self.header + off);
        QueueHeader {
            status: word(hdr::STATUS),
            start_addr: word(hdr::START_ADDR),
            ty: word(hdr::TYPE),
            queue_size: word(hdr::QUEUE_SIZE),
            msg_size: word(hdr::MSG_SIZE),
            read_index: word(hdr::READ_INDEX),
            write_index: word(hdr::WRITE_INDEX),
        }
    }

    /// Free words between the producer and the consumer.
    pub fn free_words(&self) -> Result<usize> {
        let (read, write) = self.checked_indices()?;
        Ok(free_space(read, write, self.capacity))
    }

    /// Appends `msg` and publishes the new write index.
    ///
    /// `msg[0]` must be a header whose size field equals `msg.len()`. On any
    /// error the queue is left untouched.
    pub fn write(&self, msg: &[u32]) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::QueueDisabled);
        }
        let Some(&first) = msg.first() else {
            return Err(Error::MalformedMessage("empty message"));
        };
        if msg.len() > MAX_MSG_WORDS {
            return Err(Error::MessageTooLarge { declared: msg.len(), capacity: MAX_MSG_WORDS });
        }
        if codec::size_words(first) != msg.len() {
            return Err(Error::MalformedMessage("header size disagrees with message length"));
        }

        let (read, write) = self.checked_indices()?;
        if free_space(read, write, self.capacity) <= codec::align_words(msg.len()) {
            return Err(Error::InsufficientSpace);
        }

        let mut pos = write as usize;
        for &word in msg {
            self.mem.store(self.body + pos, word);
            pos = (pos + 1) % self.capacity;
        }
        if self.aligned {
            while pos % codec::QUEUE_ALIGN_WORDS != 0 {
                self.mem.store(self.body + pos, PAD_COOKIE);
                pos = (pos + 1) % self.capacity;
            }
        }

        self.mem.store(self.header + hdr::WRITE_INDEX, pos as u32);
        trace!("hfi: {:?} queue write {} words, write index {} -> {}", self.id, msg.len(), write, pos);
        Ok(())
    }

    /// Copies the next message into `out` and publishes the new read index.
    ///
    /// Returns the number of words copied; the rest of `out` is zeroed.
    pub fn read(&self, out: &mut [u32]) -> Result<usize> {
        if !self.is_enabled() {
            return Err(Error::QueueDisabled);
        }
        let (read, write) = self.indices();
        if read == write {
            return Err(Error::Empty);
        }
        let (read, _) = self.checked_indices()?;

        out.fill(0);
        let mut pos = read as usize;
        let first = self.mem.load(self.body + pos);
        let size = codec::size_words(first);
        if size == 0 {
            return Err(Error::MalformedMessage("zero-size header"));
        }
        if size > out.len() {
            return Err(Error::MessageTooLarge { declared: size, capacity: out.len() });
        }

        for slot in out.iter_mut().take(size) {
            *slot = self.mem.load(self.body + pos);
            pos = (pos + 1) % self.capacity;
        }
        if self.aligned {
            pos = codec::align_words(pos) % self.capacity;
        }

        self.mem.store(self.header + hdr::READ_INDEX, pos as u32);
        trace!("hfi: {:?} queue read {} words, read index {} -> {}", self.id, size, read, pos);
        Ok(size)
    }

    /// Discards everything unread by moving the read index onto the write index.
    pub fn resync(&self) {
        let write = self.mem.load(self.header + hdr::WRITE_INDEX);
        self.mem.store(self.header + hdr::READ_INDEX, write);
    }

    fn checked_indices(&self) -> Result<(u32, u32)> {
        let (read, write) = self.indices();
        for index in [read, write] {
            if index as usize >= self.capacity {
                return Err(Error::IndexOutOfRange { index, capacity: self.capacity });
            }
        }
        Ok((read, write))
    }
}

impl core::fmt::Debug for RingQueue<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (read, write) = self.indices();
        f.debug_struct("RingQueue")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("read", &read)
            .field("write", &write)
            .finish()
    }
}

fn free_space(read: u32, write: u32, capacity: usize) -> usize {
    let (read, write) = (read as usize, write as usize);
    if write >= read {
        capacity - (write - read)
    } else {
        read - write
    }
}
