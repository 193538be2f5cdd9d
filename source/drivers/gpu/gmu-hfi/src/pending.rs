// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Request/ack correlation keyed by 12-bit sequence number
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Internal (crate public, but intended for in-tree use)
//! TEST_COVERAGE: Unit tests + proptest (host)
//!
//! Each request that expects an ack registers a [`PendingRequest`] before its
//! command is written. Whoever drains the message queue calls
//! [`PendingTable::complete`] with the ack; the entry whose sequence matches the
//! echoed request header is fulfilled and its owner woken. Acks without a
//! matching, still-waiting entry are reported back as unmatched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::codec;
use crate::{Error, Result};

/// Outcome handed to a waiting sender: ack payload words after the echoed header.
pub type Outcome = Result<Vec<u32>>;

/// One outstanding request.
pub struct PendingRequest {
    sent_hdr: u32,
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl PendingRequest {
    fn new(sent_hdr: u32) -> Self {
        Self { sent_hdr, outcome: Mutex::new(None), ready: Condvar::new() }
    }

    /// Header word as written to the command queue, sequence included.
    pub fn sent_hdr(&self) -> u32 {
        self.sent_hdr
    }

    pub fn seq(&self) -> u16 {
        codec::sequence(self.sent_hdr)
    }

    /// Takes the outcome if one has been delivered.
    pub fn try_take(&self) -> Option<Outcome> {
        self.outcome.lock().take()
    }

    /// Blocks up to `timeout` for an outcome and takes it.
    pub fn wait_for(&self, timeout: Duration) -> Option<Outcome> {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            let _ = self.ready.wait_for(&mut outcome, timeout);
        }
        outcome.take()
    }

    fn fulfil(&self, result: Outcome) {
        *self.outcome.lock() = Some(result);
        self.ready.notify_one();
    }
}

impl core::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingRequest").field("sent_hdr", &format_args!("{:#010x}", self.sent_hdr)).finish()
    }
}

/// Live requests keyed by sequence number.
#[derive(Default)]
pub struct PendingTable {
    slots: Mutex<HashMap<u16, Arc<PendingRequest>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `sent_hdr`. Fails if its sequence is already waiting,
    /// which only happens once 4096 requests are already in flight.
    pub fn register(&self, sent_hdr: u32) -> Result<Arc<PendingRequest>> {
        let seq = codec::sequence(sent_hdr);
        let mut slots = self.slots.lock();
        if slots.contains_key(&seq) {
            return Err(Error::TooManyInFlight(seq));
        }
        let request = Arc::new(PendingRequest::new(sent_hdr));
        slots.insert(seq, request.clone());
        Ok(request)
    }

    /// Delivers an ack whose echoed request header is `req_hdr`.
    ///
    /// Returns `false` when no registered request matches; the caller reports it.
    pub fn complete(&self, req_hdr: u32, payload: &[u32]) -> bool {
        let seq = codec::sequence(req_hdr);
        let Some(request) = self.slots.lock().remove(&seq) else {
            return false;
        };
        request.fulfil(Ok(payload.to_vec()));
        true
    }

    /// Drops the entry for `seq` if it is still registered.
    pub fn remove(&self, seq: u16) {
        self.slots.lock().remove(&seq);
    }

    /// Fails every outstanding request with `err` and empties the table.
    pub fn cancel_all(&self, err: &Error) -> usize {
        let drained: Vec<_> = self.slots.lock().drain().map(|(_, req)| req).collect();
        for request in &drained {
            request.fulfil(Err(err.clone()));
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
