// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Time source for ack deadlines and the bounded busy retry on command writes
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Internal (crate public, but intended for in-tree use)
//! TEST_COVERAGE: Unit tests (host)
//!
//! A full command queue means the firmware has not consumed earlier commands
//! yet. Table pushes during start may wait for it; everything else fails fast.
//! Time is read through [`Clock`] so tests can step it without sleeping.

use std::time::{Duration, Instant};

use log::trace;

use crate::{Error, Result};

/// The clock is sampled on the first failed attempt and then every this many.
const CLOCK_SAMPLE_EVERY: u32 = 64;

/// Monotonic time source.
pub trait Clock {
    /// Nanoseconds since an arbitrary fixed origin.
    fn now_ns(&self) -> u64;
    /// Gives other threads, and the firmware, a chance to run.
    fn yield_now(&self);
}

/// [`Clock`] over `std::time::Instant`.
#[derive(Debug)]
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> u64 {
        as_ns(self.origin.elapsed())
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

fn as_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Absolute deadline `budget` from now on `clock`'s scale.
pub fn deadline_after<C: Clock + ?Sized>(clock: &C, budget: Duration) -> u64 {
    clock.now_ns().saturating_add(as_ns(budget))
}

/// Repeats `write` while it reports `InsufficientSpace`, for at most `budget`.
///
/// Any other outcome is returned as is. When the budget runs out the last
/// `InsufficientSpace` is returned.
pub fn retry_while_busy<C: Clock + ?Sized, T>(
    clock: &C,
    budget: Duration,
    mut write: impl FnMut() -> Result<T>,
) -> Result<T> {
    let deadline = deadline_after(clock, budget);
    let mut attempts: u32 = 0;
    loop {
        match write() {
            Err(Error::InsufficientSpace) => {}
            other => return other,
        }
        attempts = attempts.wrapping_add(1);
        if attempts % CLOCK_SAMPLE_EVERY == 1 && clock.now_ns() >= deadline {
            trace!("hfi: command queue still full after {attempts} attempts");
            return Err(Error::InsufficientSpace);
        }
        clock.yield_now();
    }
}
