// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware collaborators used by the GMU host-to-firmware interface
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 7 unit tests
//!
//! PUBLIC API:
//!   - Bus: opaque 32-bit register accessor
//!   - SharedMemory: word-addressed region shared with the remote processor
//!   - Doorbell: "new data" notification towards the remote side
//!   - InterruptLine: registration point for the remote's completion interrupt
//!   - RegionAllocator: allocation and release of the shared region
//!   - WordRegion, HostAllocator, SoftIrqLine, RegisterDoorbell: host implementations
//!
//! The shared region is modelled as a slice of `AtomicU32` so that the producer and
//! the consumer of a ring can live on different threads without `unsafe`. Loads are
//! `Acquire` and stores are `Release`; publishing an index after the payload words
//! therefore orders the payload before the index.

#![forbid(unsafe_code)]

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Result alias for HAL operations.
pub type Result<T> = core::result::Result<T, HalError>;

/// Errors reported by the host collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// The allocator could not provide a region of the requested size.
    #[error("shared region allocation failed ({requested} words)")]
    OutOfMemory {
        /// Requested size in 32-bit words.
        requested: usize,
    },
    /// A handler is already registered on the interrupt line.
    #[error("interrupt line already claimed")]
    IrqBusy,
}

/// Basic bus access trait shared by user drivers.
pub trait Bus: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

impl<B: Bus + ?Sized> Bus for Arc<B> {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

/// Word-addressed memory shared between the host and the remote processor.
///
/// Indices are in 32-bit words. Implementations panic on an index outside
/// `0..len_words()`; callers validate ring indices before touching memory.
pub trait SharedMemory: Send + Sync {
    /// Size of the region in 32-bit words.
    fn len_words(&self) -> usize;
    /// Address of the first word as seen by the remote processor.
    fn device_addr(&self) -> u32;
    /// Reads one word with acquire ordering.
    fn load(&self, index: usize) -> u32;
    /// Writes one word with release ordering.
    fn store(&self, index: usize, value: u32);
}

/// Notification towards the remote side that a ring has new data.
pub trait Doorbell: Send + Sync {
    fn notify(&self);
}

/// Handler invoked with the raw interrupt status word.
pub type IrqHandler = Box<dyn Fn(u32) + Send + Sync>;

/// Interrupt line raised by the remote side when it has produced messages.
pub trait InterruptLine: Send + Sync {
    /// Installs `handler`; fails if the line is already claimed.
    fn on_interrupt(&self, handler: IrqHandler) -> Result<()>;
    /// Removes the installed handler, if any.
    fn release(&self);
}

/// Provides the shared region at link initialisation.
pub trait RegionAllocator: Send + Sync {
    fn allocate(&self, len_words: usize) -> Result<Arc<dyn SharedMemory>>;
    /// Returns a region obtained from `allocate`. Unknown regions are ignored.
    fn release(&self, region: &Arc<dyn SharedMemory>);
}

/// Write barrier issued between publishing a ring index and ringing a doorbell.
pub fn wmb() {
    fence(Ordering::SeqCst);
}

/// Heap-backed shared region.
pub struct WordRegion {
    words: Box<[AtomicU32]>,
    device_addr: u32,
}

impl WordRegion {
    /// Creates a zeroed region of `len_words` words mapped at `device_addr`.
    pub fn new(len_words: usize, device_addr: u32) -> Self {
        let words = (0..len_words).map(|_| AtomicU32::new(0)).collect();
        Self { words, device_addr }
    }

    /// Copies the current contents out of the region.
    pub fn snapshot(&self) -> Vec<u32> {
        self.words.iter().map(|w| w.load(Ordering::Acquire)).collect()
    }
}

impl SharedMemory for WordRegion {
    fn len_words(&self) -> usize {
        self.words.len()
    }

    fn device_addr(&self) -> u32 {
        self.device_addr
    }

    fn load(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Acquire)
    }

    fn store(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Release)
    }
}

/// Allocator handing out [`WordRegion`]s and remembering them so that a simulated
/// remote can attach to the same memory.
pub struct HostAllocator {
    device_base: u32,
    limit_words: Option<usize>,
    regions: Mutex<Vec<Arc<WordRegion>>>,
}

impl HostAllocator {
    pub fn new(device_base: u32) -> Self {
        Self { device_base, limit_words: None, regions: Mutex::new(Vec::new()) }
    }

    /// Rejects any allocation larger than `limit_words`.
    pub fn with_limit(mut self, limit_words: usize) -> Self {
        self.limit_words = Some(limit_words);
        self
    }

    /// Most recently allocated region.
    pub fn last(&self) -> Option<Arc<WordRegion>> {
        self.regions.lock().last().cloned()
    }

    pub fn allocations(&self) -> usize {
        self.regions.lock().len()
    }
}

impl RegionAllocator for HostAllocator {
    fn allocate(&self, len_words: usize) -> Result<Arc<dyn SharedMemory>> {
        if self.limit_words.is_some_and(|limit| len_words > limit) {
            return Err(HalError::OutOfMemory { requested: len_words });
        }
        let mut regions = self.regions.lock();
        // Place after the highest live region so a released hole is never overlapped.
        let next = regions
            .iter()
            .map(|r| r.device_addr().wrapping_add(r.len_words() as u32 * 4))
            .max()
            .unwrap_or(self.device_base);
        let region = Arc::new(WordRegion::new(len_words, next));
        regions.push(region.clone());
        Ok(region as Arc<dyn SharedMemory>)
    }

    fn release(&self, region: &Arc<dyn SharedMemory>) {
        let target = Arc::as_ptr(region) as *const ();
        self.regions.lock().retain(|r| Arc::as_ptr(r) as *const () != target);
    }
}

/// Software interrupt line: `raise` calls the installed handler on the caller's thread.
#[derive(Default)]
pub struct SoftIrqLine {
    handler: Mutex<Option<Arc<dyn Fn(u32) + Send + Sync>>>,
}

impl SoftIrqLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `status` to the handler. Returns `false` when nothing is installed.
    pub fn raise(&self, status: u32) -> bool {
        // Clone out so the handler runs without the registration lock held.
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(status);
                true
            }
            None => false,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.handler.lock().is_some()
    }
}

impl InterruptLine for SoftIrqLine {
    fn on_interrupt(&self, handler: IrqHandler) -> Result<()> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            return Err(HalError::IrqBusy);
        }
        *slot = Some(Arc::from(handler));
        Ok(())
    }

    fn release(&self) {
        self.handler.lock().take();
    }
}

/// Doorbell implemented as a register write on a [`Bus`].
pub struct RegisterDoorbell<B: Bus> {
    bus: B,
    offset: usize,
    value: u32,
}

impl<B: Bus> RegisterDoorbell<B> {
    pub fn new(bus: B, offset: usize, value: u32) -> Self {
        Self { bus, offset, value }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B: Bus> Doorbell for RegisterDoorbell<B> {
    fn notify(&self) {
        self.bus.write(self.offset, self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockBus {
        last: Mutex<Option<(usize, u32)>>,
    }

    impl Bus for MockBus {
        fn read(&self, _offset: usize) -> u32 {
            let last = *self.last.lock();
            last.map(|(_, v)| v).unwrap_or(0)
        }

        fn write(&self, offset: usize, value: u32) {
            *self.last.lock() = Some((offset, value));
        }
    }

    #[test]
    fn region_load_store() {
        let region = WordRegion::new(8, 0x6000_0000);
        region.store(3, 0xdead_beef);
        assert_eq!(region.load(3), 0xdead_beef);
        assert_eq!(region.len_words(), 8);
        assert_eq!(region.snapshot()[3], 0xdead_beef);
    }

    #[test]
    fn allocator_respects_limit() {
        let alloc = HostAllocator::new(0x1000).with_limit(16);
        assert!(alloc.allocate(16).is_ok());
        assert_eq!(alloc.allocate(17).err(), Some(HalError::OutOfMemory { requested: 17 }));
        assert_eq!(alloc.allocations(), 1);
    }

    #[test]
    fn allocator_places_regions_back_to_back() {
        let alloc = HostAllocator::new(0x1000);
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(4).unwrap();
        assert_eq!(a.device_addr(), 0x1000);
        assert_eq!(b.device_addr(), 0x1010);
        assert_eq!(alloc.last().map(|r| r.device_addr()), Some(0x1010));
    }

    #[test]
    fn released_region_is_forgotten() {
        let alloc = HostAllocator::new(0x1000);
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(4).unwrap();
        alloc.release(&a);
        assert_eq!(alloc.allocations(), 1);
        assert_eq!(alloc.last().map(|r| r.device_addr()), Some(b.device_addr()));

        // Placement continues after the live region, not over it.
        let c = alloc.allocate(4).unwrap();
        assert_eq!(c.device_addr(), 0x1020);

        alloc.release(&a);
        assert_eq!(alloc.allocations(), 2);
    }

    #[test]
    fn soft_irq_delivers_and_rejects_second_claim() {
        let line = SoftIrqLine::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        line.on_interrupt(Box::new(move |status| {
            seen.fetch_add(status as usize, Ordering::SeqCst);
        }))
        .unwrap();
        assert_eq!(line.on_interrupt(Box::new(|_| {})), Err(HalError::IrqBusy));
        assert!(line.raise(3));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn released_line_drops_interrupts() {
        let line = SoftIrqLine::new();
        line.on_interrupt(Box::new(|_| {})).unwrap();
        line.release();
        assert!(!line.is_claimed());
        assert!(!line.raise(1));
    }

    #[test]
    fn register_doorbell_writes_configured_value() {
        let doorbell = RegisterDoorbell::new(MockBus::default(), 0x1a0, 1);
        doorbell.notify();
        assert_eq!(*doorbell.bus().last.lock(), Some((0x1a0, 1)));
    }
}
