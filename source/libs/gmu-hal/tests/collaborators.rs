//! CONTEXT: Tests for HAL collaborators: shared region, doorbell, interrupt line
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCOPE:
//!   - Trait objects over host implementations
//!   - Cross-thread visibility of shared words
//!   - Doorbell to interrupt wiring as used by simulated remotes
//!
//! TEST_SCENARIOS:
//!   - region_is_visible_across_threads(): producer thread publishes, consumer observes
//!   - doorbell_over_bus_reaches_interrupt_line(): register write raises the line
//!   - allocator_returns_trait_objects(): allocation through the trait object
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use gmu_hal::{
    Bus, Doorbell, HostAllocator, InterruptLine, RegionAllocator, RegisterDoorbell, SharedMemory,
    SoftIrqLine, WordRegion,
};

struct IrqBus {
    line: Arc<SoftIrqLine>,
}

impl Bus for IrqBus {
    fn read(&self, _offset: usize) -> u32 {
        0
    }

    fn write(&self, _offset: usize, value: u32) {
        self.line.raise(value);
    }
}

#[test]
fn region_is_visible_across_threads() {
    let region: Arc<dyn SharedMemory> = Arc::new(WordRegion::new(4, 0));
    let producer = region.clone();
    thread::spawn(move || {
        producer.store(0, 7);
        producer.store(1, 1);
    })
    .join()
    .unwrap();
    assert_eq!(region.load(1), 1);
    assert_eq!(region.load(0), 7);
}

#[test]
fn doorbell_over_bus_reaches_interrupt_line() {
    let line = Arc::new(SoftIrqLine::new());
    let seen = Arc::new(AtomicU32::new(0));
    let sink = seen.clone();
    line.on_interrupt(Box::new(move |status| sink.store(status, Ordering::SeqCst))).unwrap();

    let doorbell = RegisterDoorbell::new(IrqBus { line: line.clone() }, 0, 0x4);
    doorbell.notify();
    assert_eq!(seen.load(Ordering::SeqCst), 0x4);
}

#[test]
fn allocator_returns_trait_objects() {
    let alloc: Box<dyn RegionAllocator> = Box::new(HostAllocator::new(0x8000));
    let region = alloc.allocate(32).unwrap();
    region.store(31, 5);
    assert_eq!(region.len_words(), 32);
    assert_eq!(region.load(31), 5);
    assert_eq!(region.device_addr(), 0x8000);
}
