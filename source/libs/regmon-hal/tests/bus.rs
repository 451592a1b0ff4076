//! CONTEXT: Tests for HAL traits: Bus/Tlb/InsnFetch mocks
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCOPE:
//!   - HAL trait implementations behind shared references
//!   - Instruction fetch bounds
//!
//! TEST_SCENARIOS:
//!   - bus_records_writes(): writes land in order with their target address
//!   - fetch_out_of_bounds(): fetch past the captured text reports None
//!   - sfence_tlb_is_callable_on_host(): host build of SfenceTlb is a plain fence
use regmon_hal::{Bus, InsnFetch, SfenceTlb, Tlb};
use std::sync::Mutex;

#[derive(Default)]
struct RecordingBus {
    writes: Mutex<Vec<(usize, u32)>>,
}

impl Bus for RecordingBus {
    fn read(&self, addr: usize) -> u32 {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    fn write(&self, addr: usize, value: u32) {
        self.writes.lock().unwrap().push((addr, value));
    }
}

struct Text {
    base: usize,
    bytes: Vec<u8>,
}

impl InsnFetch for Text {
    fn fetch_byte(&self, addr: usize) -> Option<u8> {
        addr.checked_sub(self.base).and_then(|i| self.bytes.get(i)).copied()
    }
}

#[test]
fn bus_records_writes() {
    let bus = RecordingBus::default();
    bus.write(0xf971_6010, 0x1234);
    bus.write(0xf971_6014, 0x1);
    assert_eq!(bus.read(0xf971_6010), 0x1234);
    assert_eq!(*bus.writes.lock().unwrap(), vec![(0xf971_6010, 0x1234), (0xf971_6014, 0x1)]);
}

#[test]
fn fetch_out_of_bounds() {
    let text = Text { base: 0x8000, bytes: vec![0x10, 0x20, 0x82, 0xe5] };
    assert_eq!(text.fetch_byte(0x8001), Some(0x20));
    assert_eq!(text.fetch_byte(0x8004), None);
    assert_eq!(text.fetch_byte(0x7fff), None);
}

#[test]
fn sfence_tlb_is_callable_on_host() {
    SfenceTlb.flush_all();
}
