#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mqnic_core::{DescriptorRing, FreeIdPool};

#[derive(Debug, Arbitrary)]
enum Op {
    Post,
    Reclaim(u16),
    ReclaimOldest,
    UnpostLast,
}

#[derive(Debug, Arbitrary)]
struct Input {
    size_log2: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let size = 1usize << (input.size_log2 % 10 + 1);
    let mut ring = DescriptorRing::<u16>::new(size).expect("power of two size");
    let mut ids = FreeIdPool::new(size).expect("valid capacity");

    for op in input.ops {
        match op {
            Op::Post => {
                if ring.try_reserve(1).is_err() {
                    continue;
                }
                let Some(id) = ids.pop() else {
                    continue;
                };
                ring.post(id).expect("reserved slot");
            }
            Op::Reclaim(pos) => {
                if let Some(id) = ring.reclaim(usize::from(pos) % size) {
                    assert!(ids.push(id));
                }
            }
            Op::ReclaimOldest => {
                let pos = ring.next_to_clean();
                if let Some(id) = ring.reclaim(pos) {
                    assert!(ids.push(id));
                }
            }
            Op::UnpostLast => {
                if let Some(id) = ring.unpost_last() {
                    assert!(ids.push(id));
                }
            }
        }

        ring.check_invariants().expect("ring invariants hold");
        assert!(ring.occupancy() < size);
        assert_eq!(ring.outstanding_count() + ids.len(), size);
    }
});
