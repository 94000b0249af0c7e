//! Fuzz test for allocation map bookkeeping
//!
//! Applies arbitrary inserts and checks that the extent list stays sorted,
//! merged and consistent with point queries.

#![no_main]

use arbitrary::Arbitrary;
use cowstream_core::AllocationMap;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Insert {
    start: u16,
    len: u8,
}

fuzz_target!(|inserts: Vec<Insert>| {
    let mut map = AllocationMap::new();
    let mut reference = vec![false; u16::MAX as usize + 256];

    for insert in &inserts {
        let start = u64::from(insert.start);
        let end = start + u64::from(insert.len);
        map.insert(start, end);
        for b in &mut reference[start as usize..end as usize] {
            *b = true;
        }
    }

    let extents: Vec<_> = map.iter().collect();
    for pair in extents.windows(2) {
        // Sorted with a gap between neighbours
        assert!(pair[0].1 < pair[1].0, "{:?}", extents);
    }
    for &(s, e) in &extents {
        assert!(s < e);
    }

    let total: u64 = reference.iter().filter(|&&b| b).count() as u64;
    assert_eq!(map.allocated_bytes(), total);

    for offset in (0..reference.len() as u64).step_by(97) {
        let extent = map.status(offset, 64);
        assert_eq!(extent.allocated, reference[offset as usize]);
        assert!(extent.len > 0 && extent.len <= 64);
    }
});
