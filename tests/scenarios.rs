//! End-to-end behavior of the two-tier allocator, driven through a backing
//! allocator that records every outstanding region. This is where the
//! conservation guarantee is checked exactly: whenever no allocation is
//! live, the backing allocator must hold nothing.

use std::alloc::Layout;
use std::cell::RefCell;
use std::collections::HashMap;

use tieralloc::{BackingAllocator, GenericAllocator, Region, LARGE_THRESHOLD};

/// Backing allocator over the std heap that tracks every region it has
/// handed out and not yet received back.
#[derive(Default)]
struct TrackingBacking {
    live: RefCell<HashMap<usize, usize>>,
}

impl TrackingBacking {
    fn new() -> Self {
        Self::default()
    }

    fn outstanding_regions(&self) -> usize {
        self.live.borrow().len()
    }

    fn outstanding_bytes(&self) -> usize {
        self.live.borrow().values().sum()
    }
}

impl BackingAllocator for TrackingBacking {
    fn allocate(&self, size: usize) -> Option<Region> {
        let layout = Layout::from_size_align(size.max(1), 64).ok()?;
        let begin = unsafe { std::alloc::alloc(layout) };
        if begin.is_null() {
            return None;
        }
        self.live.borrow_mut().insert(begin as usize, layout.size());
        Some(Region::new(begin, unsafe { begin.add(size) }))
    }

    unsafe fn release(&self, region: Region) {
        let size = self
            .live
            .borrow_mut()
            .remove(&(region.begin as usize))
            .expect("released a region that was never allocated (or twice)");
        std::alloc::dealloc(region.begin, Layout::from_size_align(size, 64).unwrap());
    }
}

#[test]
fn tiny_cycle_reuses_the_freed_slot() {
    let backing = TrackingBacking::new();
    let mut alloc = GenericAllocator::<_, 64>::new(&backing);

    // The keeper holds the bucket open; otherwise freeing the only
    // allocation releases the bucket and the follow-up allocation may land
    // in a different backing region.
    let keeper = alloc.alloc(16).unwrap();
    let first = alloc.alloc(16).unwrap();
    unsafe { alloc.dealloc(first) };
    let second = alloc.alloc(16).unwrap();
    assert_eq!(second.begin, first.begin);

    unsafe {
        alloc.dealloc(second);
        alloc.dealloc(keeper);
    }
    assert_eq!(backing.outstanding_regions(), 0);
}

#[test]
fn straddling_the_large_threshold() {
    let backing = TrackingBacking::new();
    let mut alloc = GenericAllocator::<_, 64>::new(&backing);

    // One byte below the threshold: 500 payload slots plus the header.
    let below = alloc.alloc(LARGE_THRESHOLD - 1).unwrap();
    assert_eq!(alloc.small_stats().occupied_slots(), 501);
    assert_eq!(alloc.large_allocations(), 0);

    // One byte above: straight to the backing allocator.
    let above = alloc.alloc(LARGE_THRESHOLD + 1).unwrap();
    assert_eq!(alloc.large_allocations(), 1);
    assert!(above.len() >= LARGE_THRESHOLD + 1);

    unsafe { alloc.dealloc(above) };
    assert_eq!(alloc.large_allocations(), 0);

    unsafe { alloc.dealloc(below) };
    assert_eq!(alloc.small_stats().occupied_slots(), 0);
    assert_eq!(backing.outstanding_regions(), 0);
    assert_eq!(backing.outstanding_bytes(), 0);
}

#[test]
fn growth_spills_into_new_nodes_and_shrink_undoes_it() {
    let backing = TrackingBacking::new();
    let mut alloc = GenericAllocator::<_, 64>::new(&backing);

    let blocks: Vec<Region> = (0..2000).map(|_| alloc.alloc(128).unwrap()).collect();

    let stats = alloc.small_stats();
    assert!(stats.nodes >= 2, "expected growth beyond the head node");
    // 128 bytes are two payload slots plus the header slot.
    assert_eq!(stats.occupied_slots(), 2000 * 3);

    for block in blocks.iter().rev() {
        unsafe { alloc.dealloc(*block) };
    }

    let stats = alloc.small_stats();
    assert_eq!(stats.nodes, 1);
    assert_eq!(stats.head_free_buckets, 64);
    assert_eq!(stats.occupied_slots(), 0);
    assert_eq!(backing.outstanding_regions(), 0);
}

#[test]
fn first_fit_fills_the_lowest_hole() {
    let backing = TrackingBacking::new();
    let mut alloc = GenericAllocator::<_, 64>::new(&backing);

    let blocks: Vec<Region> = (0..10).map(|_| alloc.alloc(64).unwrap()).collect();

    // A four-slot hole at the front, a two-slot hole in the middle.
    unsafe {
        alloc.dealloc(blocks[0]);
        alloc.dealloc(blocks[1]);
        alloc.dealloc(blocks[5]);
    }

    // Three slots needed; only the front hole fits, and it wins over the
    // untouched space behind the last block.
    let replacement = alloc.alloc(128).unwrap();
    assert_eq!(replacement.begin, blocks[0].begin);

    unsafe {
        alloc.dealloc(replacement);
        for block in [2, 3, 4, 6, 7, 8, 9] {
            alloc.dealloc(blocks[block]);
        }
    }
    assert_eq!(backing.outstanding_regions(), 0);
}

#[test]
fn byte_patterns_survive_neighboring_frees() {
    let backing = TrackingBacking::new();
    let mut alloc = GenericAllocator::<_, 64>::new(&backing);

    let mut blocks = Vec::new();
    for i in 0..64_usize {
        let size = 16 + (i % 7) * 48;
        let region = alloc.alloc(size).unwrap();
        unsafe { std::ptr::write_bytes(region.begin, i as u8, size) };
        blocks.push((region, size, i as u8));
    }

    // Free every third block to stir the free lists.
    for (region, _, _) in blocks.iter().skip(2).step_by(3) {
        unsafe { alloc.dealloc(*region) };
    }
    blocks = blocks
        .into_iter()
        .enumerate()
        .filter(|(i, _)| (i + 1) % 3 != 0)
        .map(|(_, block)| block)
        .collect();

    for (region, size, pattern) in &blocks {
        let bytes = unsafe { std::slice::from_raw_parts(region.begin, *size) };
        assert!(bytes.iter().all(|byte| byte == pattern));
    }

    for (region, _, _) in &blocks {
        unsafe { alloc.dealloc(*region) };
    }
    assert_eq!(backing.outstanding_regions(), 0);
}

#[test]
fn conservation_across_mixed_traffic() {
    let backing = TrackingBacking::new();
    let mut alloc = GenericAllocator::<_, 64>::new(&backing);

    let sizes = [40, 500, 33_000, 8_000, 120_000, 64, 31_999, 32_001];
    for _round in 0..5 {
        let regions: Vec<Region> = sizes.iter().map(|&size| alloc.alloc(size).unwrap()).collect();

        // Free the even positions, allocate replacements, then clear out.
        for region in regions.iter().step_by(2) {
            unsafe { alloc.dealloc(*region) };
        }
        let replacements: Vec<Region> = sizes
            .iter()
            .step_by(2)
            .map(|&size| alloc.alloc(size).unwrap())
            .collect();

        for region in regions.iter().skip(1).step_by(2) {
            unsafe { alloc.dealloc(*region) };
        }
        for region in replacements.iter().rev() {
            unsafe { alloc.dealloc(*region) };
        }

        assert_eq!(alloc.large_allocations(), 0);
        assert_eq!(alloc.small_stats().occupied_slots(), 0);
        assert_eq!(backing.outstanding_regions(), 0);
    }
}

#[test]
fn dropping_the_allocator_returns_everything() {
    let backing = TrackingBacking::new();
    let mut alloc = GenericAllocator::<_, 64>::new(&backing);

    for i in 0..50 {
        alloc.alloc(100 + i * 11).unwrap();
    }
    for _ in 0..3 {
        alloc.alloc(50_000).unwrap();
    }
    assert!(backing.outstanding_regions() > 0);
    assert_eq!(alloc.large_allocations(), 3);

    drop(alloc);
    assert_eq!(backing.outstanding_regions(), 0);
    assert_eq!(backing.outstanding_bytes(), 0);
}
