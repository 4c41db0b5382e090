//! The generic allocator: request routing between the bucket tier and the
//! backing pass-through.

use core::mem;
use core::ptr::{self, NonNull};

use crate::backing::{BackingAllocator, Region};
use crate::large::LargeSet;
use crate::small::{SmallAllocator, SmallStats};
use crate::trace::heap_trace;

/// Requests above this many bytes skip the bucket tier and go straight to
/// the backing allocator.
///
/// The value is 32,000 (not 32 Ki) and is kept as-is for behavioral
/// compatibility with deployments tuned against it.
pub const LARGE_THRESHOLD: usize = 32_000;

/// A two-tier allocator over a slow backing allocator.
///
/// Small requests are served from bitmap buckets via [`SmallAllocator`];
/// requests above [`LARGE_THRESHOLD`] bytes are forwarded to the backing
/// allocator and remembered in a pointer set so deallocation can route them
/// back. When no allocation served by this allocator is live anymore, no
/// backing memory is held either.
///
/// The allocator is strictly single-threaded (`&mut self` everywhere); wrap
/// it in [`Allocator`](crate::Allocator) to drive it through
/// [`core::alloc::GlobalAlloc`].
pub struct GenericAllocator<B: BackingAllocator, const A: usize = 64> {
    small: SmallAllocator<B, A>,
    large: LargeSet,
}

// SAFETY: see `SmallAllocator`; the large set's table is owned the same
// way.
unsafe impl<B: BackingAllocator + Send, const A: usize> Send for GenericAllocator<B, A> {}

impl<B: BackingAllocator, const A: usize> GenericAllocator<B, A> {
    /// Create an idle allocator on top of `backing`. Requests no memory
    /// until first used.
    #[must_use]
    pub const fn new(backing: B) -> Self {
        Self {
            small: SmallAllocator::new(backing),
            large: LargeSet::new(),
        }
    }

    /// Allocate `size` bytes.
    ///
    /// The returned region is `A`-aligned at both ends on the small path;
    /// on the large path it carries whatever alignment the backing
    /// allocator provides. Returns `None` if the backing allocator refuses
    /// to provide memory.
    pub fn alloc(&mut self, size: usize) -> Option<Region> {
        if size > LARGE_THRESHOLD {
            self.alloc_large(size)
        } else {
            self.small.allocate(size)
        }
    }

    fn alloc_large(&mut self, size: usize) -> Option<Region> {
        let region = self.small.backing().allocate(size)?;
        heap_trace!("large allocation: {} bytes at {:p}", size, region.begin);
        if !self.large.insert(region.begin as usize, &mut self.small) {
            // The bookkeeping table could not grow; give the region back
            // rather than losing track of it.
            unsafe { self.small.backing().release(region) };
            return None;
        }
        Some(region)
    }

    /// Deallocate a region previously returned by [`alloc`].
    ///
    /// `region.begin` decides the route: addresses recorded by the large
    /// path go back to the backing allocator (with the caller's `end`
    /// forwarded), everything else is treated as a small allocation whose
    /// true extent is read from its header; there the `end` is advisory.
    ///
    /// # Safety
    /// `region.begin` must come from a call to [`alloc`] on this very
    /// allocator value, it must not have been deallocated before, and the
    /// allocator must not have been moved since that `alloc` call.
    ///
    /// [`alloc`]: Self::alloc
    pub unsafe fn dealloc(&mut self, region: Region) {
        if self.large.remove(region.begin as usize, &mut self.small) {
            heap_trace!("large deallocation at {:p}", region.begin);
            self.small.backing().release(region);
        } else {
            self.small.dealloc(region);
        }
    }

    /// Allocate storage for `count` values of `T`.
    ///
    /// The storage is uninitialized; the caller constructs the elements.
    /// Returns `None` on backing refusal or if the byte size overflows.
    ///
    /// # Panics
    /// Panics if `T` requires more alignment than `A`.
    pub fn alloc_array<T>(&mut self, count: usize) -> Option<NonNull<T>> {
        assert!(
            mem::align_of::<T>() <= A,
            "element alignment exceeds the slot alignment"
        );
        let bytes = mem::size_of::<T>().checked_mul(count)?;
        let region = self.alloc(bytes)?;
        NonNull::new(region.begin.cast())
    }

    /// Drop `count` values of `T` and release their storage.
    ///
    /// # Safety
    /// `array` must come from [`alloc_array::<T>`](Self::alloc_array) on
    /// this allocator with the same `count`, all `count` elements must be
    /// initialized, and the usual [`dealloc`](Self::dealloc) contract
    /// applies.
    pub unsafe fn dealloc_array<T>(&mut self, array: NonNull<T>, count: usize) {
        for index in 0..count {
            ptr::drop_in_place(array.as_ptr().add(index));
        }
        let begin = array.as_ptr().cast::<u8>();
        let end = begin.add(mem::size_of::<T>() * count);
        self.dealloc(Region::new(begin, end));
    }

    /// Shape counters of the bucket tier.
    pub fn small_stats(&self) -> SmallStats {
        self.small.stats()
    }

    /// Number of live allocations on the large path.
    pub fn large_allocations(&self) -> usize {
        self.large.len()
    }
}

impl<B: BackingAllocator, const A: usize> Drop for GenericAllocator<B, A> {
    fn drop(&mut self) {
        // Give back every region the large path still holds. The set only
        // stores start addresses; the backing contract makes the end
        // advisory on release.
        self.large.for_each(|addr| {
            let begin = addr as *mut u8;
            // SAFETY: recorded addresses are exactly the starts of live
            // backing regions obtained by `alloc_large`.
            unsafe { self.small.backing().release(Region::new(begin, begin)) };
        });
        self.large.release_table(&mut self.small);
        // `self.small` drops afterwards and returns the bucket tier.
    }
}

#[cfg(test)]
mod tests {
    use super::{GenericAllocator, LARGE_THRESHOLD};

    #[test]
    fn threshold_is_the_literal_value() {
        assert_eq!(LARGE_THRESHOLD, 32_000);
    }

    #[test]
    fn alloc_array_respects_element_types() {
        let mut alloc = GenericAllocator::<_, 64>::new(crate::System);

        let array = alloc.alloc_array::<u64>(8).unwrap();
        assert_eq!(array.as_ptr() as usize % 64, 0);
        unsafe {
            for index in 0..8 {
                array.as_ptr().add(index).write(index as u64 * 3);
            }
            for index in 0..8 {
                assert_eq!(array.as_ptr().add(index).read(), index as u64 * 3);
            }
            alloc.dealloc_array(array, 8);
        }
        assert_eq!(alloc.small_stats().occupied_slots(), 0);
    }
}
