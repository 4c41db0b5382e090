//! The backing allocator: the slow, coarse source of memory underneath the
//! bucket machinery.
//!
//! The allocator in this crate does not talk to the operating system itself.
//! It asks a [`BackingAllocator`] for contiguous byte ranges ([`Region`]s)
//! and hands them back when they are no longer needed. Everything else
//! (slots, bitmaps, headers) is carved out of those regions.

use core::ptr;

/// A contiguous range of bytes, `[begin, end)`.
///
/// This is the currency of the whole crate: backing allocations, buckets and
/// user allocations are all described as regions. A region does not own its
/// memory; ownership is tracked by whoever holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub begin: *mut u8,
    pub end: *mut u8,
}

impl Region {
    /// Build a region from its two bounds.
    #[must_use]
    pub const fn new(begin: *mut u8, end: *mut u8) -> Self {
        Self { begin, end }
    }

    /// The number of bytes in the region.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end as usize - self.begin as usize
    }

    /// Whether the region is zero-sized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// A slow allocator serving coarse byte ranges.
///
/// Implementations only need two operations and no bookkeeping cleverness;
/// the point of this crate is to call them rarely.
///
/// # Contract
/// * [`allocate`](Self::allocate) returns a region of *at least* `size`
///   bytes, aligned to at least eight bytes, or `None` if the request
///   cannot be served. The small-object tier rounds regions inward
///   itself and works with any alignment; the large pass-through forwards
///   regions directly to callers, so a backing allocator used under the
///   [`Allocator`](crate::Allocator) facade should return regions aligned
///   to the facade's slot alignment (the [`System`] backing aligns to 64).
/// * [`release`](Self::release) is handed a region whose `begin` is exactly
///   the `begin` of an earlier `allocate` result. The `end` is advisory:
///   implementations must be able to free from `begin` alone.
pub trait BackingAllocator {
    /// Obtain a region of at least `size` bytes, or `None` on refusal.
    fn allocate(&self, size: usize) -> Option<Region>;

    /// Return a previously allocated region.
    ///
    /// # Safety
    /// `region.begin` must be the exact start of a region previously
    /// returned by [`allocate`](Self::allocate) on this same allocator, and
    /// it must not be released twice.
    unsafe fn release(&self, region: Region);
}

/// Alignment of every region handed out by [`System`].
///
/// 64 bytes covers the default slot alignment, so large allocations routed
/// through the platform allocator satisfy the same alignment guarantee as
/// the bucket path.
const SYSTEM_ALIGN: usize = 64;

/// The platform allocator as a backing allocator.
///
/// Uses `posix_memalign`/`free`, so it is available on any Unix-like target
/// without pulling in `std`.
#[derive(Debug, Clone, Copy, Default)]
pub struct System;

impl<B: BackingAllocator + ?Sized> BackingAllocator for &B {
    fn allocate(&self, size: usize) -> Option<Region> {
        (**self).allocate(size)
    }

    unsafe fn release(&self, region: Region) {
        (**self).release(region);
    }
}

impl BackingAllocator for System {
    fn allocate(&self, size: usize) -> Option<Region> {
        let mut raw = ptr::null_mut();
        // SAFETY: `raw` is a valid out-pointer and the alignment is a power
        // of two that is a multiple of the pointer size, as required by
        // `posix_memalign`.
        let rc = unsafe { libc::posix_memalign(&mut raw, SYSTEM_ALIGN, size) };
        if rc != 0 || raw.is_null() {
            return None;
        }
        let begin = raw.cast::<u8>();
        // SAFETY: `begin` points to an allocation of `size` bytes, so the
        // one-past-the-end pointer is in bounds of the same allocation.
        let end = unsafe { begin.add(size) };
        Some(Region::new(begin, end))
    }

    unsafe fn release(&self, region: Region) {
        libc::free(region.begin.cast());
    }
}

#[cfg(test)]
mod tests {
    use super::{BackingAllocator, Region, System};

    #[test]
    fn region_len() {
        let mut bytes = [0_u8; 16];
        let begin = bytes.as_mut_ptr();
        let region = Region::new(begin, unsafe { begin.add(16) });
        assert_eq!(region.len(), 16);
        assert!(!region.is_empty());
        assert!(Region::new(begin, begin).is_empty());
    }

    #[test]
    fn system_allocates_aligned_regions() {
        let region = System.allocate(100).unwrap();
        assert!(region.len() >= 100);
        assert_eq!(region.begin as usize % 64, 0);
        unsafe { System.release(region) };
    }
}
