//! Two-tier memory allocator on top of a slow backing allocator
//!
//! This crate serves many small allocations cheaply while talking to an
//! underlying, coarse allocator (e.g. the platform allocator) as rarely as
//! possible. It is strictly single-threaded at its core and guarantees full
//! conservation: the moment no allocation served by it is live anymore,
//! every byte it ever obtained from the backing allocator has been returned.
//!
//! # Usage
//! The simplest entry point is the [`Allocator`] facade, which puts the
//! single-threaded core behind a spin lock and implements
//! [`core::alloc::GlobalAlloc`]:
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: tieralloc::Allocator<tieralloc::System> =
//!     tieralloc::Allocator::new(tieralloc::System);
//!
//! extern crate alloc;
//! ```
//! Afterwards `alloc::vec::Vec`, `alloc::collections::BTreeMap` and friends
//! draw their memory from this crate. Code that wants explicit control
//! (and no lock) uses [`GenericAllocator`] directly through its
//! `&mut self` byte interface, or plugs in its own [`BackingAllocator`]
//! instead of [`System`].
//!
//! # Implementation
//! Requests are split in two tiers:
//! * Above [`LARGE_THRESHOLD`] bytes the request goes straight to the
//!   backing allocator. Only the region's start address is remembered, so
//!   deallocation can tell the tiers apart.
//! * Everything else is served from *buckets*: backing regions partitioned
//!   into 64-byte slots with a bitmap free list at their tail, one bit per
//!   slot.
//!
//! A bucket looks like this:
//! ```text
//! +-------------------- backing region ---------------------+
//! | slot 0 | slot 1 | slot 2 | ...            | slot n-1 |bm|
//! +--------+--------+--------+----------------+----------+--+
//!    ^                                                    ^
//!    one allocation = header slot + payload slots         bitmap: n bits
//! ```
//! Each allocation is prefixed with a one-slot header recording its total
//! length and its owning bucket, so deallocation runs in O(1): read the
//! header one slot before the user pointer, clear the bits, done. Buckets
//! live in nodes of 64 cells forming a linked list; a rotating cursor
//! biases allocation toward the most recently used bucket, on the bet that
//! small allocations are short-lived. When the cursor fails to find room
//! after a handful of probes, a fresh bucket is constructed; when a
//! bucket's last slot is freed, its region goes back to the backing
//! allocator immediately, and an emptied node follows it.
//!
//! # Feature flags
//! * `logging` (default): grow/shrink and large-path events through the
//!   `log` facade.
//! * `invariant-checks`: constant-time structural validation at call
//!   boundaries; misuse and corruption panic instead of being undefined.
//! * `invariant-checks-full`: adds linear recounts of bitmaps and bucket
//!   counters. For test suites.
//!
//! # Limits
//! The core is not thread-safe (the facade's lock serializes, nothing
//! more), alignments above the slot size `A` (default 64) are unsupported,
//! and large allocations are never coalesced or cached.
#![no_std]

mod align;
mod backing;
mod generic;
mod large;
mod small;
mod trace;

pub use backing::{BackingAllocator, Region, System};
pub use generic::{GenericAllocator, LARGE_THRESHOLD};
pub use small::{SmallAllocator, SmallStats};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// Whether constant-time structural checks are compiled in.
pub(crate) const fn constant_checks() -> bool {
    cfg!(feature = "invariant-checks")
}

/// Whether linear-scan structural checks are compiled in.
pub(crate) const fn full_checks() -> bool {
    cfg!(feature = "invariant-checks-full")
}

/// Lock-wrapped [`GenericAllocator`] usable as the global allocator.
///
/// The lock only serializes callers; the core stays single-threaded. Being
/// a static is also what makes the deallocation contract trivial: a global
/// never moves, so pointers may be freed at any later time.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: tieralloc::Allocator<tieralloc::System> =
///     tieralloc::Allocator::new(tieralloc::System);
/// ```
pub struct Allocator<B: BackingAllocator, const A: usize = 64> {
    inner: spin::Mutex<GenericAllocator<B, A>>,
}

impl<B: BackingAllocator, const A: usize> Allocator<B, A> {
    /// Create a new [`Allocator`] over `backing`.
    ///
    /// This is a `const fn`, so the allocator can be created directly in
    /// the `static` it is assigned to. No memory is requested until the
    /// first allocation.
    ///
    /// # Panics
    /// Panics if `A` is not a power of two or is too small to hold an
    /// allocation header.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new(backing: B) -> Self {
        Self {
            inner: spin::Mutex::new(GenericAllocator::new(backing)),
        }
    }
}

unsafe impl<B: BackingAllocator, const A: usize> GlobalAlloc for Allocator<B, A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > A {
            return ptr::null_mut();
        }
        match self.inner.lock().alloc(layout.size()) {
            Some(region) => region.begin,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let region = Region::new(ptr, ptr.add(layout.size()));
        self.inner.lock().dealloc(region);
    }
}
