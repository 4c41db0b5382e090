//! Nodes: fixed-capacity arrays of bucket cells, chained into a doubly
//! linked list.
//!
//! The first node lives inline in the small allocator and is never
//! released; all further nodes are placed into regions obtained from the
//! backing allocator and handed back once every one of their bucket cells
//! is uninitialized again.

use core::ptr;

use super::bucket::Bucket;

/// Number of bucket cells per node.
pub(crate) const BUCKET_COUNT: usize = 64;

pub(crate) struct Node<const A: usize> {
    pub(crate) buckets: [Bucket<A>; BUCKET_COUNT],
    /// Count of cells whose bucket is uninitialized.
    pub(crate) free_buckets: usize,
    pub(crate) next: *mut Node<A>,
    pub(crate) prev: *mut Node<A>,
}

impl<const A: usize> Node<A> {
    pub(crate) const fn new() -> Self {
        Self {
            buckets: [Bucket::EMPTY; BUCKET_COUNT],
            free_buckets: BUCKET_COUNT,
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }

    /// Whether `bucket` points into this node's cell array.
    pub(crate) fn contains_bucket(&self, bucket: *const Bucket<A>) -> bool {
        let first = self.buckets.as_ptr();
        // SAFETY: one-past-the-end of the array is a valid pointer bound.
        let limit = unsafe { first.add(BUCKET_COUNT) };
        bucket >= first && bucket < limit
    }

    /// Recount the uninitialized cells and compare against `free_buckets`.
    ///
    /// # Panics
    /// Panics when the counter has drifted from the cells; that means a
    /// bookkeeping bug or memory corruption, neither of which is
    /// recoverable.
    pub(crate) fn validate_free_buckets(&self) {
        let actual = self
            .buckets
            .iter()
            .filter(|bucket| !bucket.is_initialized())
            .count();
        assert!(
            actual == self.free_buckets,
            "tieralloc: node counts {} free buckets but has {} uninitialized cells",
            self.free_buckets,
            actual,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{Node, BUCKET_COUNT};

    #[test]
    fn fresh_node_is_all_free() {
        let node = Node::<64>::new();
        assert_eq!(node.free_buckets, BUCKET_COUNT);
        assert!(node.next.is_null());
        assert!(node.prev.is_null());
        node.validate_free_buckets();
    }

    #[test]
    fn bucket_range_check() {
        let node = Node::<64>::new();
        assert!(node.contains_bucket(&node.buckets[0]));
        assert!(node.contains_bucket(&node.buckets[BUCKET_COUNT - 1]));

        let other = Node::<64>::new();
        assert!(!node.contains_bucket(&other.buckets[0]));
    }
}
