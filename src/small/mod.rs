//! The small-object allocator: nodes of buckets, a rotating cursor and the
//! grow/shrink machinery.
//!
//! Allocation starts at the cursor, the bucket that served the previous
//! request, on the assumption that small allocations are short-lived, so
//! recently used buckets are the most likely to have room. After a fixed
//! number of probes the allocator stops searching and grows instead,
//! constructing a fresh bucket in the first uninitialized cell (appending a
//! new node if no cell is left anywhere).
//!
//! Shrinking is driven by deallocation: a bucket whose last occupied slot
//! is freed gives its backing region back immediately, and a non-head node
//! whose last bucket disappears is unlinked and released as well. Together
//! with the large path this yields the conservation guarantee: no live user
//! allocations, no backing bytes held.

pub(crate) mod bucket;
pub(crate) mod free_list;
pub(crate) mod header;
pub(crate) mod node;

use core::cmp::max;
use core::mem;
use core::ptr;

use crate::backing::{BackingAllocator, Region};
use crate::trace::{heap_debug, heap_trace};

use self::bucket::{Bucket, DeallocStatus};
use self::node::{Node, BUCKET_COUNT};

/// Number of buckets tried before the allocator gives up searching and
/// constructs a new bucket. Keeps allocation latency bounded on fragmented
/// heaps at the cost of eager growth.
const ALLOC_PROBE_LIMIT: usize = 6;

fn write_ptr_debug(buf: &mut [u8], prefix: &[u8], val: usize) -> usize {
    let mut n = 0;
    for &b in prefix {
        buf[n] = b;
        n += 1;
    }
    let hex = b"0123456789abcdef";
    for shift in (0..16).rev() {
        buf[n] = hex[(val >> (shift * 4)) & 0xf];
        n += 1;
    }
    buf[n] = b'\n';
    n += 1;
    n
}

/// Persistent cursor state.
///
/// A null node pointer encodes the inline head node: the allocator must not
/// store its own address, since that would break as soon as the value is
/// moved before any allocation happened.
#[derive(Clone, Copy)]
struct Cursor<const A: usize> {
    node: *mut Node<A>,
    index: usize,
}

/// A resolved position in the bucket lists, used while walking.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Walk<const A: usize> {
    node: *mut Node<A>,
    index: usize,
}

impl<const A: usize> Walk<A> {
    /// The bucket cell at this position.
    ///
    /// # Safety
    /// `self.node` must point to a live node.
    unsafe fn bucket(&self) -> *mut Bucket<A> {
        ptr::addr_of_mut!((*self.node).buckets)
            .cast::<Bucket<A>>()
            .add(self.index)
    }

    /// Advance to the next cell, moving to the next node at the end of the
    /// array and wrapping around to `head` after the last node.
    ///
    /// # Safety
    /// `self.node` must point to a live node and `head` to the head node.
    unsafe fn next(&mut self, head: *mut Node<A>) {
        if self.index < BUCKET_COUNT - 1 {
            self.index += 1;
            return;
        }
        let next = (*self.node).next;
        self.node = if next.is_null() { head } else { next };
        self.index = 0;
    }
}

/// Counters describing the current shape of a [`SmallAllocator`].
///
/// Gathered by a full walk over all nodes; meant for tests, diagnostics and
/// log output, not for hot paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallStats {
    /// Number of nodes in the list, the head included.
    pub nodes: usize,
    /// Number of initialized buckets across all nodes.
    pub initialized_buckets: usize,
    /// Slot capacity summed over all initialized buckets.
    pub total_slots: usize,
    /// Free slots summed over all initialized buckets.
    pub free_slots: usize,
    /// The head node's count of uninitialized cells.
    pub head_free_buckets: usize,
}

impl SmallStats {
    /// Slots currently backing live allocations (headers included).
    #[must_use]
    pub fn occupied_slots(&self) -> usize {
        self.total_slots - self.free_slots
    }
}

/// The small-object allocator.
///
/// `A` is the slot size and alignment; it must be a power of two large
/// enough to hold an allocation header. All returned regions are `A`-aligned
/// at both ends.
pub struct SmallAllocator<B: BackingAllocator, const A: usize = 64> {
    head: Node<A>,
    backing: B,
    cursor: Cursor<A>,
}

// SAFETY: all raw pointers reachable from a `SmallAllocator` point into
// memory exclusively owned by it (bucket regions and nodes it allocated),
// so sending the whole object to another thread moves the entire graph.
unsafe impl<B: BackingAllocator + Send, const A: usize> Send for SmallAllocator<B, A> {}

impl<B: BackingAllocator, const A: usize> SmallAllocator<B, A> {
    /// Create an empty allocator on top of `backing`.
    ///
    /// No backing memory is requested until the first allocation.
    ///
    /// # Panics
    /// Panics if `A` is not a power of two or too small to hold an
    /// allocation header.
    #[must_use]
    pub const fn new(backing: B) -> Self {
        assert!(A.is_power_of_two(), "slot alignment must be a power of two");
        assert!(
            A >= mem::size_of::<header::Header<A>>(),
            "slot alignment too small to hold an allocation header"
        );
        Self {
            head: Node::new(),
            backing,
            cursor: Cursor {
                node: ptr::null_mut(),
                index: 0,
            },
        }
    }

    /// The backing allocator this allocator draws from.
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Turn the persistent cursor into a walkable position.
    fn resolve(cursor: Cursor<A>, head: *mut Node<A>) -> Walk<A> {
        Walk {
            node: if cursor.node.is_null() {
                head
            } else {
                cursor.node
            },
            index: cursor.index,
        }
    }

    /// Store a walk position back into the cursor, normalizing the head
    /// node to null.
    fn persist(cursor: &mut Cursor<A>, walk: Walk<A>, head: *mut Node<A>) {
        cursor.node = if walk.node == head {
            ptr::null_mut()
        } else {
            walk.node
        };
        cursor.index = walk.index;
    }

    /// Allocate `size` bytes (plus the internal header slot).
    ///
    /// Probes a bounded number of buckets starting at the cursor, then
    /// grows. Returns `None` only if the backing allocator refuses to
    /// provide more memory.
    pub fn allocate(&mut self, size: usize) -> Option<Region> {
        let head: *mut Node<A> = &mut self.head;
        let mut walk = Self::resolve(self.cursor, head);
        let mut probes = ALLOC_PROBE_LIMIT;

        loop {
            // SAFETY: the walk starts at a live position (cursor repair on
            // shrink keeps it valid) and `next` only moves along live
            // nodes.
            unsafe {
                let bucket = walk.bucket();
                if (*bucket).is_initialized() {
                    if let Some(region) = header::pack(bucket, size) {
                        Self::persist(&mut self.cursor, walk, head);
                        return Some(region);
                    }
                }
                walk.next(head);
            }

            probes -= 1;
            if probes == 0 {
                let fresh = self.construct_new_bucket(size)?;
                {
                    let mut buf = [0u8; 64];
                    let n = write_ptr_debug(&mut buf, b"allocate fresh=", fresh as usize);
                    unsafe { libc::write(2, buf.as_ptr().cast(), n) };
                }
                // SAFETY: `fresh` was just initialized and sized for this
                // request, so packing cannot fail.
                let region = unsafe { header::pack(fresh, size) };
                if let Some(r) = region {
                    let mut buf = [0u8; 64];
                    let n = write_ptr_debug(&mut buf, b"allocate region.begin=", r.begin as usize);
                    unsafe { libc::write(2, buf.as_ptr().cast(), n) };
                }
                debug_assert!(region.is_some(), "fresh bucket rejected its own request");
                return region;
            }
        }
    }

    /// Deallocate a region previously returned by [`allocate`].
    ///
    /// The `end` of the region is advisory; the true extent is read from
    /// the allocation header. Frees the owning bucket's backing region when
    /// the bucket becomes empty, and unlinks its node when the node becomes
    /// empty too.
    ///
    /// # Safety
    /// `region.begin` must come from a call to [`allocate`] on this very
    /// allocator value, it must not have been deallocated before, and the
    /// allocator must not have been moved since that `allocate` call.
    ///
    /// [`allocate`]: Self::allocate
    pub unsafe fn dealloc(&mut self, region: Region) {
        let (status, bucket) = header::unpack::<A>(region);

        if crate::full_checks() && !bucket.is_null() {
            let cleared = (*bucket).free_list_clear();
            assert!(
                !cleared || status == DeallocStatus::SuccessNowEmpty,
                "tieralloc: empty free list was not reported as such"
            );
        }

        match status {
            DeallocStatus::SuccessNowEmpty => self.destroy_unused_bucket(bucket),
            DeallocStatus::Success => {}
            failure => {
                if crate::constant_checks() {
                    panic!("tieralloc: small deallocation failed: {failure:?}");
                }
            }
        }
    }

    /// Construct a bucket able to hold `minimal_size` bytes, growing the
    /// node list if necessary.
    ///
    /// The capacity is padded twice: once for header overhead and alignment
    /// slack, once more before asking the backing allocator. Returns `None`
    /// if the backing allocator refuses.
    fn construct_new_bucket(&mut self, minimal_size: usize) -> Option<*mut Bucket<A>> {
        let minimal_size = max(minimal_size * 12 / 10, A * 50) + 3 * A;
        let request = minimal_size * 12 / 10;

        let head: *mut Node<A> = &mut self.head;
        let start = Self::resolve(self.cursor, head);
        let mut walk = start;
        loop {
            // SAFETY: same walk validity argument as in `allocate`.
            unsafe {
                let cell = walk.bucket();
                if !(*cell).is_initialized() {
                    let region = self.backing.allocate(request)?;
                    heap_debug!(
                        "constructed bucket: {} bytes at {:p}",
                        region.len(),
                        region.begin
                    );
                    cell.write(Bucket::new(region, walk.node));
                    (*walk.node).free_buckets -= 1;
                    if crate::full_checks() {
                        (*walk.node).validate_free_buckets();
                    }
                    return Some(cell);
                }
                walk.next(head);
            }
            if walk == start {
                break;
            }
        }

        // Every cell in every node is in use: append a fresh node at the
        // tail and construct the bucket in its first cell.
        let node = self.allocate_new_node()?;
        // SAFETY: `node` is a live, freshly initialized node; the tail walk
        // only touches live list members.
        unsafe {
            if crate::constant_checks() {
                assert!(
                    (*node).free_buckets == BUCKET_COUNT,
                    "tieralloc: fresh node is not fully free"
                );
            }
            let region = match self.backing.allocate(request) {
                Some(region) => region,
                None => {
                    self.release_node_storage(node);
                    return None;
                }
            };

            let mut tail = head;
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = node;
            (*node).prev = tail;
            heap_debug!("appended node at {:p}", node);

            let cell = ptr::addr_of_mut!((*node).buckets).cast::<Bucket<A>>();
            cell.write(Bucket::new(region, node));
            (*node).free_buckets -= 1;
            Some(cell)
        }
    }

    /// Obtain and initialize a fresh, unlinked node from the backing
    /// allocator.
    fn allocate_new_node(&mut self) -> Option<*mut Node<A>> {
        let region = self.backing.allocate(mem::size_of::<Node<A>>())?;
        let node = region.begin.cast::<Node<A>>();
        // SAFETY: the region holds at least `size_of::<Node>` bytes and the
        // backing contract guarantees sufficient alignment.
        unsafe { node.write(Node::new()) };
        Some(node)
    }

    /// Hand a node's storage back to the backing allocator.
    ///
    /// # Safety
    /// `node` must have been produced by [`allocate_new_node`] and must not
    /// be linked into the list anymore.
    ///
    /// [`allocate_new_node`]: Self::allocate_new_node
    unsafe fn release_node_storage(&mut self, node: *mut Node<A>) {
        let begin = node.cast::<u8>();
        self.backing
            .release(Region::new(begin, begin.add(mem::size_of::<Node<A>>())));
    }

    /// Release an empty bucket's backing region; unlink and release its
    /// node if that leaves the node without any initialized bucket.
    ///
    /// # Safety
    /// `bucket` must point to a live, initialized bucket owned by this
    /// allocator whose slots are all free.
    unsafe fn destroy_unused_bucket(&mut self, bucket: *mut Bucket<A>) {
        let head: *mut Node<A> = &mut self.head;
        let node = (*bucket).container();
        if crate::constant_checks() {
            assert!(
                (*node).contains_bucket(bucket),
                "tieralloc: bucket does not belong to its recorded node"
            );
        }

        heap_trace!("releasing bucket at {:p}", bucket);
        {
            let mut buf = [0u8; 64];
            let n = write_ptr_debug(&mut buf, b"destroy_unused cell=", bucket as usize);
            libc::write(2, buf.as_ptr().cast(), n);
            let mut buf2 = [0u8; 96];
            let n2 = write_ptr_debug(&mut buf2, b"          head=", &self.head as *const _ as usize);
            libc::write(2, buf2.as_ptr().cast(), n2);
            let mut buf3 = [0u8; 96];
            let n3 = write_ptr_debug(&mut buf3, b"          sizeof(bucket)=", mem::size_of::<Bucket<A>>());
            libc::write(2, buf3.as_ptr().cast(), n3);
        }
        self.backing.release((*bucket).region());
        (*bucket).destroy();
        (*node).free_buckets += 1;
        if crate::full_checks() {
            (*node).validate_free_buckets();
        }

        if (*node).free_buckets < BUCKET_COUNT {
            return;
        }
        if node == head {
            return;
        }

        // The node is about to disappear; park the cursor on its
        // predecessor (which always exists, the head never goes away).
        if Self::resolve(self.cursor, head).node == node {
            let repaired = Walk {
                node: (*node).prev,
                index: BUCKET_COUNT - 1,
            };
            Self::persist(&mut self.cursor, repaired, head);
        }

        if crate::full_checks() {
            assert!(
                !(*node).buckets.iter().any(Bucket::is_initialized),
                "tieralloc: releasing a node that still has initialized buckets"
            );
        }

        heap_debug!("unlinking node at {:p}", node);
        if !(*node).prev.is_null() {
            (*(*node).prev).next = (*node).next;
        }
        if !(*node).next.is_null() {
            (*(*node).next).prev = (*node).prev;
        }
        self.release_node_storage(node);
    }

    /// Walk all nodes and gather shape counters.
    pub fn stats(&self) -> SmallStats {
        let mut stats = SmallStats {
            nodes: 0,
            initialized_buckets: 0,
            total_slots: 0,
            free_slots: 0,
            head_free_buckets: self.head.free_buckets,
        };

        let mut current: *const Node<A> = &self.head;
        while !current.is_null() {
            // SAFETY: list members stay live until unlinked, and unlinked
            // nodes are unreachable from the head.
            let node = unsafe { &*current };
            stats.nodes += 1;
            for bucket in &node.buckets {
                if bucket.is_initialized() {
                    stats.initialized_buckets += 1;
                    stats.total_slots += bucket.total_slots();
                    stats.free_slots += bucket.free_elements();
                }
            }
            current = node.next;
        }
        stats
    }
}

impl<B: BackingAllocator, const A: usize> Drop for SmallAllocator<B, A> {
    fn drop(&mut self) {
        // Releasing while user allocations are live leaves their pointers
        // dangling; that is the caller's bargain. All backing memory is
        // returned unconditionally.
        for bucket in &mut self.head.buckets {
            if bucket.is_initialized() {
                // SAFETY: initialized buckets own their regions.
                unsafe {
                    let mut buf = [0u8; 64];
                    let n = write_ptr_debug(&mut buf, b"head drop cell=", bucket as *mut _ as usize);
                    libc::write(2, buf.as_ptr().cast(), n);
                    self.backing.release(bucket.region())
                };
                bucket.destroy();
            }
        }
        self.head.free_buckets = BUCKET_COUNT;

        let mut node = self.head.next;
        self.head.next = ptr::null_mut();
        while !node.is_null() {
            // SAFETY: the chain beyond the head consists of nodes allocated
            // by `allocate_new_node`, each owning its buckets' regions.
            unsafe {
                let next = (*node).next;
                for bucket in &mut (*node).buckets {
                    if bucket.is_initialized() {
                        self.backing.release(bucket.region());
                        bucket.destroy();
                    }
                }
                self.release_node_storage(node);
                node = next;
            }
        }
    }
}
