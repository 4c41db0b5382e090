//! The per-allocation header and the packing adapter around
//! [`Bucket::try_alloc`]/[`Bucket::dealloc`].
//!
//! Every small allocation is one slot larger than requested; the extra
//! leading slot stores a [`Header`] with the total length and the owning
//! bucket, so deallocation finds its way home in O(1) without consulting
//! any global lookup structure.
//!
//! [`Bucket::try_alloc`]: super::bucket::Bucket::try_alloc
//! [`Bucket::dealloc`]: super::bucket::Bucket::dealloc

use core::ptr;

use crate::backing::Region;

use super::bucket::{Bucket, DeallocStatus};

/// The one-slot prefix in front of every small allocation.
///
/// `size` is the total length of the underlying bucket allocation in bytes,
/// header slot included. The user-visible pointer is `A` bytes past the
/// header.
#[repr(C)]
pub(crate) struct Header<const A: usize> {
    pub(crate) size: usize,
    pub(crate) bucket: *mut Bucket<A>,
}

/// Serve a `size`-byte request from `bucket`, prefixing it with a header.
///
/// Returns the user-visible range, which starts one slot after the range
/// the bucket reserved.
///
/// # Safety
/// `bucket` must point to a live, initialized bucket.
pub(crate) unsafe fn pack<const A: usize>(
    bucket: *mut Bucket<A>,
    size: usize,
) -> Option<Region> {
    let reserved = (*bucket).try_alloc(size + A)?;
    // SAFETY (writing): the reserved range starts slot-aligned inside the
    // bucket's slot region and spans at least one slot, which the constant
    // assertions in the crate root guarantee to hold a header.
    reserved.begin.cast::<Header<A>>().write(Header {
        size: reserved.len(),
        bucket,
    });
    Some(Region::new(reserved.begin.add(A), reserved.end))
}

/// Route a user pointer back to its bucket via the embedded header.
///
/// The caller-supplied `end` of `region` is ignored; the authoritative
/// length lives in the header. Returns the bucket together with the
/// deallocation status so the caller can decide about shrinking.
///
/// # Safety
/// `region.begin` must be a pointer previously returned by [`pack`] and not
/// yet deallocated.
pub(crate) unsafe fn unpack<const A: usize>(region: Region) -> (DeallocStatus, *mut Bucket<A>) {
    let header_ptr = region.begin.sub(A).cast::<Header<A>>();
    let header = header_ptr.read();
    if header.bucket.is_null() || !(*header.bucket).is_initialized() {
        return (DeallocStatus::Corrupted, ptr::null_mut());
    }
    let begin = header_ptr.cast::<u8>();
    let status = (*header.bucket).dealloc(Region::new(begin, begin.add(header.size)));
    (status, header.bucket)
}

#[cfg(test)]
mod tests {
    use core::mem;
    use core::ptr;

    use super::{pack, unpack, Header};
    use crate::backing::Region;
    use crate::small::bucket::{Bucket, DeallocStatus};

    #[repr(align(64))]
    struct Arena([u8; 4096]);

    #[test]
    fn header_fits_into_one_slot() {
        assert!(mem::size_of::<Header<64>>() <= 64);
    }

    #[test]
    fn pack_writes_header_and_offsets_pointer() {
        let mut arena = Arena([0; 4096]);
        let begin = arena.0.as_mut_ptr();
        let region = Region::new(begin, unsafe { begin.add(arena.0.len()) });
        let mut bucket = unsafe { Bucket::<64>::new(region, ptr::null_mut()) };
        let bucket_ptr: *mut Bucket<64> = &mut bucket;

        let user = unsafe { pack(bucket_ptr, 100) }.unwrap();
        // 100 bytes plus the header slot round up to three slots; the user
        // range spans the two slots after the header.
        assert_eq!(user.len(), 128);
        assert_eq!(user.begin as usize % 64, 0);

        let header = unsafe { user.begin.sub(64).cast::<Header<64>>().read() };
        assert_eq!(header.size, 192);
        assert_eq!(header.bucket, bucket_ptr);

        let (status, owner) = unsafe { unpack::<64>(user) };
        assert_eq!(status, DeallocStatus::SuccessNowEmpty);
        assert_eq!(owner, bucket_ptr);
        assert_eq!(bucket.free_elements(), bucket.total_slots());
    }

    #[test]
    fn unpack_rejects_destroyed_buckets() {
        let mut arena = Arena([0; 4096]);
        let begin = arena.0.as_mut_ptr();
        let region = Region::new(begin, unsafe { begin.add(arena.0.len()) });
        let mut bucket = unsafe { Bucket::<64>::new(region, ptr::null_mut()) };
        let bucket_ptr: *mut Bucket<64> = &mut bucket;

        let user = unsafe { pack(bucket_ptr, 16) }.unwrap();
        bucket.destroy();

        let (status, owner) = unsafe { unpack::<64>(user) };
        assert_eq!(status, DeallocStatus::Corrupted);
        assert!(owner.is_null());
    }
}
