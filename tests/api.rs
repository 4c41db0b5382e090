use tieralloc::{Allocator, System};

#[test]
fn is_usable_in_const_contexts() {
    const _ALLOCATOR1: Allocator<System> = Allocator::new(System);
    static _ALLOCATOR2: Allocator<System> = Allocator::new(System);
}

#[test]
fn supports_global_alloc() {
    fn assert<T: core::alloc::GlobalAlloc>(_: T) {}
    assert(Allocator::<System>::new(System));
}

#[test]
fn supports_custom_slot_alignments() {
    const _ALLOCATOR1: Allocator<System, 32> = Allocator::new(System);
    const _ALLOCATOR2: Allocator<System, 128> = Allocator::new(System);
}

#[test]
#[should_panic(expected = "power of two")]
fn alignment_must_be_a_power_of_two() {
    let _allocator = Allocator::<System, 48>::new(System); // panic here
}

#[test]
#[should_panic(expected = "allocation header")]
fn alignment_must_hold_an_allocation_header() {
    let _allocator = Allocator::<System, 8>::new(System); // panic here
}
