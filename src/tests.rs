use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::api::{
    AllocationError, Collectable, Finalize, FixedSize, Gc, HasFinalizer, Trace, Visitor,
};
use crate::generation::Generation;
use crate::generational::{GenCopyGC, GenCopyOptions};
use crate::letroot;
use crate::segment::{HEAP_ALIGN, SEGMENT_ALIGNMENT};

fn small_heap() -> Box<GenCopyGC> {
    let _ = env_logger::builder().is_test(true).try_init();
    GenCopyGC::new(GenCopyOptions {
        young_min_size: HEAP_ALIGN * 2,
        young_max_size: HEAP_ALIGN * 4,
        old_min_size: HEAP_ALIGN * 16,
        old_max_size: HEAP_ALIGN * 64,
        ..Default::default()
    })
}

// Big enough that three of them overflow the smallest young generation.
struct Payload {
    data: [u8; 3000],
}
unsafe impl Trace for Payload {}
unsafe impl Finalize for Payload {}
impl Collectable for Payload {}

struct Pair {
    other: Option<Gc<Pair>>,
    name: u32,
}
unsafe impl Trace for Pair {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.other.trace(vis);
    }
}
unsafe impl Finalize for Pair {}
impl Collectable for Pair {}

struct Holder {
    inner: Option<Gc<u32>>,
}
unsafe impl Trace for Holder {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.inner.trace(vis);
    }
}
unsafe impl Finalize for Holder {}
impl Collectable for Holder {}

struct Tracker {
    hits: Arc<AtomicUsize>,
}
impl Drop for Tracker {
    fn drop(&mut self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}
unsafe impl Trace for Tracker {}
unsafe impl Finalize for Tracker {}
impl Collectable for Tracker {}

struct Big {
    data: [u8; 32 * 1024],
}
unsafe impl Trace for Big {}
unsafe impl Finalize for Big {}
impl Collectable for Big {}

#[repr(align(16))]
struct WideAligned {
    value: u64,
}
unsafe impl Trace for WideAligned {}
unsafe impl Finalize for WideAligned {}
impl Collectable for WideAligned {}

#[test]
fn payloads_are_placed_on_their_alignment() {
    let mut heap = small_heap();
    let number = heap.allocate(7u64);
    assert_eq!(
        &*number as *const u64 as usize % std::mem::align_of::<u64>(),
        0
    );
    let pair = heap.allocate(Pair {
        other: None,
        name: 5,
    });
    assert_eq!(
        &*pair as *const Pair as usize % std::mem::align_of::<Pair>(),
        0
    );
}

#[test]
#[should_panic]
fn over_aligned_payloads_are_rejected() {
    let mut heap = small_heap();
    let _ = heap.allocate(WideAligned { value: 1 });
}

#[test]
#[should_panic]
fn generation_bounds_beyond_one_window_are_rejected_at_startup() {
    let _ = GenCopyGC::new(GenCopyOptions {
        old_max_size: SEGMENT_ALIGNMENT * 2,
        ..Default::default()
    });
}

#[test]
fn minor_collection_runs_when_the_bump_path_fails() {
    let mut heap = small_heap();
    let stack = heap.shadow_stack();
    letroot!(keep = stack, heap.allocate(Payload { data: [1; 3000] }));
    let _dead = heap.allocate(Payload { data: [2; 3000] });
    let third = heap.allocate(Payload { data: [3; 3000] });
    assert_eq!(heap.statistics().minor_collections, 1);
    assert!(!heap.is_young(*keep));
    assert!(heap.is_young(third));
    assert_eq!(keep.data[0], 1);
    assert_eq!(third.data[0], 3);
}

#[test]
fn cyclic_pair_is_copied_once_with_the_cycle_intact() {
    let mut heap = small_heap();
    let stack = heap.shadow_stack();
    letroot!(a = stack, heap.allocate(Pair { other: None, name: 1 }));
    let mut b = heap.allocate(Pair { other: None, name: 2 });
    a.other = Some(b);
    b.other = Some(*a);

    heap.minor_collection(&mut []);

    assert!(!heap.is_young(*a));
    let b_moved = a.other.unwrap();
    assert!(!heap.is_young(b_moved));
    assert_eq!(b_moved.name, 2);
    assert!(Gc::ptr_eq(&b_moved.other.unwrap(), &*a));
}

#[test]
fn every_path_to_an_object_resolves_to_the_same_copy() {
    let mut heap = small_heap();
    let stack = heap.shadow_stack();
    letroot!(a = stack, heap.allocate(7u32));
    letroot!(b = stack, *a);
    heap.minor_collection(&mut []);
    assert!(Gc::ptr_eq(&*a, &*b));
    assert_eq!(**a, 7);
}

#[test]
fn finalizer_runs_exactly_once_for_dead_young_cells() {
    let mut heap = small_heap();
    let hits = Arc::new(AtomicUsize::new(0));
    let _dead = heap.allocate(Tracker { hits: hits.clone() });
    heap.minor_collection(&mut []);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    heap.minor_collection(&mut []);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn promoted_finalizable_cells_migrate_and_finalize_later() {
    let mut heap = small_heap();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let stack = heap.shadow_stack();
        letroot!(keep = stack, heap.allocate(Tracker { hits: hits.clone() }));
        heap.minor_collection(&mut []);
        assert!(!heap.is_young(*keep));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
    heap.full_collection(&mut []);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn weak_references_follow_referents_and_observe_death() {
    let mut heap = small_heap();
    let stack = heap.shadow_stack();
    letroot!(strong = stack, heap.allocate(123u32));
    let weak = heap.allocate_weak(*strong);
    let dead = heap.allocate(5u32);
    let dead_weak = heap.allocate_weak(dead);
    drop(dead);

    heap.minor_collection(&mut []);

    let upgraded = weak.upgrade().unwrap();
    assert!(Gc::ptr_eq(&upgraded, &*strong));
    assert_eq!(*upgraded, 123);
    assert!(dead_weak.upgrade().is_none());

    heap.full_collection(&mut []);
    let upgraded = weak.upgrade().unwrap();
    assert!(Gc::ptr_eq(&upgraded, &*strong));
}

#[test]
fn cleared_weak_slots_leave_the_scan_registry() {
    let mut heap = small_heap();
    let dead = heap.allocate(5u32);
    let dead_weak = heap.allocate_weak(dead);
    drop(dead);
    assert_eq!(heap.live_weak_slots(), 1);

    heap.minor_collection(&mut []);

    assert!(dead_weak.upgrade().is_none());
    assert_eq!(heap.live_weak_slots(), 0);
    // the handle stays valid after its slot left the registry
    heap.minor_collection(&mut []);
    assert!(dead_weak.upgrade().is_none());
}

#[test]
fn write_barrier_keeps_old_to_young_references_alive() {
    let mut heap = small_heap();
    let stack = heap.shadow_stack();
    letroot!(holder = stack, heap.allocate(Holder { inner: None }));
    heap.minor_collection(&mut []);
    assert!(!heap.is_young(*holder));

    let young = heap.allocate(420u32);
    holder.inner = Some(young);
    heap.write_barrier(*holder);

    heap.minor_collection(&mut []);
    let inner = holder.inner.unwrap();
    assert!(!heap.is_young(inner));
    assert_eq!(*inner, 420);
}

#[test]
fn external_memory_charges_shrink_the_allocatable_window() {
    let mut heap = small_heap();
    let before = heap.young_gen().available();
    heap.young_gen_mut().credit_external_memory(HEAP_ALIGN);
    assert_eq!(heap.young_gen().available(), before - HEAP_ALIGN);
    assert_eq!(
        heap.young_gen().effective_size(),
        heap.young_gen().size() - HEAP_ALIGN
    );
    heap.young_gen_mut().debit_external_memory(HEAP_ALIGN);
    assert_eq!(heap.young_gen().available(), before);
}

#[test]
#[should_panic]
fn unbalanced_external_debit_is_fatal() {
    let mut heap = small_heap();
    heap.young_gen_mut().debit_external_memory(1);
}

#[test]
fn dead_objects_disappear_from_heap_iteration() {
    let mut heap = small_heap();
    let _dead = heap.allocate(9u32);
    let mut count = 0;
    heap.young_gen().for_all_objects(&mut |_| count += 1);
    assert_eq!(count, 1);

    heap.minor_collection(&mut []);

    let mut survivors = 0;
    heap.young_gen().for_all_objects(&mut |_| survivors += 1);
    heap.old_gen().for_all_objects(&mut |_| survivors += 1);
    assert_eq!(survivors, 0);
}

#[test]
fn oversized_allocations_land_in_the_old_generation() {
    let mut heap = small_heap();
    let big = heap.allocate(Big {
        data: [0u8; 32 * 1024],
    });
    assert!(!heap.is_young(big));
    assert_eq!(big.data[17], 0);
}

#[test]
fn fixed_size_requests_report_exhaustion_instead_of_escaping_young() {
    let mut heap = small_heap();
    let max = heap.young_gen().max_size();
    heap.young_gen_mut().credit_external_memory(max - 64);
    let result = heap.allocate_raw(512, HasFinalizer::No, FixedSize::Yes);
    assert!(matches!(
        result,
        Err(AllocationError::OutOfMemory { .. })
    ));
}

#[test]
fn requested_collection_runs_at_the_next_safe_point() {
    let mut heap = small_heap();
    let request = heap.collection_request();
    assert!(!heap.safepoint(&mut []));
    request.request();
    assert!(heap.safepoint(&mut []));
    assert!(!heap.safepoint(&mut []));
    assert_eq!(heap.statistics().minor_collections, 1);
}

#[test]
fn root_constraints_are_scanned_every_cycle() {
    let mut heap = small_heap();
    let global = Box::leak(Box::new(heap.allocate(31u32)));
    let global_ptr = global as *mut Gc<u32>;
    heap.add_constraint(move |vis| unsafe {
        (*global_ptr).trace(vis);
    });
    heap.minor_collection(&mut []);
    unsafe {
        assert!(!heap.is_young(*global_ptr));
        assert_eq!(**global_ptr, 31);
    }
}

#[test]
fn young_generation_resizes_with_the_survival_rate() {
    let mut heap = small_heap();
    let before = heap.young_gen().size();
    {
        let stack = heap.shadow_stack();
        letroot!(keep = stack, heap.allocate(Payload { data: [1; 3000] }));
        heap.minor_collection(&mut []);
        assert!(heap.young_gen().size() > before);
    }
    let _dead = heap.allocate(Payload { data: [2; 3000] });
    heap.minor_collection(&mut []);
    assert_eq!(heap.young_gen().size(), before);
}

#[test]
fn full_collection_reclaims_dead_promoted_objects() {
    let mut heap = small_heap();
    {
        let stack = heap.shadow_stack();
        letroot!(a = stack, heap.allocate(Payload { data: [1; 3000] }));
        letroot!(b = stack, heap.allocate(Payload { data: [2; 3000] }));
        heap.minor_collection(&mut []);
        assert!(heap.old_gen().used() >= 6000);
    }
    let reclaimed = heap.full_collection(&mut []);
    assert!(reclaimed >= 6000);
    assert_eq!(heap.old_gen().used(), 0);
}

#[test]
fn dynamic_casts_recover_the_concrete_type() {
    let mut heap = small_heap();
    let value = heap.allocate(33i64);
    let dynamic = value.to_dyn();
    assert!(dynamic.is::<i64>());
    assert!(dynamic.downcast::<u8>().is_none());
    assert_eq!(*dynamic.downcast::<i64>().unwrap(), 33);
}

#[test]
fn statistics_track_promotion_and_allocation() {
    let mut heap = small_heap();
    let stack = heap.shadow_stack();
    letroot!(keep = stack, heap.allocate(Payload { data: [7; 3000] }));
    assert!(heap.statistics().bytes_allocated_since_last_gc >= 3000);

    heap.minor_collection(&mut []);

    let stats = heap.statistics();
    assert_eq!(stats.minor_collections, 1);
    assert!(stats.bytes_promoted_total >= 3000);
    assert!(stats.survival_rate > 0.9);
    assert_eq!(stats.bytes_allocated_since_last_gc, 0);
    assert!(format!("{}", stats).contains("Collections: 1 young"));
}
