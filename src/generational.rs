//! # Generational copying collector
//!
//! The heap is split in two generations:
//!
//! - young objects: allocated in the young generation by bumping a pointer. When it is full we
//! do a minor collection; every surviving object is copied out into the old generation and the
//! segment is reset to its low bound. The young generation never compacts in place.
//!
//! - old objects: receive the survivors. The old generation is reclaimed only by the full
//! collection, which evacuates the live objects of *both* generations into a fresh segment
//! using the same forwarding protocol as the minor cycle.
//!
//! Collection is stop-the-world on the single mutator thread and is triggered only by an
//! allocation the bump path cannot satisfy, or by an explicit request honored at the next safe
//! point. While a cycle runs, strict phase ordering replaces locking: roots are rewritten
//! before any object body is scanned, the worklist is fully drained before weak references are
//! updated, and finalizers run last.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::api::{
    vtable_of, AllocationError, Collectable, FixedSize, Gc, HasFinalizer, Trace, Visitor, Weak,
    WeakSlot, MIN_ALLOCATION,
};
use crate::generation::Generation;
use crate::header::{ForwardState, HeapObjectHeader};
use crate::old::OldGen;
use crate::segment::{Segment, HEAP_ALIGN, SEGMENT_ALIGNMENT};
use crate::shadow_stack::ShadowStack;
use crate::statistics::{formatted_size, HeapStatistics};
use crate::young::YoungGen;
use crate::{align_usize, small_type_id};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum GcReason {
    RequestedByUser,
    AllocationFailure,
    OldSpaceFull,
}

/// Phase of an in-flight collection cycle. Cycles never interleave and never yield mid-cycle;
/// the phase is tracked so contract violations surface as a crash instead of heap corruption.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectionPhase {
    Idle,
    RootScan,
    Evacuate,
    UpdateReferences,
    Finalize,
}

/// Sizing windows for the two generations. Every bound must be a multiple of the 4 KiB sizing
/// granule, and each generation lives inside a single aligned segment window, so no bound may
/// exceed [`SEGMENT_ALIGNMENT`] (4 MiB). Larger maxima are rejected at construction.
pub struct GenCopyOptions {
    pub young_min_size: usize,
    pub young_max_size: usize,
    pub old_min_size: usize,
    pub old_max_size: usize,
    /// Survival rate at or above which the young generation is grown after a cycle.
    pub grow_survival_threshold: f64,
    /// Survival rate at or below which the young generation is shrunk after a cycle.
    pub shrink_survival_threshold: f64,
}

impl Default for GenCopyOptions {
    fn default() -> Self {
        Self {
            young_min_size: 256 * 1024,
            young_max_size: 1024 * 1024,
            old_min_size: 1024 * 1024,
            old_max_size: 4 * 1024 * 1024,
            grow_survival_threshold: 0.5,
            shrink_survival_threshold: 0.05,
        }
    }
}

/// Generational copying garbage collector.
///
/// Owns both generations, the rooting machinery and the collection policy. Constructed once at
/// runtime startup and owned by the embedding runtime instance; there is no ambient global
/// state.
pub struct GenCopyGC {
    young: YoungGen,
    old: OldGen,
    stack: ShadowStack,
    constraints: Vec<Box<dyn FnMut(&mut dyn Visitor)>>,
    weak_slots: Vec<NonNull<WeakSlot>>,
    /// Nulled slots pulled out of the scan registry. Outstanding `Weak` copies may still read
    /// them, so the boxes are only freed when the collector is dropped.
    dead_weak_slots: Vec<NonNull<WeakSlot>>,
    /// Old-generation cells that had a young pointer stored into them since the last cycle.
    remembered_set: Vec<*mut HeapObjectHeader>,
    /// FIFO scan worklist of freshly copied cells; breadth-first evacuation.
    worklist: VecDeque<*mut HeapObjectHeader>,
    phase: CollectionPhase,
    collection_requested: Arc<AtomicBool>,

    grow_survival_threshold: f64,
    shrink_survival_threshold: f64,

    minor_collections: usize,
    full_collections: usize,
    promoted_this_cycle: usize,
}

/// Handle for requesting a collection from outside the mutator (e.g. an operator signal). The
/// request is honored at the next safe point; it never interrupts an in-progress cycle.
#[derive(Clone)]
pub struct CollectionRequest {
    flag: Arc<AtomicBool>,
}

impl CollectionRequest {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

impl GenCopyGC {
    pub fn new(options: GenCopyOptions) -> Box<Self> {
        assert!(
            options.young_min_size % HEAP_ALIGN == 0
                && options.young_max_size % HEAP_ALIGN == 0
                && options.old_min_size % HEAP_ALIGN == 0
                && options.old_max_size % HEAP_ALIGN == 0,
            "generation bounds must be multiples of the sizing granule"
        );
        assert!(HEAP_ALIGN * 2 <= options.young_min_size);
        assert!(
            options.young_max_size <= SEGMENT_ALIGNMENT
                && options.old_max_size <= SEGMENT_ALIGNMENT,
            "a generation cannot exceed one segment window"
        );
        Box::new(Self {
            young: YoungGen::new(options.young_min_size, options.young_max_size),
            old: OldGen::new(options.old_min_size, options.old_max_size),
            stack: ShadowStack::new(),
            constraints: vec![],
            weak_slots: vec![],
            dead_weak_slots: vec![],
            remembered_set: vec![],
            worklist: VecDeque::new(),
            phase: CollectionPhase::Idle,
            collection_requested: Arc::new(AtomicBool::new(false)),
            grow_survival_threshold: options.grow_survival_threshold,
            shrink_survival_threshold: options.shrink_survival_threshold,
            minor_collections: 0,
            full_collections: 0,
            promoted_this_cycle: 0,
        })
    }

    /// Shadow stack used by [`letroot!`](crate::letroot) to pin values across collections.
    pub fn shadow_stack<'a>(&self) -> &'a ShadowStack {
        unsafe { std::mem::transmute(&self.stack) }
    }

    pub fn young_gen(&self) -> &YoungGen {
        &self.young
    }
    pub fn young_gen_mut(&mut self) -> &mut YoungGen {
        &mut self.young
    }
    pub fn old_gen(&self) -> &OldGen {
        &self.old
    }
    pub fn old_gen_mut(&mut self) -> &mut OldGen {
        &mut self.old
    }

    pub fn is_young<T: Collectable + ?Sized>(&self, object: Gc<T>) -> bool {
        self.young.contains(object.base.as_ptr().cast())
    }

    /// Registers a callback that enumerates roots at every RootScan (global handles, native
    /// references). Each reported pointer location is rewritten in place when its referent is
    /// relocated.
    pub fn add_constraint(&mut self, constraint: impl FnMut(&mut dyn Visitor) + 'static) {
        self.constraints.push(Box::new(constraint));
    }

    pub fn collection_request(&self) -> CollectionRequest {
        CollectionRequest {
            flag: self.collection_requested.clone(),
        }
    }

    /// Safe point: runs a young collection if one was requested since the last safe point.
    /// Returns whether a collection ran.
    pub fn safepoint(&mut self, keep: &mut [&mut dyn Trace]) -> bool {
        if self.collection_requested.swap(false, Ordering::AcqRel) {
            self.collect_at_safepoint(keep);
            true
        } else {
            false
        }
    }

    fn collect_at_safepoint(&mut self, keep: &mut [&mut dyn Trace]) {
        if self.old.available() >= self.young.segment().used() {
            self.collect_young(keep, GcReason::RequestedByUser);
        } else {
            self.collect_full(keep, GcReason::RequestedByUser);
        }
    }

    /// Allocates `value` on the heap, aborting the process when the heap is exhausted.
    #[inline]
    pub fn allocate<T: Collectable + 'static>(&mut self, value: T) -> Gc<T> {
        match self.try_allocate(value) {
            Ok(object) => object,
            Err(error) => oom_abort(&error),
        }
    }

    /// Allocates `value` on the heap. On exhaustion, after collection and growth attempts,
    /// the failure is returned as an ordinary value for the runtime to surface to the managed
    /// program.
    pub fn try_allocate<T: Collectable + 'static>(
        &mut self,
        mut value: T,
    ) -> Result<Gc<T>, AllocationError> {
        // Payloads sit at a fixed header offset from an 8-byte boundary; a stronger alignment
        // requirement cannot be honored and would hand out misaligned references.
        assert!(
            std::mem::align_of::<T>() <= MIN_ALLOCATION,
            "payload alignment exceeds the allocation granule"
        );
        if self.collection_requested.swap(false, Ordering::AcqRel) {
            self.collect_at_safepoint(&mut [&mut value]);
        }
        let size = align_usize(
            value.allocation_size() + size_of::<HeapObjectHeader>(),
            MIN_ALLOCATION,
        );
        let has_finalizer = std::mem::needs_drop::<T>();
        let cell =
            self.allocate_raw_inner(size, has_finalizer, FixedSize::No, &mut [&mut value])?;
        unsafe {
            let header = cell.as_ptr();
            (*header).vtable = vtable_of::<T>();
            (*header).type_id = small_type_id::<T>();
            ((*header).data() as *mut T).write(value);
            Ok(Gc {
                base: cell,
                marker: PhantomData,
            })
        }
    }

    /// Untyped allocation entry point for runtime clients that lay out cells themselves:
    /// `size` is the payload size in bytes, the header is added internally. The caller must
    /// install the capability vtable before the next collection can run, and the cell layout
    /// must not require alignment beyond [`MIN_ALLOCATION`].
    pub fn allocate_raw(
        &mut self,
        size: usize,
        has_finalizer: HasFinalizer,
        fixed_size: FixedSize,
    ) -> Result<NonNull<HeapObjectHeader>, AllocationError> {
        if self.collection_requested.swap(false, Ordering::AcqRel) {
            self.collect_at_safepoint(&mut []);
        }
        let size = align_usize(size + size_of::<HeapObjectHeader>(), MIN_ALLOCATION);
        self.allocate_raw_inner(size, has_finalizer == HasFinalizer::Yes, fixed_size, &mut [])
    }

    /// Registers a weak reference to `target`. The reference is redirected when the referent
    /// moves and nulled when it dies; it does not keep the referent alive.
    pub fn allocate_weak<T: Collectable + ?Sized>(&mut self, target: Gc<T>) -> Weak<T> {
        let slot = Box::into_raw(Box::new(WeakSlot {
            value: target.base.as_ptr(),
        }));
        unsafe {
            let slot = NonNull::new_unchecked(slot);
            self.weak_slots.push(slot);
            Weak {
                slot,
                marker: PhantomData,
            }
        }
    }

    /// Generational write barrier. Must be called after storing a pointer to a (potentially
    /// young) object into `object`'s fields; old-generation holders are recorded so the next
    /// minor cycle can find the cross-generation reference.
    #[inline]
    pub fn write_barrier<T: Collectable + ?Sized>(&mut self, object: Gc<T>) {
        unsafe {
            let header = object.header();
            if self.old.contains(header.cast()) && !(*header).is_remembered() {
                self.write_barrier_slow(header);
            }
        }
    }

    #[cold]
    fn write_barrier_slow(&mut self, header: *mut HeapObjectHeader) {
        unsafe {
            (*header).set_remembered(true);
        }
        self.remembered_set.push(header);
    }

    /// Runs a young-generation collection. Falls back to a full collection when the old
    /// generation lacks the worst-case headroom the admission check requires.
    pub fn minor_collection(&mut self, keep: &mut [&mut dyn Trace]) {
        if self.old.available() >= self.young.segment().used() {
            self.collect_young(keep, GcReason::RequestedByUser);
        } else {
            self.full_collection(keep);
        }
    }

    /// Evacuates the live objects of both generations into a fresh old segment. Returns the
    /// number of reclaimed bytes (0 when the collection could not run because the worst-case
    /// survivor volume exceeds the old generation's maximum size).
    pub fn full_collection(&mut self, keep: &mut [&mut dyn Trace]) -> usize {
        match self.collect_full(keep, GcReason::RequestedByUser) {
            Some(reclaimed) => reclaimed,
            None => {
                warn!(
                    "full collection skipped: worst-case survivors exceed the old generation maximum"
                );
                0
            }
        }
    }

    fn allocate_raw_inner(
        &mut self,
        size: usize,
        has_finalizer: bool,
        fixed_size: FixedSize,
        keep: &mut [&mut dyn Trace],
    ) -> Result<NonNull<HeapObjectHeader>, AllocationError> {
        debug_assert!(size % MIN_ALLOCATION == 0);
        if fixed_size == FixedSize::Yes {
            // Fixed-size cells must always be young-generation satisfiable.
            assert!(
                size <= self.young.max_size(),
                "fixed-size allocation larger than the young generation"
            );
        }
        let mut memory = self.young.alloc_raw(size);
        if memory.is_null() {
            memory = self.alloc_slow(size, fixed_size, keep)?;
        }
        unsafe {
            let header = memory.cast::<HeapObjectHeader>();
            header.write(HeapObjectHeader::new(0, size, 0));
            (*header).set_has_finalizer(has_finalizer);
            if has_finalizer {
                if self.young.contains(memory) {
                    self.young.register_finalizable(header);
                } else {
                    self.old.register_finalizable(header);
                }
            }
            Ok(NonNull::new_unchecked(header))
        }
    }

    /// Slow path taken when the bump path fails: young collection behind the admission check,
    /// then the full-collection fallback chain.
    #[cold]
    #[inline(never)]
    fn alloc_slow(
        &mut self,
        size: usize,
        fixed_size: FixedSize,
        keep: &mut [&mut dyn Trace],
    ) -> Result<*mut u8, AllocationError> {
        // A request the young generation could never hold goes straight to the old
        // generation; collecting first would not help it fit.
        if fixed_size == FixedSize::No && size > self.young.max_size() {
            if let Ok(memory) = self.alloc_direct_old(size) {
                return Ok(memory);
            }
            return self.full_collect_then_alloc(size, fixed_size, keep);
        }
        // Admission: a young collection may only start when the old generation could absorb
        // the worst case, i.e. every currently-used byte of the young generation surviving.
        if self.old.available() >= self.young.segment().used() {
            self.collect_young(keep, GcReason::AllocationFailure);
            let memory = self.young.alloc_raw(size);
            if !memory.is_null() {
                return Ok(memory);
            }
            if self.young.grow_to_fit(size) {
                let memory = self.young.alloc_raw(size);
                if !memory.is_null() {
                    return Ok(memory);
                }
            }
        }
        self.full_collect_then_alloc(size, fixed_size, keep)
    }

    /// Taken when young-gen collection is not possible or was not enough: full-collect the
    /// heap, and if that restores worst-case headroom retry the allocation from scratch. If
    /// not, grow the old generation and retry. Fixed-size allocations must always be satisfied
    /// from the young generation, so exhaustion there is reported to the caller; other
    /// allocations fall back to the old generation directly.
    #[cold]
    fn full_collect_then_alloc(
        &mut self,
        size: usize,
        fixed_size: FixedSize,
        keep: &mut [&mut dyn Trace],
    ) -> Result<*mut u8, AllocationError> {
        if self.collect_full(keep, GcReason::OldSpaceFull).is_some() {
            let memory = self.young.alloc_raw(size);
            if !memory.is_null() {
                return Ok(memory);
            }
            if self.young.grow_to_fit(size) {
                let memory = self.young.alloc_raw(size);
                if !memory.is_null() {
                    return Ok(memory);
                }
            }
        }

        // Restore worst-case headroom by growing the old generation, then retry from scratch.
        let desired = self
            .old
            .adjust_size(self.old.used() + self.young.segment().used() + size);
        if desired > self.old.size() {
            self.old.grow_to(desired);
            if self.old.available() >= self.young.segment().used() {
                self.collect_young(keep, GcReason::AllocationFailure);
                let memory = self.young.alloc_raw(size);
                if !memory.is_null() {
                    return Ok(memory);
                }
                if self.young.grow_to_fit(size) {
                    let memory = self.young.alloc_raw(size);
                    if !memory.is_null() {
                        return Ok(memory);
                    }
                }
            }
        }

        if fixed_size == FixedSize::No {
            // The request may exceed anything the young generation could ever hold; place it
            // in the old generation instead.
            return self.alloc_direct_old(size);
        }
        Err(AllocationError::OutOfMemory { requested: size })
    }

    fn alloc_direct_old(&mut self, size: usize) -> Result<*mut u8, AllocationError> {
        let memory = self.old.alloc_raw(size);
        if !memory.is_null() {
            return Ok(memory);
        }
        let desired = self.old.adjust_size(self.old.used() + size);
        if desired > self.old.size() {
            self.old.grow_to(desired);
            let memory = self.old.alloc_raw(size);
            if !memory.is_null() {
                return Ok(memory);
            }
        }
        Err(AllocationError::OutOfMemory { requested: size })
    }

    /// The forwarding operation of the minor cycle. If `*root` points into the young
    /// generation: a cell already holding a forwarding pointer just has the location rewritten
    /// (idempotent, O(1)); otherwise the cell is copied into the old generation, the
    /// forwarding pointer installed, and the copy queued for scanning. At most one copy per
    /// live object, no matter how many locations reach it.
    fn ensure_referent_copied(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        let cell = root.as_ptr();
        if !self.young.contains(cell.cast()) {
            return;
        }
        unsafe {
            match (*cell).forwarding() {
                ForwardState::ForwardedTo(to) => {
                    debug_assert!(
                        self.old.contains(to.as_ptr().cast()),
                        "forwarding pointer outside the target generation"
                    );
                    *root = to;
                }
                ForwardState::Unvisited => {
                    let size = (*cell).size();
                    let memory = self.old.promote(size);
                    if memory.is_null() {
                        promotion_oom(size);
                    }
                    std::ptr::copy_nonoverlapping(cell.cast::<u8>(), memory, size);
                    let copy = memory.cast::<HeapObjectHeader>();
                    (*cell).set_forwarded(copy);
                    self.promoted_this_cycle += size;
                    *root = NonNull::new_unchecked(copy);
                    self.worklist.push_back(copy);
                }
            }
        }
    }

    /// Forwarding operation of the full cycle: relocates cells of either generation into the
    /// evacuation target segment. Same protocol, different destination.
    fn evacuate_any(&mut self, root: &mut NonNull<HeapObjectHeader>, to: &mut Segment) {
        let cell = root.as_ptr();
        if !self.young.contains(cell.cast()) && !self.old.contains(cell.cast()) {
            // Already a to-space address: reachable via a location that was rewritten earlier.
            debug_assert!(to.contains(cell.cast()));
            return;
        }
        unsafe {
            match (*cell).forwarding() {
                ForwardState::ForwardedTo(forwarded) => {
                    debug_assert!(to.contains(forwarded.as_ptr().cast()));
                    *root = forwarded;
                }
                ForwardState::Unvisited => {
                    let size = (*cell).size();
                    let memory = to.bump(size);
                    if memory.is_null() {
                        promotion_oom(size);
                    }
                    std::ptr::copy_nonoverlapping(cell.cast::<u8>(), memory, size);
                    let copy = memory.cast::<HeapObjectHeader>();
                    (*copy).set_remembered(false);
                    (*cell).set_forwarded(copy);
                    self.promoted_this_cycle += size;
                    *root = NonNull::new_unchecked(copy);
                    self.worklist.push_back(copy);
                }
            }
        }
    }

    fn drain_worklist_young(&mut self) {
        while let Some(cell) = self.worklist.pop_front() {
            unsafe {
                (*cell).get_dyn().trace(&mut YoungEvacuator { gc: self });
            }
        }
    }

    /// Minor cycle: `Idle → RootScan → Evacuate → UpdateReferences → Finalize → Idle`.
    fn collect_young(&mut self, keep: &mut [&mut dyn Trace], reason: GcReason) {
        assert_eq!(
            self.phase,
            CollectionPhase::Idle,
            "collection cycles never interleave"
        );
        let cycle_start = Instant::now();
        let pre_bytes = self.young.segment().used();
        self.promoted_this_cycle = 0;
        debug_assert!(self.worklist.is_empty());

        // RootScan: every root is forwarded in place before any object body is scanned.
        self.phase = CollectionPhase::RootScan;
        let timer = Instant::now();
        for root in keep.iter_mut() {
            root.trace(&mut YoungEvacuator { gc: self });
        }
        let stack = self.shadow_stack();
        unsafe {
            stack.trace_roots(&mut YoungEvacuator { gc: self });
        }
        let mut constraints = std::mem::take(&mut self.constraints);
        for constraint in constraints.iter_mut() {
            constraint(&mut YoungEvacuator { gc: self });
        }
        self.constraints = constraints;
        self.young.root_scan_secs += timer.elapsed().as_secs_f64();

        // Evacuate: breadth-first scan of freshly copied cells.
        self.phase = CollectionPhase::Evacuate;
        let timer = Instant::now();
        self.drain_worklist_young();
        self.young.evacuate_secs += timer.elapsed().as_secs_f64();

        // UpdateReferences: pointers recorded outside the object graph walk. Cross-generation
        // references from the write barrier come first, then weak references once no more
        // copies can happen.
        self.phase = CollectionPhase::UpdateReferences;
        let timer = Instant::now();
        while let Some(cell) = self.remembered_set.pop() {
            unsafe {
                (*cell).set_remembered(false);
                (*cell).get_dyn().trace(&mut YoungEvacuator { gc: self });
            }
        }
        self.drain_worklist_young();
        self.update_weak_references(false);
        self.young.update_references_secs += timer.elapsed().as_secs_f64();

        // Finalize: young finalizable cells without a forwarding pointer are unreachable and
        // run their cleanup exactly once; promoted ones move to the old generation's list.
        self.phase = CollectionPhase::Finalize;
        let timer = Instant::now();
        let pending = std::mem::take(&mut self.young.finalizable);
        for cell in pending.iter() {
            let cell = *cell;
            unsafe {
                match (*cell).forwarding() {
                    ForwardState::ForwardedTo(to) => self.old.register_finalizable(to.as_ptr()),
                    ForwardState::Unvisited => (*cell).get_dyn().finalize(),
                }
            }
        }
        self.young.finalize_secs += timer.elapsed().as_secs_f64();

        self.young.reset_after_collection();
        self.young.cum_pre_bytes += pre_bytes;
        self.young.cum_promoted_bytes += self.promoted_this_cycle;
        self.minor_collections += 1;
        self.phase = CollectionPhase::Idle;

        let rate = if pre_bytes > 0 {
            self.promoted_this_cycle as f64 / pre_bytes as f64
        } else {
            0.0
        };
        self.resize_young_after_cycle(rate);

        debug!(
            "[gc] GC({}) Pause Young ({:?}) {} promoted of {} (old space: {}) {:.4}ms",
            self.minor_collections + self.full_collections,
            reason,
            formatted_size(self.promoted_this_cycle),
            formatted_size(pre_bytes),
            formatted_size(self.old.segment().used()),
            cycle_start.elapsed().as_micros() as f64 / 1000.0
        );
    }

    /// Full cycle: evacuates the survivors of both generations into a fresh old segment.
    /// Returns `None` when the worst-case survivor volume cannot fit the old generation even
    /// at its maximum size; that case surfaces upstream as allocation exhaustion.
    fn collect_full(&mut self, keep: &mut [&mut dyn Trace], reason: GcReason) -> Option<usize> {
        assert_eq!(
            self.phase,
            CollectionPhase::Idle,
            "collection cycles never interleave"
        );
        let cycle_start = Instant::now();
        let pre_used = self.old.segment().used() + self.young.segment().used();
        let mut to_space = self.old.reserve_to_space(pre_used)?;
        self.promoted_this_cycle = 0;
        debug_assert!(self.worklist.is_empty());

        // The remembered set exists to find old→young pointers; a full cycle traces
        // everything, so only the bits need resetting.
        while let Some(cell) = self.remembered_set.pop() {
            unsafe {
                (*cell).set_remembered(false);
            }
        }

        self.phase = CollectionPhase::RootScan;
        for root in keep.iter_mut() {
            root.trace(&mut FullEvacuator {
                gc: self,
                to: &mut to_space,
            });
        }
        let stack = self.shadow_stack();
        unsafe {
            stack.trace_roots(&mut FullEvacuator {
                gc: self,
                to: &mut to_space,
            });
        }
        let mut constraints = std::mem::take(&mut self.constraints);
        for constraint in constraints.iter_mut() {
            constraint(&mut FullEvacuator {
                gc: self,
                to: &mut to_space,
            });
        }
        self.constraints = constraints;

        self.phase = CollectionPhase::Evacuate;
        while let Some(cell) = self.worklist.pop_front() {
            unsafe {
                (*cell).get_dyn().trace(&mut FullEvacuator {
                    gc: self,
                    to: &mut to_space,
                });
            }
        }

        self.phase = CollectionPhase::UpdateReferences;
        self.update_weak_references(true);

        self.phase = CollectionPhase::Finalize;
        let pending_young = std::mem::take(&mut self.young.finalizable);
        let pending_old = std::mem::take(&mut self.old.finalizable);
        for cell in pending_young.iter().chain(pending_old.iter()) {
            let cell = *cell;
            unsafe {
                match (*cell).forwarding() {
                    ForwardState::ForwardedTo(to) => self.old.register_finalizable(to.as_ptr()),
                    ForwardState::Unvisited => (*cell).get_dyn().finalize(),
                }
            }
        }

        self.young.reset_after_collection();
        let from_space = self.old.replace_segment(to_space);
        drop(from_space);
        self.full_collections += 1;
        self.phase = CollectionPhase::Idle;

        let survived = self.promoted_this_cycle;
        let reclaimed = pre_used.saturating_sub(survived);
        debug!(
            "[gc] GC({}) Pause Full ({:?}) {}->{} reclaimed {} {:.4}ms",
            self.minor_collections + self.full_collections,
            reason,
            formatted_size(pre_used),
            formatted_size(survived),
            formatted_size(reclaimed),
            cycle_start.elapsed().as_micros() as f64 / 1000.0
        );
        Some(reclaimed)
    }

    /// Weak slots are resolved only after the worklist is fully drained: a referent without a
    /// forwarding pointer by then is unreachable and the slot is cleared. Weak slots never
    /// install forwarding pointers themselves, or they would keep their referents alive.
    /// Cleared slots leave the scan registry so later cycles stop revisiting them.
    fn update_weak_references(&mut self, full_cycle: bool) {
        let mut slots = std::mem::take(&mut self.weak_slots);
        slots.retain(|slot| unsafe {
            let slot_ptr = slot.as_ptr();
            let value = (*slot_ptr).value;
            if value.is_null() {
                self.dead_weak_slots.push(*slot);
                return false;
            }
            let moved_this_cycle = if full_cycle {
                self.young.contains(value.cast()) || self.old.contains(value.cast())
            } else {
                self.young.contains(value.cast())
            };
            if !moved_this_cycle {
                return true;
            }
            match (*value).forwarding() {
                ForwardState::ForwardedTo(to) => {
                    (*slot_ptr).value = to.as_ptr();
                    true
                }
                ForwardState::Unvisited => {
                    (*slot_ptr).value = null_mut();
                    self.dead_weak_slots.push(*slot);
                    false
                }
            }
        });
        self.weak_slots = slots;
    }

    #[cfg(test)]
    pub(crate) fn live_weak_slots(&self) -> usize {
        self.weak_slots.len()
    }

    /// Post-cycle sizing: a high survival rate means collections are expensive and frequent,
    /// so bias toward a bigger young generation; a low rate permits shrinking. Targets are
    /// always pre-clamped by the sizing policy.
    fn resize_young_after_cycle(&mut self, survival_rate: f64) {
        let size = self.young.size();
        if survival_rate >= self.grow_survival_threshold {
            let desired = self.young.adjust_size(size.saturating_mul(2));
            if desired > size {
                debug!(
                    "[gc] growing young generation {}->{}",
                    formatted_size(size),
                    formatted_size(desired)
                );
                self.young.grow_to(desired);
            }
        } else if survival_rate <= self.shrink_survival_threshold {
            let desired = self.young.adjust_size(size / 2);
            if desired < size && desired >= self.young.used() {
                debug!(
                    "[gc] shrinking young generation {}->{}",
                    formatted_size(size),
                    formatted_size(desired)
                );
                self.young.shrink_to(desired);
            }
        }
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            young_size: self.young.size(),
            young_used: self.young.used(),
            young_external: self.young.external_memory(),
            old_size: self.old.size(),
            old_used: self.old.used(),
            old_external: self.old.external_memory(),
            minor_collections: self.minor_collections,
            full_collections: self.full_collections,
            bytes_promoted_total: self.young.cum_promoted_bytes,
            bytes_allocated_since_last_gc: self.young.bytes_allocated_since_last_gc(),
            survival_rate: self.young.survival_rate(),
            root_scan_secs: self.young.root_scan_secs,
            evacuate_secs: self.young.evacuate_secs,
            update_references_secs: self.young.update_references_secs,
            finalize_secs: self.young.finalize_secs,
        }
    }
}

impl Drop for GenCopyGC {
    fn drop(&mut self) {
        // The heap dies with the runtime: run every pending finalizer exactly once, then free
        // the weak slots.
        let pending_young = std::mem::take(&mut self.young.finalizable);
        let pending_old = std::mem::take(&mut self.old.finalizable);
        for cell in pending_young.iter().chain(pending_old.iter()) {
            unsafe {
                (**cell).get_dyn().finalize();
            }
        }
        for slot in self.weak_slots.drain(..).chain(self.dead_weak_slots.drain(..)) {
            unsafe {
                drop(Box::from_raw(slot.as_ptr()));
            }
        }
    }
}

struct YoungEvacuator<'a> {
    gc: &'a mut GenCopyGC,
}

impl Visitor for YoungEvacuator<'_> {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        self.gc.ensure_referent_copied(root);
    }
}

struct FullEvacuator<'a, 'b> {
    gc: &'a mut GenCopyGC,
    to: &'b mut Segment,
}

impl Visitor for FullEvacuator<'_, '_> {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        self.gc.evacuate_any(root, self.to);
    }
}

/// Allocation failed after every collection and growth attempt on a path that cannot report
/// failure; the heap state is still consistent but the process cannot continue.
#[cold]
pub fn oom_abort(error: &AllocationError) -> ! {
    eprintln!("[gc] {}", error);
    std::process::abort()
}

/// The target generation could not accept a copy mid-evacuation. The admission check exists to
/// make this unreachable; continuing would leave a half-moved heap.
#[cold]
fn promotion_oom(size: usize) -> ! {
    eprintln!(
        "[gc] evacuation target exhausted while copying {} bytes; admission check violated",
        size
    );
    std::process::abort()
}
