use std::{
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
};

use mopa::mopafy;
use thiserror::Error;

use crate::header::HeapObjectHeader;

/// Granularity of all heap allocations; every cell size is a multiple of this. It is also the
/// strongest alignment the heap can honor: cell payloads sit at a fixed header offset from an
/// 8-byte boundary, so types whose alignment exceeds `MIN_ALLOCATION` cannot be heap-allocated.
pub const MIN_ALLOCATION: usize = 8;

/// Visits outgoing pointer fields of an object. Each field is handed to the collector as a
/// mutable pointer location so it can be rewritten in place when the referent is relocated.
///
/// # Safety
///
/// Every reachable `Gc` field must be reported to the visitor. Skipping a field leaves a stale
/// pointer behind after evacuation.
pub unsafe trait Trace {
    fn trace(&mut self, _vis: &mut dyn Visitor) {}
}

/// Native cleanup hook run exactly once when an unreachable cell is reclaimed. The default
/// implementation runs the type's destructor in place.
///
/// # Safety
///
/// `finalize` must not allocate into the heap or resurrect the object.
pub unsafe trait Finalize {
    unsafe fn finalize(&mut self) {
        core::ptr::drop_in_place(self)
    }
}

/// Capability record every heap cell carries: how to compute its size, enumerate its outgoing
/// pointers ([`Trace`]) and run native cleanup ([`Finalize`]). The collector reaches it through
/// the vtable word stored in the cell header.
pub trait Collectable: Trace + Finalize + mopa::Any {
    fn allocation_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

mopafy!(Collectable);

/// Receives pointer locations during root scanning and transitive scanning.
pub trait Visitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>);
}

pub(crate) fn vtable_of<T: Collectable>() -> usize {
    let x = null_mut::<T>();
    unsafe { std::mem::transmute::<_, mopa::TraitObject>(x as *mut dyn Collectable).vtable as _ }
}

/// Pointer to a garbage collected cell. Copyable; stability of the address only holds until the
/// next collection cycle, so any `Gc` living across an allocation must be rooted (see
/// [`letroot!`](crate::letroot)).
pub struct Gc<T: Collectable + ?Sized> {
    pub(crate) base: NonNull<HeapObjectHeader>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable + ?Sized> Gc<T> {
    pub fn to_dyn(self) -> Gc<dyn Collectable> {
        Gc {
            base: self.base,
            marker: PhantomData,
        }
    }

    pub fn is<U: Collectable>(&self) -> bool {
        unsafe { (*self.base.as_ptr()).type_id() == crate::small_type_id::<U>() }
    }

    pub fn downcast<U: Collectable>(&self) -> Option<Gc<U>> {
        if self.is::<U>() {
            Some(Gc {
                base: self.base,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    pub fn ptr_eq<U: Collectable + ?Sized>(this: &Gc<T>, other: &Gc<U>) -> bool {
        this.base == other.base
    }

    pub(crate) fn header(&self) -> *mut HeapObjectHeader {
        self.base.as_ptr()
    }
}

impl<T: Collectable + ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable + ?Sized> Copy for Gc<T> {}

impl<T: Collectable + Sized> Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe {
            let data = (*self.base.as_ptr()).data().cast::<T>();
            &*data
        }
    }
}

impl<T: Collectable + Sized> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            let data = (*self.base.as_ptr()).data().cast::<T>() as *mut T;
            &mut *data
        }
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Gc<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.mark_object(&mut self.base);
    }
}

impl<T: Collectable + ?Sized> std::fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.base)
    }
}

/// Slot backing a [`Weak`] reference. Owned by the collector; rewritten during the
/// UpdateReferences phase of each cycle and nulled when the referent dies.
pub(crate) struct WeakSlot {
    pub(crate) value: *mut HeapObjectHeader,
}

/// Weak reference to a heap cell: does not keep the referent alive, follows it across
/// relocations. Created through
/// [`GenCopyGC::allocate_weak`](crate::generational::GenCopyGC::allocate_weak).
pub struct Weak<T: Collectable + ?Sized> {
    pub(crate) slot: NonNull<WeakSlot>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable + ?Sized> Weak<T> {
    /// Returns a strong pointer if the referent is still alive.
    pub fn upgrade(&self) -> Option<Gc<T>> {
        let value = unsafe { (*self.slot.as_ptr()).value };
        NonNull::new(value).map(|base| Gc {
            base,
            marker: PhantomData,
        })
    }
}

impl<T: Collectable + ?Sized> Clone for Weak<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable + ?Sized> Copy for Weak<T> {}

/// Marks an allocation as carrying a native cleanup hook that must be registered on the
/// owning generation's finalizable list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HasFinalizer {
    No,
    Yes,
}

/// Marks an allocation as a small fixed-size runtime cell. Fixed-size allocations are always
/// satisfied from the young generation and are never redirected to the old generation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FixedSize {
    No,
    Yes,
}

/// Recoverable allocation failure: the request could not be placed even after collection and
/// growth attempts. The embedding runtime is expected to surface this as an out-of-memory
/// condition to the managed program.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("heap exhausted: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },
}

macro_rules! impl_prim {
    ($($t: ty)*) => {
        $(
            unsafe impl Trace for $t {}
            unsafe impl Finalize for $t {}
            impl Collectable for $t {}
        )*
    };
}

// u128/i128 are deliberately absent: their 16-byte alignment exceeds MIN_ALLOCATION and the
// heap cannot place them correctly.
impl_prim!(
    u8 u16 u32 u64
    i8 i16 i32 i64
    f32 f64
    bool
    String
);

unsafe impl<T: Collectable + ?Sized> Trace for Option<Gc<T>> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        if let Some(gc) = self {
            gc.trace(vis);
        }
    }
}

unsafe impl<T: Trace> Trace for Vec<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for item in self.iter_mut() {
            item.trace(vis);
        }
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for item in self.iter_mut() {
            item.trace(vis);
        }
    }
}