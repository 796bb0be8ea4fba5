//! On-stack rooting. Values that must survive a collection are pinned with [`letroot!`],
//! which pushes an intrusive entry onto the collector's shadow stack. During RootScan the
//! collector traces every entry, rewriting the rooted pointers in place when their referents
//! move.

use core::cell::Cell;
use core::ptr::null_mut;

use crate::api::{Trace, Visitor};

/// Intrusive singly-linked list of rooted stack values. One per collector; entries are pushed
/// and popped in LIFO order by [`letroot!`] scopes.
pub struct ShadowStack {
    #[doc(hidden)]
    pub head: Cell<*mut RootEntry>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self {
            head: Cell::new(null_mut()),
        }
    }

    /// Traces every rooted value.
    ///
    /// # Safety
    ///
    /// Reconstructs `&mut` aliases into live stack frames; only the collector may call this,
    /// while the mutator is stopped.
    pub(crate) unsafe fn trace_roots(&self, vis: &mut dyn Visitor) {
        let mut head = self.head.get();
        while !head.is_null() {
            let prev = (*head).prev;
            (*head).as_trace().trace(vis);
            head = prev;
        }
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased prefix of a [`StackedRoot`]. The rooted value sits directly after the vtable
/// word, so the collector can rebuild a `dyn Trace` for it without knowing the type.
#[repr(C)]
pub struct RootEntry {
    prev: *mut RootEntry,
    vtable: usize,
    data_start: [u8; 0],
}

impl RootEntry {
    unsafe fn as_trace(&mut self) -> &mut dyn Trace {
        core::mem::transmute(crate::mopa::TraitObject {
            data: self.data_start.as_ptr() as *mut (),
            vtable: self.vtable as *mut (),
        })
    }
}

/// Stack slot holding a rooted value; layout-compatible with [`RootEntry`] up to `value`.
/// Created by [`letroot!`] only. Popping happens in `Drop`, so rooting follows block scope.
#[repr(C)]
pub struct StackedRoot<'a, T: Trace> {
    prev: *mut RootEntry,
    vtable: usize,
    #[doc(hidden)]
    pub value: T,
    stack: &'a ShadowStack,
}

impl<'a, T: Trace> StackedRoot<'a, T> {
    #[doc(hidden)]
    /// # Safety
    ///
    /// The slot must be pushed onto `stack` before any collection can run, and must stay at a
    /// fixed stack address while pushed. Only [`letroot!`] upholds this.
    pub unsafe fn construct(
        stack: &'a ShadowStack,
        prev: *mut RootEntry,
        vtable: usize,
        value: T,
    ) -> Self {
        Self {
            prev,
            vtable,
            value,
            stack,
        }
    }
}

impl<T: Trace> Drop for StackedRoot<'_, T> {
    fn drop(&mut self) {
        self.stack.head.set(self.prev);
    }
}

/// Handle to a rooted value, produced by [`letroot!`]. Derefs to the value for the extent of
/// the rooting scope.
pub struct Rooted<'a, T: Trace> {
    value: &'a mut T,
}

impl<'a, T: Trace> Rooted<'a, T> {
    #[doc(hidden)]
    /// # Safety
    ///
    /// `value` must point into the `value` field of a pushed [`StackedRoot`].
    pub unsafe fn construct(value: &'a mut T) -> Self {
        Self { value }
    }
}

impl<T: Trace> core::ops::Deref for Rooted<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<T: Trace> core::ops::DerefMut for Rooted<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}

impl<T: Trace> std::fmt::Pointer for Rooted<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.value)
    }
}

/// Roots a value on the shadow stack for the rest of the enclosing scope:
///
/// ```ignore
/// let stack = heap.shadow_stack();
/// letroot!(object = stack, heap.allocate(42u32));
/// heap.minor_collection(&mut []);
/// // `object` now points at the promoted copy.
/// ```
///
/// The value lives in the current stack frame; no heap allocation is involved.
#[macro_export]
macro_rules! letroot {
    ($name:ident = $stack:expr, $value:expr) => {
        let stack: &$crate::shadow_stack::ShadowStack = &$stack;
        let value = $value;
        let mut $name = unsafe {
            $crate::shadow_stack::StackedRoot::construct(
                stack,
                stack.head.get(),
                core::mem::transmute::<_, $crate::mopa::TraitObject>(
                    &value as &dyn $crate::api::Trace,
                )
                .vtable as usize,
                value,
            )
        };
        stack.head.set(unsafe { core::mem::transmute(&mut $name) });
        #[allow(unused_mut)]
        let mut $name = unsafe { $crate::shadow_stack::Rooted::construct(&mut $name.value) };
    };
}
