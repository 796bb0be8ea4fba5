use modular_bitfield::prelude::*;
use std::{mem::size_of, ptr::NonNull};

use crate::api::{Collectable, MIN_ALLOCATION};

// HeapObjectHeader is prepended to every cell. The forwarding word is kept separate from the
// vtable word: a cell is either Unvisited (forward == 0) or ForwardedTo the relocated copy,
// and the capability vtable stays readable in both states.
//
// +----------+------+-------------------------------------------------+
// | name     | bits |                                                 |
// +----------+------+-------------------------------------------------+
// | vtable   |   64 | Capability record of the cell (dyn Collectable) |
// | forward  |   64 | 0, or address of the evacuated copy             |
// | meta     |   32 | size in units, finalizer bit, remembered bit    |
// | type_id  |   32 | fnv1a fold of TypeId, for downcasts             |
// +----------+------+-------------------------------------------------+
//
// |size| is encoded in units of MIN_ALLOCATION and covers the header itself.
#[repr(C)]
pub struct HeapObjectHeader {
    pub(crate) vtable: usize,
    pub(crate) forward: usize,
    pub(crate) meta: CellMeta,
    pub(crate) type_id: u32,
}

#[bitfield(bits = 32)]
#[derive(Clone, Copy)]
pub struct CellMeta {
    size_in_units: B27,
    has_finalizer: bool,
    remembered: bool,
    #[skip]
    __: B3,
}

/// Relocation state of a cell during a collection cycle. The single source of truth that
/// prevents duplicate copies of the same object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ForwardState {
    Unvisited,
    ForwardedTo(NonNull<HeapObjectHeader>),
}

impl HeapObjectHeader {
    #[inline(always)]
    pub(crate) fn new(vtable: usize, size: usize, type_id: u32) -> Self {
        let mut this = Self {
            vtable,
            forward: 0,
            meta: CellMeta::new(),
            type_id,
        };
        this.set_size(size);
        this
    }

    /// Reconstructs the `dyn Collectable` capability record from the vtable word.
    #[inline(always)]
    pub fn get_dyn(&mut self) -> &mut dyn Collectable {
        debug_assert!(self.vtable != 0, "cell vtable is not initialized");
        unsafe {
            std::mem::transmute(mopa::TraitObject {
                data: self.data() as *mut (),
                vtable: self.vtable as *mut (),
            })
        }
    }

    #[inline(always)]
    pub fn forwarding(&self) -> ForwardState {
        match NonNull::new(self.forward as *mut HeapObjectHeader) {
            None => ForwardState::Unvisited,
            Some(to) => ForwardState::ForwardedTo(to),
        }
    }

    /// Installs the forwarding pointer. A cell is forwarded at most once per cycle; the copy
    /// must already hold the cell's contents.
    #[inline(always)]
    pub fn set_forwarded(&mut self, to: *mut HeapObjectHeader) {
        debug_assert!(self.forward == 0, "cell is already forwarded");
        debug_assert!(!to.is_null());
        self.forward = to as usize;
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.meta.size_in_units() as usize * MIN_ALLOCATION
    }

    #[inline(always)]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size != 0 && size % MIN_ALLOCATION == 0);
        self.meta.set_size_in_units((size / MIN_ALLOCATION) as u32);
    }

    #[inline(always)]
    pub fn has_finalizer(&self) -> bool {
        self.meta.has_finalizer()
    }

    #[inline(always)]
    pub fn set_has_finalizer(&mut self, value: bool) {
        self.meta.set_has_finalizer(value);
    }

    /// Whether the cell sits in the remembered set (an old-generation cell that had a
    /// young-generation pointer stored into it since the last cycle).
    #[inline(always)]
    pub fn is_remembered(&self) -> bool {
        self.meta.remembered()
    }

    #[inline(always)]
    pub fn set_remembered(&mut self, value: bool) {
        self.meta.set_remembered(value);
    }

    #[inline(always)]
    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    #[inline(always)]
    pub fn data(&self) -> *const u8 {
        (self as *const Self as usize + size_of::<Self>()) as *const u8
    }
}
