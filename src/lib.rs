//! # Ember
//!
//! Ember is a generational copying garbage collector for VMs implemented in Rust. The heap is
//! split in two generations: a young generation collected by copying evacuation on every cycle,
//! and an old generation that receives the survivors.
//!
//! # Features
//! - Bump-pointer allocation fast path into an aligned young-generation segment
//! - Copying young-generation collection with explicit forwarding state, so relocation is
//!   idempotent and every live object is copied at most once
//! - Finalizers that run exactly once when an object becomes unreachable, across promotions
//! - External (off-heap) memory accounting per generation
//! - Easy to use rooting API without large runtime overhead via [`letroot!`]
//!
//! ## Collection cycle
//!
//! A cycle is only ever triggered by an allocation that cannot be satisfied by the bump path,
//! or by an explicit request honored at the next safe point. Each cycle walks
//! `RootScan → Evacuate → UpdateReferences → Finalize` and then resets the young segment;
//! survivors are promoted into the old generation. When the old generation lacks worst-case
//! headroom, a full collection evacuates both generations into a fresh old segment.

#[macro_use]
pub mod shadow_stack;
pub mod api;
pub mod generation;
pub mod generational;
pub mod header;
pub mod mmap;
pub mod old;
pub mod segment;
pub mod statistics;
pub mod young;

#[cfg(test)]
mod tests;

use std::any::TypeId;

pub use mopa;

/// Rounds `value` up to the nearest multiple of `align`. `align` must be a power of two.
#[inline(always)]
pub const fn align_usize(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

const FNV_OFFSET_BASIS_32: u32 = 0x811c9dc5;
const FNV_PRIME_32: u32 = 0x01000193;

/// Computes 32-bits fnv1a hash of the given slice.
#[inline(always)]
const fn fnv1a_hash_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS_32;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME_32);
        i += 1;
    }
    hash
}

/// 32-bit type identity stored in cell headers; a fnv1a fold of [`TypeId`].
#[inline(always)]
pub(crate) fn small_type_id<T: 'static>() -> u32 {
    unsafe {
        let bytes: [u8; std::mem::size_of::<TypeId>()] = std::mem::transmute(TypeId::of::<T>());
        fnv1a_hash_32(&bytes)
    }
}
