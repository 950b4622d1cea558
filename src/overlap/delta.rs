//! Delta trait: rules for fusing values that arrive across the overlap.
//!
//! Halo import replaces ([`CopyDelta`]); ghost-row reduction accumulates
//! ([`AddDelta`]) unless the writer asked for a set.

use crate::algs::wire::{MODE_ADD, MODE_SET};

/// *Delta* encapsulates how an incoming value merges into the local one.
pub trait Delta<V>: Sized {
    /// Tag written next to the value on the wire.
    const MODE: u32;

    /// Merge an incoming fragment into the local value.
    fn fuse(local: &mut V, incoming: V);
}

/// Identity delta (copy-overwrites-local).
#[derive(Copy, Clone, Debug)]
pub struct CopyDelta;

impl<V> Delta<V> for CopyDelta {
    const MODE: u32 = MODE_SET;
    #[inline]
    fn fuse(local: &mut V, incoming: V) {
        *local = incoming;
    }
}

/// Additive delta for summed contributions.
#[derive(Copy, Clone, Debug)]
pub struct AddDelta;

impl<V> Delta<V> for AddDelta
where
    V: std::ops::AddAssign,
{
    const MODE: u32 = MODE_ADD;
    #[inline]
    fn fuse(local: &mut V, incoming: V) {
        *local += incoming;
    }
}

/// Fuse `incoming` into `local` according to a wire mode tag.
#[inline]
pub fn fuse_by_mode(local: &mut f64, incoming: f64, mode: u32) {
    if mode == MODE_SET {
        CopyDelta::fuse(local, incoming);
    } else {
        AddDelta::fuse(local, incoming);
    }
}
