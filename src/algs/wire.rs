//! Fixed, little-endian wire types for exchange paths.
//!
//! All multi-byte integers in these structs are **little-endian** on the wire.
//! We store them pre-LE with `.to_le()` and decode with `.from_le()`.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

use crate::mesh_error::MeshSolveError;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Decode a received byte buffer into owned `T` records.
///
/// The buffer need not be aligned for `T`; its length must be a whole number
/// of records.
pub fn pod_vec_from_bytes<T: Pod>(raw: &[u8], neighbor: usize) -> Result<Vec<T>, MeshSolveError> {
    let item = size_of::<T>();
    if item == 0 || raw.len() % item != 0 {
        return Err(MeshSolveError::BufferSizeMismatch {
            neighbor,
            expected: raw.len().next_multiple_of(item.max(1)),
            got: raw.len(),
        });
    }
    Ok(bytemuck::pod_collect_to_vec(raw))
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32, // count of following records
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// A global index (cell id or non-overlapping row) carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireIndex {
    pub id_le: u64,
}
impl WireIndex {
    pub fn of(id: u64) -> Self {
        Self { id_le: id.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.id_le)
    }
}

/// Insertion policy carried with a matrix entry.
pub const MODE_ADD: u32 = 0;
pub const MODE_SET: u32 = 1;

/// One matrix coefficient in global non-overlapping numbering.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireEntry {
    pub row_le: u64,
    pub col_le: u64,
    pub value_bits_le: u64,
    pub mode_le: u32,
    pub _pad: u32, // pad to 8-byte alignment (explicit)
}
impl WireEntry {
    pub const SIZE: usize = 32; // 3*8 + 4 + 4
    pub fn new(row: u64, col: u64, value: f64, mode: u32) -> Self {
        Self {
            row_le: row.to_le(),
            col_le: col.to_le(),
            value_bits_le: value.to_bits().to_le(),
            mode_le: mode.to_le(),
            _pad: 0,
        }
    }
    pub fn row(&self) -> u64 {
        u64::from_le(self.row_le)
    }
    pub fn col(&self) -> u64 {
        u64::from_le(self.col_le)
    }
    pub fn value(&self) -> f64 {
        f64::from_bits(u64::from_le(self.value_bits_le))
    }
    pub fn mode(&self) -> u32 {
        u32::from_le(self.mode_le)
    }
}

/// A vector value carried on the wire (bit pattern preserved exactly).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireValue {
    pub bits_le: u64,
}
impl WireValue {
    pub fn of(v: f64) -> Self {
        Self {
            bits_le: v.to_bits().to_le(),
        }
    }
    pub fn get(&self) -> f64 {
        f64::from_bits(u64::from_le(self.bits_le))
    }
}

const_assert_eq!(size_of::<WireCount>(), 4);
const_assert_eq!(size_of::<WireIndex>(), 8);
const_assert_eq!(size_of::<WireEntry>(), WireEntry::SIZE);
const_assert_eq!(size_of::<WireValue>(), 8);
