//! Single-process sparse matrix in row-list form.
//!
//! A legacy matrix is either *per-process* (indexed by overlapping-local cell
//! index; only meaningful when one rank holds the whole mesh) or *replicated*
//! (every rank holds the whole global system, indexed by non-overlapping
//! global index).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mesh_error::MeshSolveError;
use crate::overlap::delta::{AddDelta, CopyDelta, Delta};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LegacyMatrix {
    dim: usize,
    rows: Vec<BTreeMap<usize, f64>>,
    replicated: bool,
    finalized: bool,
}

impl LegacyMatrix {
    /// Empty per-process matrix of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            rows: vec![BTreeMap::new(); dim],
            replicated: false,
            finalized: false,
        }
    }

    /// Empty matrix standing for the whole global system on every rank.
    pub fn replicated(dim: usize) -> Self {
        Self {
            replicated: true,
            ..Self::new(dim)
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn write<D: Delta<f64>>(&mut self, row: usize, col: usize, value: f64) -> Result<(), MeshSolveError> {
        if row >= self.dim || col >= self.dim {
            return Err(MeshSolveError::IndexOutOfBounds {
                row,
                col,
                dim: self.dim,
            });
        }
        D::fuse(self.rows[row].entry(col).or_insert(0.0), value);
        self.finalized = false;
        Ok(())
    }

    /// Overwrite entry `(row, col)`.
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<(), MeshSolveError> {
        self.write::<CopyDelta>(row, col, value)
    }

    /// Accumulate into entry `(row, col)`.
    pub fn add_to(&mut self, row: usize, col: usize, value: f64) -> Result<(), MeshSolveError> {
        self.write::<AddDelta>(row, col, value)
    }

    /// Stored value at `(row, col)`; zero if absent or out of range.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.rows
            .get(row)
            .and_then(|r| r.get(&col))
            .copied()
            .unwrap_or(0.0)
    }

    /// Nothing crosses process boundaries in this form; marks the matrix ready.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Stored entries of one row, ascending by column.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.rows
            .get(row)
            .into_iter()
            .flat_map(|r| r.iter().map(|(&c, &v)| (c, v)))
    }

    /// All stored entries as `(row, col, value)`, row-major.
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.rows
            .iter()
            .enumerate()
            .flat_map(|(r, cols)| cols.iter().map(move |(&c, &v)| (r, c, v)))
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.rows.iter().map(BTreeMap::len).sum()
    }

    /// `y = A x`.
    pub fn matvec(&self, x: &[f64]) -> Result<Vec<f64>, MeshSolveError> {
        if x.len() != self.dim {
            return Err(MeshSolveError::LengthMismatch {
                what: "matvec input",
                expected: self.dim,
                got: x.len(),
            });
        }
        Ok(self
            .rows
            .iter()
            .map(|r| r.iter().map(|(&c, &v)| v * x[c]).sum())
            .collect())
    }

    /// Row-major dense copy.
    pub fn to_dense(&self) -> Vec<f64> {
        let mut dense = vec![0.0; self.dim * self.dim];
        for (r, c, v) in self.triplets() {
            dense[r * self.dim + c] = v;
        }
        dense
    }

    /// Copy with rows and columns relabelled through `map` (old → new index).
    pub(crate) fn relabelled(&self, map: &[u64], replicated: bool) -> Result<Self, MeshSolveError> {
        if map.len() != self.dim {
            return Err(MeshSolveError::LengthMismatch {
                what: "legacy relabel map",
                expected: self.dim,
                got: map.len(),
            });
        }
        let mut out = Self::new(self.dim);
        out.replicated = replicated;
        for (r, c, v) in self.triplets() {
            out.set(map[r] as usize, map[c] as usize, v)?;
        }
        out.finalized = self.finalized;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates_and_set_overwrites() {
        let mut m = LegacyMatrix::new(2);
        m.add_to(0, 1, 1.0).unwrap();
        m.add_to(0, 1, 2.0).unwrap();
        assert_eq!(m.get(0, 1), 3.0);
        m.set(0, 1, -1.0).unwrap();
        assert_eq!(m.get(0, 1), -1.0);
        assert_eq!(m.nnz(), 1);
    }

    #[test]
    fn out_of_range_write_fails() {
        let mut m = LegacyMatrix::new(2);
        assert!(matches!(
            m.set(2, 0, 1.0),
            Err(MeshSolveError::IndexOutOfBounds { row: 2, col: 0, dim: 2 })
        ));
    }

    #[test]
    fn writes_reopen_a_finalized_matrix() {
        let mut m = LegacyMatrix::new(1);
        m.finalize();
        assert!(m.is_finalized());
        m.add_to(0, 0, 1.0).unwrap();
        assert!(!m.is_finalized());
    }

    #[test]
    fn matvec_uses_stored_entries() {
        let mut m = LegacyMatrix::new(2);
        m.set(0, 0, 2.0).unwrap();
        m.set(0, 1, -1.0).unwrap();
        m.set(1, 1, 3.0).unwrap();
        assert_eq!(m.matvec(&[1.0, 2.0]).unwrap(), vec![0.0, 6.0]);
        assert_eq!(m.to_dense(), vec![2.0, -1.0, 0.0, 3.0]);
    }
}
