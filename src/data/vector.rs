//! Non-overlapping distributed vector: this rank's slice of a global vector.

use serde::{Deserialize, Serialize};

use crate::data::row_layout::RowLayout;
use crate::mesh_error::MeshSolveError;

/// Values for global rows `start..start + values.len()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistVector {
    start: u64,
    global_len: u64,
    values: Vec<f64>,
}

impl DistVector {
    /// Wrap `values` as this rank's slice of `layout`.
    pub fn new(layout: &RowLayout, values: Vec<f64>) -> Result<Self, MeshSolveError> {
        if values.len() != layout.local_len() {
            return Err(MeshSolveError::LengthMismatch {
                what: "distributed vector",
                expected: layout.local_len(),
                got: values.len(),
            });
        }
        Ok(Self {
            start: layout.local_range().start,
            global_len: layout.global_len(),
            values,
        })
    }

    pub fn zeros(layout: &RowLayout) -> Self {
        Self {
            start: layout.local_range().start,
            global_len: layout.global_len(),
            values: vec![0.0; layout.local_len()],
        }
    }

    /// First global row held locally.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn global_len(&self) -> u64 {
        self.global_len
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    /// Value at a global row if it is held locally.
    pub fn get_global(&self, row: u64) -> Option<f64> {
        row.checked_sub(self.start)
            .and_then(|o| self.values.get(o as usize))
            .copied()
    }
}
