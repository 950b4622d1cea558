//! Contiguous row ranges of the non-overlapping numbering.
//!
//! Rank `r` owns global rows `offsets[r]..offsets[r + 1]`. Owned counts are
//! gathered from every rank and prefix-summed, so each rank's owned rows are
//! numbered after those of all lower ranks.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::algs::communicator::{CommTag, Communicator, allgather_counts};
use crate::mesh_error::MeshSolveError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLayout {
    rank: usize,
    offsets: Vec<u64>,
}

impl RowLayout {
    /// Build the layout collectively from this rank's owned row count.
    pub fn gather<C: Communicator>(
        owned: usize,
        comm: &C,
        tag: CommTag,
    ) -> Result<Self, MeshSolveError> {
        let counts = allgather_counts(comm, tag, owned)?;
        Ok(Self::from_counts(comm.rank(), &counts))
    }

    /// Build the layout from known per-rank counts.
    pub fn from_counts(rank: usize, counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        let mut acc = 0u64;
        offsets.push(0);
        for &c in counts {
            acc = acc.saturating_add(c as u64);
            offsets.push(acc);
        }
        Self { rank, offsets }
    }

    /// Single-rank layout of `n` rows.
    pub fn serial(n: usize) -> Self {
        Self::from_counts(0, &[n])
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks described.
    pub fn num_ranks(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Total number of rows across all ranks.
    pub fn global_len(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Rows owned by `rank`.
    pub fn range_of(&self, rank: usize) -> Range<u64> {
        match (self.offsets.get(rank), self.offsets.get(rank + 1)) {
            (Some(&s), Some(&e)) => s..e,
            _ => 0..0,
        }
    }

    /// Rows owned by this rank.
    pub fn local_range(&self) -> Range<u64> {
        self.range_of(self.rank)
    }

    pub fn local_len(&self) -> usize {
        let r = self.local_range();
        (r.end - r.start) as usize
    }

    pub fn is_local(&self, row: u64) -> bool {
        self.local_range().contains(&row)
    }

    /// Offset of a global row inside this rank's slice.
    pub fn local_offset(&self, row: u64) -> Result<usize, MeshSolveError> {
        let r = self.local_range();
        if r.contains(&row) {
            Ok((row - r.start) as usize)
        } else {
            Err(MeshSolveError::RowNotOwned {
                row,
                rank: self.rank,
                start: r.start,
                end: r.end,
            })
        }
    }

    /// Rank owning a global row, or `None` past the end.
    pub fn owner_of(&self, row: u64) -> Option<usize> {
        if row >= self.global_len() {
            return None;
        }
        // first offset strictly greater than `row`, minus one; skips empty ranks
        let idx = self.offsets.partition_point(|&o| o <= row);
        Some(idx - 1)
    }
}
