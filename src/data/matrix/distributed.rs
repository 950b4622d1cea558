//! Row-partitioned sparse matrix in the non-overlapping global numbering.
//!
//! Each rank stores the rows it owns. Writes into ghost rows are buffered and
//! shipped to the owning rank by [`DistributedMatrix::finalize`], where they
//! are fused: additive writes accumulate, set writes overwrite. Contributions
//! are applied in ascending sender rank order, after the owner's own writes.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags, allgather};
use crate::algs::completion::sparse_exchange;
use crate::algs::wire::{MODE_ADD, MODE_SET, WireEntry};
use crate::data::matrix::legacy::LegacyMatrix;
use crate::data::row_layout::RowLayout;
use crate::mesh_error::MeshSolveError;
use crate::overlap::delta::fuse_by_mode;
use crate::topology::partition::CellPartition;

/// Compressed rows, columns ascending within each row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Csr {
    pub row_ptr: Vec<usize>,
    pub cols: Vec<u64>,
    pub vals: Vec<f64>,
}

impl Csr {
    pub fn row(&self, local_row: usize) -> impl Iterator<Item = (u64, f64)> + '_ {
        let (s, e) = (self.row_ptr[local_row], self.row_ptr[local_row + 1]);
        self.cols[s..e].iter().copied().zip(self.vals[s..e].iter().copied())
    }

    pub fn num_rows(&self) -> usize {
        self.row_ptr.len().saturating_sub(1)
    }
}

#[derive(Clone, Debug)]
pub struct DistributedMatrix {
    layout: RowLayout,
    /// non-overlapping index per overlapping-local cell
    local_to_global: Vec<u64>,
    /// owning rank per overlapping-local cell
    local_owner: Vec<usize>,
    rows: Vec<BTreeMap<u64, f64>>,
    pending: BTreeMap<usize, Vec<WireEntry>>,
    csr: Option<Csr>,
    tags: ExchangeTags,
}

impl DistributedMatrix {
    /// Empty matrix over the cells of `partition`.
    pub fn new(partition: &CellPartition) -> Self {
        let local_owner = (0..partition.overlapping_count())
            .map(|i| partition.owner(i).unwrap_or(partition.rank()))
            .collect();
        Self {
            layout: partition.layout().clone(),
            local_to_global: partition.overlapping_global_ids().to_vec(),
            local_owner,
            rows: vec![BTreeMap::new(); partition.owned_count()],
            pending: BTreeMap::new(),
            csr: None,
            tags: ExchangeTags::from_base(CommTag::new(0x5200)),
        }
    }

    /// Empty matrix addressed only by global index.
    pub fn with_layout(layout: RowLayout) -> Self {
        let n = layout.local_len();
        Self {
            layout,
            local_to_global: Vec::new(),
            local_owner: Vec::new(),
            rows: vec![BTreeMap::new(); n],
            pending: BTreeMap::new(),
            csr: None,
            tags: ExchangeTags::from_base(CommTag::new(0x5200)),
        }
    }

    /// Override the tags used by `finalize`.
    pub fn set_comm_tags(&mut self, tags: ExchangeTags) {
        self.tags = tags;
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn is_finalized(&self) -> bool {
        self.csr.is_some()
    }

    /// Entries waiting to be shipped to their owners.
    pub fn num_pending(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    fn write_global(&mut self, row: u64, col: u64, value: f64, mode: u32) -> Result<(), MeshSolveError> {
        let n = self.layout.global_len();
        if row >= n || col >= n {
            return Err(MeshSolveError::IndexOutOfBounds {
                row: row as usize,
                col: col as usize,
                dim: n as usize,
            });
        }
        self.csr = None;
        if self.layout.is_local(row) {
            let off = self.layout.local_offset(row)?;
            fuse_by_mode(self.rows[off].entry(col).or_insert(0.0), value, mode);
        } else {
            let owner = self.layout.owner_of(row).unwrap_or(self.layout.rank());
            self.pending
                .entry(owner)
                .or_default()
                .push(WireEntry::new(row, col, value, mode));
        }
        Ok(())
    }

    fn write_local(&mut self, row: usize, col: usize, value: f64, mode: u32) -> Result<(), MeshSolveError> {
        let dim = self.local_to_global.len();
        if row >= dim || col >= dim {
            return Err(MeshSolveError::IndexOutOfBounds { row, col, dim });
        }
        let (grow, gcol) = (self.local_to_global[row], self.local_to_global[col]);
        if self.local_owner[row] == self.layout.rank() {
            self.write_global(grow, gcol, value, mode)
        } else {
            self.csr = None;
            self.pending
                .entry(self.local_owner[row])
                .or_default()
                .push(WireEntry::new(grow, gcol, value, mode));
            Ok(())
        }
    }

    /// Overwrite `(row, col)`, both overlapping-local indices.
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<(), MeshSolveError> {
        self.write_local(row, col, value, MODE_SET)
    }

    /// Accumulate into `(row, col)`, both overlapping-local indices.
    pub fn add_to(&mut self, row: usize, col: usize, value: f64) -> Result<(), MeshSolveError> {
        self.write_local(row, col, value, MODE_ADD)
    }

    /// Overwrite `(row, col)` by global index.
    pub fn set_global(&mut self, row: u64, col: u64, value: f64) -> Result<(), MeshSolveError> {
        self.write_global(row, col, value, MODE_SET)
    }

    /// Accumulate into `(row, col)` by global index.
    pub fn add_global(&mut self, row: u64, col: u64, value: f64) -> Result<(), MeshSolveError> {
        self.write_global(row, col, value, MODE_ADD)
    }

    /// Bulk-load `(row, col, value)` triplets by global index, overwriting.
    pub fn insert_global<I>(&mut self, entries: I) -> Result<(), MeshSolveError>
    where
        I: IntoIterator<Item = (u64, u64, f64)>,
    {
        for (r, c, v) in entries {
            self.write_global(r, c, v, MODE_SET)?;
        }
        Ok(())
    }

    /// Ship ghost-row contributions to their owners, fuse them, and compact
    /// the owned rows (collective).
    ///
    /// Calling it again with no intervening writes changes nothing.
    pub fn finalize<C: Communicator>(&mut self, comm: &C) -> Result<(), MeshSolveError> {
        let outgoing = std::mem::take(&mut self.pending);
        let incoming = sparse_exchange(&outgoing, comm, self.tags)?;

        let mut stray = None;
        for (_sender, entries) in incoming {
            for e in entries {
                match self.layout.local_offset(e.row()) {
                    Ok(off) => fuse_by_mode(self.rows[off].entry(e.col()).or_insert(0.0), e.value(), e.mode()),
                    Err(err) => {
                        stray.get_or_insert(err);
                    }
                }
            }
        }
        if let Some(err) = stray {
            return Err(err);
        }
        self.compact();
        Ok(())
    }

    /// Build the compressed form from the owned rows; no communication.
    pub(crate) fn compact(&mut self) {
        let mut csr = Csr {
            row_ptr: Vec::with_capacity(self.rows.len() + 1),
            cols: Vec::new(),
            vals: Vec::new(),
        };
        csr.row_ptr.push(0);
        for row in &self.rows {
            let (cols, vals): (Vec<u64>, Vec<f64>) = row.iter().map(|(&c, &v)| (c, v)).unzip();
            csr.cols.extend(cols);
            csr.vals.extend(vals);
            csr.row_ptr.push(csr.cols.len());
        }
        self.csr = Some(csr);
    }

    /// Compressed owned rows; `None` until finalized.
    pub fn csr(&self) -> Option<&Csr> {
        self.csr.as_ref()
    }

    /// Owned rows with their global index, ascending.
    pub fn local_rows(&self) -> impl Iterator<Item = (u64, &BTreeMap<u64, f64>)> + '_ {
        let start = self.layout.local_range().start;
        self.rows.iter().enumerate().map(move |(k, r)| (start + k as u64, r))
    }

    /// Stored entries in owned rows.
    pub fn nnz_local(&self) -> usize {
        self.rows.iter().map(BTreeMap::len).sum()
    }

    /// Value at a global `(row, col)` if the row is owned here.
    pub fn get_global(&self, row: u64, col: u64) -> Option<f64> {
        let off = self.layout.local_offset(row).ok()?;
        Some(self.rows[off].get(&col).copied().unwrap_or(0.0))
    }

    /// Diagonal of the owned rows.
    pub fn diagonal(&self) -> Vec<f64> {
        let start = self.layout.local_range().start;
        self.rows
            .iter()
            .enumerate()
            .map(|(k, r)| r.get(&(start + k as u64)).copied().unwrap_or(0.0))
            .collect()
    }

    /// Owned entries as `(row, col, value)` in global numbering, row-major.
    pub fn local_triplets(&self) -> impl Iterator<Item = (u64, u64, f64)> + '_ {
        let start = self.layout.local_range().start;
        self.rows
            .iter()
            .enumerate()
            .flat_map(move |(k, r)| r.iter().map(move |(&c, &v)| (start + k as u64, c, v)))
    }

    /// Gather every rank's rows into a replicated legacy matrix (collective).
    pub fn to_legacy<C: Communicator>(&self, comm: &C) -> Result<LegacyMatrix, MeshSolveError> {
        self.to_legacy_with_tag(comm, CommTag::new(0x5600))
    }

    pub fn to_legacy_with_tag<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
    ) -> Result<LegacyMatrix, MeshSolveError> {
        if !self.is_finalized() {
            return Err(MeshSolveError::MatrixNotFinalized);
        }
        let mine: Vec<WireEntry> = self
            .local_triplets()
            .map(|(r, c, v)| WireEntry::new(r, c, v, MODE_SET))
            .collect();
        let all = allgather(comm, tag, &mine)?;
        let mut legacy = LegacyMatrix::replicated(self.layout.global_len() as usize);
        for e in all.iter().flatten().sorted_by_key(|e| (e.row(), e.col())) {
            legacy.set(e.row() as usize, e.col() as usize, e.value())?;
        }
        legacy.finalize();
        Ok(legacy)
    }
}
