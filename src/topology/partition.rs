//! Cell partition descriptor: owned vs ghost cells and their global numbering.
//!
//! Each rank sees an *overlapping* set of cells (owned plus ghosts), indexed
//! locally `0..overlapping_count()`. The *non-overlapping* numbering assigns
//! every owned cell exactly one global index; indices are contiguous per rank
//! (see [`RowLayout`]). Owned cells are numbered in ascending mesh cell id
//! order, after all cells of lower ranks. Ghosts learn their index from their
//! owner during [`CellPartition::build`].
//!
//! The descriptor is immutable after construction.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags, all_reduce_max};
use crate::algs::completion::sparse_exchange;
use crate::algs::wire::WireIndex;
use crate::data::row_layout::RowLayout;
use crate::mesh_error::MeshSolveError;

/// Reply sent by an owner for a cell it does not own.
const UNKNOWN_CELL: u64 = u64::MAX;

/// Communication tags used while building a partition.
#[derive(Copy, Clone, Debug)]
pub struct PartitionCommTags {
    pub agree: CommTag,
    pub layout: CommTag,
    pub request: ExchangeTags,
    pub reply: ExchangeTags,
    pub claims: ExchangeTags,
    pub verify: CommTag,
}

impl PartitionCommTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            agree: base,
            layout: base.offset(1),
            request: ExchangeTags::from_base(base.offset(2)),
            reply: ExchangeTags::from_base(base.offset(4)),
            claims: ExchangeTags::from_base(base.offset(6)),
            verify: base.offset(8),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPartition {
    rank: usize,
    /// mesh cell id per overlapping-local index
    cell_ids: Vec<u64>,
    /// owning rank per overlapping-local index
    owners: Vec<usize>,
    /// non-overlapping global index per overlapping-local index
    global_ids: Vec<u64>,
    /// overlapping-local indices of owned cells, in global index order
    owned_local: Vec<usize>,
    layout: RowLayout,
}

impl CellPartition {
    /// Build the descriptor collectively using explicit communication tags.
    ///
    /// `cell_ids[i]` is the mesh's global id for local cell `i` and
    /// `owners[i]` the rank owning it. Every rank must call this together.
    /// Any rank's invalid input makes every rank return an error, and so does
    /// a cell claimed as owned by two ranks.
    pub fn build_with_tags<C: Communicator>(
        cell_ids: Vec<u64>,
        owners: Vec<usize>,
        comm: &C,
        tags: PartitionCommTags,
    ) -> Result<Self, MeshSolveError> {
        let me = comm.rank();
        let local_err = validate_local(&cell_ids, &owners, comm.size());
        let any_err = all_reduce_max(
            comm,
            tags.agree,
            if local_err.is_some() { 1.0 } else { 0.0 },
        )?;
        if let Some(err) = local_err {
            return Err(err);
        }
        if any_err > 0.0 {
            return Err(MeshSolveError::CommError {
                neighbor: me,
                source: "partition input rejected on another rank".into(),
            });
        }

        let mut owned_local: Vec<usize> = (0..cell_ids.len()).filter(|&i| owners[i] == me).collect();
        owned_local.sort_unstable_by_key(|&i| cell_ids[i]);
        let layout = RowLayout::gather(owned_local.len(), comm, tags.layout)?;
        let start = layout.local_range().start;

        let mut global_ids = vec![UNKNOWN_CELL; cell_ids.len()];
        let mut by_cell: HashMap<u64, u64> = HashMap::with_capacity(owned_local.len());
        for (k, &i) in owned_local.iter().enumerate() {
            global_ids[i] = start + k as u64;
            by_cell.insert(cell_ids[i], start + k as u64);
        }

        // ghosts ask their owner for the global index
        let mut requests: BTreeMap<usize, Vec<WireIndex>> = BTreeMap::new();
        let mut waiting: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &owner) in owners.iter().enumerate() {
            if owner != me {
                requests.entry(owner).or_default().push(WireIndex::of(cell_ids[i]));
                waiting.entry(owner).or_default().push(i);
            }
        }
        let asked = sparse_exchange(&requests, comm, tags.request)?;
        let replies: BTreeMap<usize, Vec<WireIndex>> = asked
            .into_iter()
            .map(|(holder, cells)| {
                let answer = cells
                    .iter()
                    .map(|c| WireIndex::of(by_cell.get(&c.get()).copied().unwrap_or(UNKNOWN_CELL)))
                    .collect();
                (holder, answer)
            })
            .collect();
        let answered = sparse_exchange(&replies, comm, tags.reply)?;

        let mut ghost_err = None;
        for (owner, slots) in &waiting {
            let got = answered.get(owner).map_or(&[][..], Vec::as_slice);
            for (k, &i) in slots.iter().enumerate() {
                match got.get(k).map(WireIndex::get) {
                    Some(g) if g != UNKNOWN_CELL => global_ids[i] = g,
                    _ => {
                        ghost_err.get_or_insert(MeshSolveError::GhostWithoutOwner {
                            cell: cell_ids[i],
                            owner: *owner,
                        });
                    }
                }
            }
        }

        let ghosts_failed = all_reduce_max(
            comm,
            tags.agree,
            if ghost_err.is_some() { 1.0 } else { 0.0 },
        )?;
        if let Some(err) = ghost_err {
            return Err(err);
        }
        if ghosts_failed > 0.0 {
            return Err(MeshSolveError::CommError {
                neighbor: me,
                source: "ghost resolution failed on another rank".into(),
            });
        }

        let partition = Self {
            rank: me,
            cell_ids,
            owners,
            global_ids,
            owned_local,
            layout,
        };

        partition.verify_unique_ownership(comm, tags.claims, tags.verify)?;

        log::debug!(
            "rank {me}: partition with {} owned, {} ghost, {} global cells",
            partition.owned_count(),
            partition.ghost_count(),
            partition.global_count()
        );
        Ok(partition)
    }

    /// Convenience wrapper using a default base tag (0x5000).
    pub fn build<C: Communicator>(
        cell_ids: Vec<u64>,
        owners: Vec<usize>,
        comm: &C,
    ) -> Result<Self, MeshSolveError> {
        Self::build_with_tags(
            cell_ids,
            owners,
            comm,
            PartitionCommTags::from_base(CommTag::new(0x5000)),
        )
    }

    /// Degenerate single-process partition of `n` cells; both numberings coincide.
    pub fn serial(n: usize) -> Self {
        Self {
            rank: 0,
            cell_ids: (0..n as u64).collect(),
            owners: vec![0; n],
            global_ids: (0..n as u64).collect(),
            owned_local: (0..n).collect(),
            layout: RowLayout::serial(n),
        }
    }

    /// Fail on every rank if any cell has two owners.
    ///
    /// Each owned cell id is sent to the directory rank `cell % size`, which
    /// checks its share of the ids; the first duplicate found is then shared
    /// with everyone. Collective.
    fn verify_unique_ownership<C: Communicator>(
        &self,
        comm: &C,
        claims_tags: ExchangeTags,
        verify: CommTag,
    ) -> Result<(), MeshSolveError> {
        let me = comm.rank();
        let size = comm.size() as u64;
        let mut outgoing: BTreeMap<usize, Vec<WireIndex>> = BTreeMap::new();
        for &i in &self.owned_local {
            let cell = self.cell_ids[i];
            outgoing
                .entry((cell % size) as usize)
                .or_default()
                .push(WireIndex::of(cell));
        }
        let mut claims = sparse_exchange(&outgoing, comm, claims_tags)?;
        if let Some(mine) = outgoing.remove(&me) {
            claims.insert(me, mine);
        }

        let mut seen: HashMap<u64, usize> = HashMap::new();
        let mut clash = [WireIndex::of(UNKNOWN_CELL); 3];
        'scan: for (&rank, cells) in &claims {
            for c in cells {
                if let Some(&first) = seen.get(&c.get()) {
                    clash = [*c, WireIndex::of(first as u64), WireIndex::of(rank as u64)];
                    break 'scan;
                }
                seen.insert(c.get(), rank);
            }
        }

        let reports = crate::algs::communicator::allgather(comm, verify, &clash)?;
        let found = reports.iter().find_map(|r| match r.as_slice() {
            [cell, first, second] if cell.get() != UNKNOWN_CELL => {
                Some((cell.get(), first.get() as usize, second.get() as usize))
            }
            _ => None,
        });
        match found {
            Some((cell, first, second)) => Err(MeshSolveError::DuplicateOwnership {
                cell,
                first,
                second,
            }),
            None => Ok(()),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of cells owned by this rank.
    pub fn owned_count(&self) -> usize {
        self.owned_local.len()
    }

    /// Non-overlapping global indices of the owned cells (contiguous, ascending).
    pub fn owned_global_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.owned_local.iter().map(|&i| self.global_ids[i])
    }

    /// Overlapping-local indices of the owned cells, in global index order.
    pub fn owned_local_indices(&self) -> &[usize] {
        &self.owned_local
    }

    /// Number of cells visible on this rank, ghosts included.
    pub fn overlapping_count(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn ghost_count(&self) -> usize {
        self.overlapping_count() - self.owned_count()
    }

    /// Non-overlapping global index of every overlapping-local cell.
    pub fn overlapping_global_ids(&self) -> &[u64] {
        &self.global_ids
    }

    /// Mesh cell id of every overlapping-local cell.
    pub fn cell_ids(&self) -> &[u64] {
        &self.cell_ids
    }

    pub fn owner(&self, local: usize) -> Option<usize> {
        self.owners.get(local).copied()
    }

    pub fn is_owned(&self, local: usize) -> bool {
        self.owner(local) == Some(self.rank)
    }

    pub fn global_id(&self, local: usize) -> Option<u64> {
        self.global_ids.get(local).copied()
    }

    /// Number of cells across the whole decomposition.
    pub fn global_count(&self) -> u64 {
        self.layout.global_len()
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }
}

fn validate_local(
    cell_ids: &[u64],
    owners: &[usize],
    size: usize,
) -> Option<MeshSolveError> {
    if cell_ids.len() != owners.len() {
        return Some(MeshSolveError::LengthMismatch {
            what: "partition owners",
            expected: cell_ids.len(),
            got: owners.len(),
        });
    }
    let mut seen = hashbrown::HashSet::with_capacity(cell_ids.len());
    for (&cell, &owner) in cell_ids.iter().zip(owners) {
        if cell == UNKNOWN_CELL || !seen.insert(cell) {
            return Some(MeshSolveError::DuplicateCellId(cell));
        }
        if owner >= size {
            return Some(MeshSolveError::OwnerOutOfRange { cell, owner, size });
        }
    }
    None
}
