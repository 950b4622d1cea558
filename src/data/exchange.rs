//! Vector exchange between the mesh's overlapping-local numbering and the
//! solver's non-overlapping global numbering.
//!
//! - **Scatter-to-solve** keeps the owned entries only, in global order.
//!   Ghost values are dropped; they belong to another rank's owned set.
//! - **Import-from-solve** copies owned entries back and fetches every ghost
//!   entry from its owner, replacing whatever the ghost held before. This half
//!   is collective: every rank must call it, or its peers block.

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags};
use crate::algs::halo::HaloPlan;
use crate::data::vector::DistVector;
use crate::mesh_error::MeshSolveError;
use crate::topology::partition::CellPartition;

/// Import schedule for one partition, built once and reused across solves.
#[derive(Clone, Debug)]
pub struct VectorExchange<'a> {
    partition: &'a CellPartition,
    /// overlapping-local indices of ghost cells, one per halo slot
    ghost_local: Vec<usize>,
    plan: HaloPlan,
}

impl<'a> VectorExchange<'a> {
    /// Build the ghost import plan using explicit tags (collective).
    pub fn with_tags<C: Communicator>(
        partition: &'a CellPartition,
        comm: &C,
        tags: ExchangeTags,
    ) -> Result<Self, MeshSolveError> {
        let ghost_local: Vec<usize> = (0..partition.overlapping_count())
            .filter(|&i| !partition.is_owned(i))
            .collect();
        let needed: Vec<u64> = ghost_local
            .iter()
            .map(|&i| partition.overlapping_global_ids()[i])
            .collect();
        let plan = HaloPlan::build(&needed, partition.layout(), comm, tags)?;
        Ok(Self {
            partition,
            ghost_local,
            plan,
        })
    }

    /// Convenience wrapper using a default base tag (0x5100).
    pub fn new<C: Communicator>(
        partition: &'a CellPartition,
        comm: &C,
    ) -> Result<Self, MeshSolveError> {
        Self::with_tags(partition, comm, ExchangeTags::from_base(CommTag::new(0x5100)))
    }

    pub fn partition(&self) -> &'a CellPartition {
        self.partition
    }

    fn check_overlapping(&self, what: &'static str, len: usize) -> Result<(), MeshSolveError> {
        let expected = self.partition.overlapping_count();
        if len == expected {
            Ok(())
        } else {
            Err(MeshSolveError::LengthMismatch {
                what,
                expected,
                got: len,
            })
        }
    }

    /// Owned entries of an overlapping-local vector, in global order.
    pub fn scatter_to_solve(&self, overlapping: &[f64]) -> Result<DistVector, MeshSolveError> {
        self.check_overlapping("overlapping vector", overlapping.len())?;
        let values = self
            .partition
            .owned_local_indices()
            .iter()
            .map(|&i| overlapping[i])
            .collect();
        DistVector::new(self.partition.layout(), values)
    }

    /// Write a solved non-overlapping vector back into overlapping form,
    /// refreshing ghosts from their owners (collective, replace semantics).
    pub fn import_from_solve<C: Communicator>(
        &self,
        solved: &DistVector,
        overlapping: &mut [f64],
        comm: &C,
    ) -> Result<(), MeshSolveError> {
        self.check_overlapping("overlapping vector", overlapping.len())?;
        let layout = self.partition.layout();
        if solved.len() != layout.local_len() || solved.start() != layout.local_range().start {
            return Err(MeshSolveError::LengthMismatch {
                what: "solution slice",
                expected: layout.local_len(),
                got: solved.len(),
            });
        }

        let mut ghosts: Vec<f64> = self.ghost_local.iter().map(|&i| overlapping[i]).collect();
        self.plan.execute(solved.values(), &mut ghosts, comm)?;

        for (&i, &v) in self.partition.owned_local_indices().iter().zip(solved.values()) {
            overlapping[i] = v;
        }
        for (&i, v) in self.ghost_local.iter().zip(ghosts) {
            overlapping[i] = v;
        }
        Ok(())
    }

    /// Halo exchange: refresh ghost entries of a vector whose owned entries
    /// are current (collective).
    pub fn refresh_ghosts<C: Communicator>(
        &self,
        overlapping: &mut [f64],
        comm: &C,
    ) -> Result<(), MeshSolveError> {
        let owned = self.scatter_to_solve(overlapping)?;
        self.import_from_solve(&owned, overlapping, comm)
    }

    /// Number of ghost values this rank receives per import.
    pub fn num_ghosts(&self) -> usize {
        self.ghost_local.len()
    }
}
