//! HaloPlan: precomputed import schedule from owning ranks to holders.
//!
//! A holder lists, per slot, the global non-overlapping index whose value it
//! needs. Building the plan is collective: each holder tells every owner which
//! of its rows to ship, once. Executing the plan afterwards only moves values.

use std::collections::BTreeMap;

use crate::algs::communicator::{Communicator, ExchangeTags};
use crate::algs::completion::{exchange_data, sparse_exchange};
use crate::algs::wire::{WireIndex, WireValue};
use crate::data::row_layout::RowLayout;
use crate::mesh_error::MeshSolveError;
use crate::overlap::delta::{CopyDelta, Delta};

#[derive(Clone, Debug)]
pub struct HaloPlan {
    /// holder rank → offsets into our owned slice, in the holder's slot order
    sends: BTreeMap<usize, Vec<usize>>,
    /// owner rank → our slots to fill, in the order the owner ships them
    recvs: BTreeMap<usize, Vec<usize>>,
    /// slots satisfied from our own owned slice: (slot, owned offset)
    local: Vec<(usize, usize)>,
    n_slots: usize,
    n_owned: usize,
    tags: ExchangeTags,
}

impl HaloPlan {
    /// Build the plan for `needed[slot] = global index` (collective).
    pub fn build<C: Communicator>(
        needed: &[u64],
        layout: &RowLayout,
        comm: &C,
        tags: ExchangeTags,
    ) -> Result<Self, MeshSolveError> {
        let me = comm.rank();
        let mut requests: BTreeMap<usize, Vec<WireIndex>> = BTreeMap::new();
        let mut recvs: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut local = Vec::new();
        let mut bad_index = None;
        for (slot, &g) in needed.iter().enumerate() {
            match layout.owner_of(g) {
                Some(owner) if owner == me => local.push((slot, layout.local_offset(g)?)),
                Some(owner) => {
                    requests.entry(owner).or_default().push(WireIndex::of(g));
                    recvs.entry(owner).or_default().push(slot);
                }
                None => {
                    bad_index.get_or_insert(g);
                }
            }
        }

        // every rank takes part in the exchange even if its own input is bad
        let incoming = sparse_exchange(&requests, comm, tags)?;
        if let Some(g) = bad_index {
            return Err(MeshSolveError::RowNotOwned {
                row: g,
                rank: me,
                start: 0,
                end: layout.global_len(),
            });
        }

        let mut sends = BTreeMap::new();
        for (holder, wanted) in incoming {
            let offsets = wanted
                .iter()
                .map(|w| layout.local_offset(w.get()))
                .collect::<Result<Vec<_>, _>>()?;
            sends.insert(holder, offsets);
        }

        log::debug!(
            "rank {me}: halo plan with {} slots, {} local, {} owners, {} holders",
            needed.len(),
            local.len(),
            recvs.len(),
            sends.len()
        );
        Ok(Self {
            sends,
            recvs,
            local,
            n_slots: needed.len(),
            n_owned: layout.local_len(),
            tags,
        })
    }

    /// Number of slots this rank imports into.
    pub fn num_slots(&self) -> usize {
        self.n_slots
    }

    /// Number of values this rank ships to others per execution.
    pub fn num_exported(&self) -> usize {
        self.sends.values().map(Vec::len).sum()
    }

    /// Number of values this rank receives from others per execution.
    pub fn num_imported(&self) -> usize {
        self.recvs.values().map(Vec::len).sum()
    }

    /// Import owner values into `slots`, replacing previous content (collective).
    pub fn execute<C: Communicator>(
        &self,
        owned: &[f64],
        slots: &mut [f64],
        comm: &C,
    ) -> Result<(), MeshSolveError> {
        self.execute_with::<C, CopyDelta>(owned, slots, comm)
    }

    /// Import owner values into `slots`, merging them with `D` (collective).
    pub fn execute_with<C, D>(
        &self,
        owned: &[f64],
        slots: &mut [f64],
        comm: &C,
    ) -> Result<(), MeshSolveError>
    where
        C: Communicator,
        D: Delta<f64>,
    {
        if owned.len() != self.n_owned {
            return Err(MeshSolveError::LengthMismatch {
                what: "owned values",
                expected: self.n_owned,
                got: owned.len(),
            });
        }
        if slots.len() != self.n_slots {
            return Err(MeshSolveError::LengthMismatch {
                what: "halo slots",
                expected: self.n_slots,
                got: slots.len(),
            });
        }

        let outgoing: BTreeMap<usize, Vec<WireValue>> = self
            .sends
            .iter()
            .map(|(&holder, offsets)| {
                (
                    holder,
                    offsets.iter().map(|&o| WireValue::of(owned[o])).collect(),
                )
            })
            .collect();
        let counts: BTreeMap<usize, usize> = self
            .recvs
            .iter()
            .map(|(&owner, slots)| (owner, slots.len()))
            .collect();
        let incoming = exchange_data(&outgoing, &counts, comm, self.tags.data)?;

        for &(slot, offset) in &self.local {
            D::fuse(&mut slots[slot], owned[offset]);
        }
        for (owner, values) in incoming {
            let targets = self.recvs.get(&owner).map_or(&[][..], Vec::as_slice);
            for (&slot, v) in targets.iter().zip(&values) {
                D::fuse(&mut slots[slot], v.get());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{CommTag, NoComm};

    #[test]
    fn serial_plan_is_a_gather() {
        let layout = RowLayout::serial(3);
        let tags = ExchangeTags::from_base(CommTag::new(0x20));
        let plan = HaloPlan::build(&[2, 0, 2], &layout, &NoComm, tags).unwrap();
        assert_eq!(plan.num_imported(), 0);
        let mut slots = vec![0.0; 3];
        plan.execute(&[1.0, 2.0, 3.0], &mut slots, &NoComm).unwrap();
        assert_eq!(slots, vec![3.0, 1.0, 3.0]);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let layout = RowLayout::serial(2);
        let tags = ExchangeTags::from_base(CommTag::new(0x22));
        let res = HaloPlan::build(&[5], &layout, &NoComm, tags);
        assert!(matches!(res, Err(MeshSolveError::RowNotOwned { row: 5, .. })));
    }
}
