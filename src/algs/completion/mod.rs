//! Two-phase "sizes then data" exchange used by every collective that moves
//! per-peer payloads (ghost-row reduction, halo import, partition lookup).
//!
//! 1. Count records per peer, send/recv counts (tag = `tags.sizes`).
//! 2. Send/recv the bulk buffers (tag = `tags.data`).

pub mod data_exchange;
pub mod size_exchange;

use std::collections::{BTreeMap, BTreeSet};

use bytemuck::Pod;

use crate::algs::communicator::{Communicator, ExchangeTags};
use crate::mesh_error::MeshSolveError;

pub use data_exchange::exchange_data;
pub use size_exchange::exchange_sizes;

/// Deliver `sends[nbr]` to each `nbr` and return what every peer sent us.
///
/// Collective over the whole group: counts travel to every peer so that
/// receivers need no prior knowledge of who will send. Entries addressed to
/// the calling rank itself are ignored.
pub fn sparse_exchange<C, T>(
    sends: &BTreeMap<usize, Vec<T>>,
    comm: &C,
    tags: ExchangeTags,
) -> Result<BTreeMap<usize, Vec<T>>, MeshSolveError>
where
    C: Communicator,
    T: Pod,
{
    let me = comm.rank();
    let peers: BTreeSet<usize> = (0..comm.size()).filter(|&p| p != me).collect();
    if peers.is_empty() {
        return Ok(BTreeMap::new());
    }
    let counts = exchange_sizes(sends, comm, tags.sizes, &peers)?;
    exchange_data(sends, &counts, comm, tags.data)
}
