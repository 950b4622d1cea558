//! Stage 2 of a neighbour exchange: exchange the actual data items.

use std::collections::BTreeMap;

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, pod_vec_from_bytes};
use crate::mesh_error::MeshSolveError;

/// Send each non-empty `sends[nbr]` buffer and receive `recv_counts[nbr]`
/// records from every peer announcing a non-zero count (from stage 1).
///
/// Received buffers are returned keyed by sender rank, in ascending order.
pub fn exchange_data<C, T>(
    sends: &BTreeMap<usize, Vec<T>>,
    recv_counts: &BTreeMap<usize, usize>,
    comm: &C,
    tag: CommTag,
) -> Result<BTreeMap<usize, Vec<T>>, MeshSolveError>
where
    C: Communicator,
    T: Pod,
{
    let mut pending_sends = Vec::with_capacity(sends.len());
    for (&nbr, items) in sends {
        if items.is_empty() || nbr == comm.rank() {
            continue;
        }
        pending_sends.push(comm.isend(nbr, tag.as_u16(), cast_slice(items)));
    }

    let mut received = BTreeMap::new();
    let mut maybe_err = None;
    for (&nbr, &n_items) in recv_counts {
        if n_items == 0 {
            continue;
        }
        let expected = n_items * std::mem::size_of::<T>();
        match comm.irecv(nbr, tag.as_u16()).wait() {
            Some(raw) if raw.len() == expected => {
                if maybe_err.is_none() {
                    match pod_vec_from_bytes::<T>(&raw, nbr) {
                        Ok(items) => {
                            received.insert(nbr, items);
                        }
                        Err(e) => maybe_err = Some(e),
                    }
                }
            }
            Some(raw) if maybe_err.is_none() => {
                maybe_err = Some(MeshSolveError::BufferSizeMismatch {
                    neighbor: nbr,
                    expected,
                    got: raw.len(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(MeshSolveError::CommError {
                    neighbor: nbr,
                    source: "No data received (wait returned None)".into(),
                });
            }
            _ => {}
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(received),
    }
}
