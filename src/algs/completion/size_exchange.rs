//! Stage 1 of a neighbour exchange: exchange counts with each peer.
//!
//! Senders do not always know who will talk to them (a ghost holder knows its
//! owner, the owner does not know its ghost holders), so counts are exchanged
//! with every peer in `peers`, zero included. Every send/receive handle is
//! drained before returning, even if an error occurs.

use std::collections::{BTreeMap, BTreeSet};

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, pod_vec_from_bytes};
use crate::mesh_error::MeshSolveError;

/// Send `sends[nbr].len()` to every peer and collect the counts they announce.
///
/// Returns a map `nbr → count` with one entry per peer.
pub fn exchange_sizes<C, T>(
    sends: &BTreeMap<usize, Vec<T>>,
    comm: &C,
    tag: CommTag,
    peers: &BTreeSet<usize>,
) -> Result<BTreeMap<usize, usize>, MeshSolveError>
where
    C: Communicator,
{
    // 1) post all sends first; receives may complete eagerly
    let mut pending_sends = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let count = WireCount::new(sends.get(&nbr).map_or(0, Vec::len));
        pending_sends.push(comm.isend(
            nbr,
            tag.as_u16(),
            cast_slice(std::slice::from_ref(&count)),
        ));
    }

    // 2) wait for all recvs, collect counts (but do not early-return)
    let mut sizes_in = BTreeMap::new();
    let mut maybe_err = None;
    for &nbr in peers {
        let h = comm.irecv(nbr, tag.as_u16());
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                if maybe_err.is_none() {
                    match pod_vec_from_bytes::<WireCount>(&data, nbr) {
                        Ok(cnt) => {
                            sizes_in.insert(nbr, cnt.first().map_or(0, WireCount::get));
                        }
                        Err(e) => maybe_err = Some(e),
                    }
                }
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(MeshSolveError::CommError {
                    neighbor: nbr,
                    source: format!(
                        "expected {} bytes for size header, got {}",
                        std::mem::size_of::<WireCount>(),
                        data.len()
                    )
                    .into(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(MeshSolveError::CommError {
                    neighbor: nbr,
                    source: format!("failed to receive size from rank {nbr}").into(),
                });
            }
            _ => {} // already have an error; just drain
        }
    }

    // 3) always drain all send handles before returning
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(sizes_in),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::ThreadComm;

    #[test]
    fn counts_include_zero_for_silent_peers() {
        let comms = ThreadComm::group(3);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let me = comm.rank();
                        let mut sends: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
                        // only rank 0 talks, to rank 2
                        if me == 0 {
                            sends.insert(2, vec![1, 2, 3]);
                        }
                        let peers: BTreeSet<usize> = (0..3).filter(|&p| p != me).collect();
                        exchange_sizes(&sends, comm, CommTag::new(0x10), &peers).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[2][&0], 3);
        assert_eq!(results[2][&1], 0);
        assert_eq!(results[1][&0], 0);
        assert_eq!(results[0][&2], 0);
    }
}
