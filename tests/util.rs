#![allow(dead_code)]
use mesh_linsolve::algs::communicator::{Communicator, ThreadComm};
use mesh_linsolve::data::matrix::Matrix;
use mesh_linsolve::topology::partition::CellPartition;

/// Run `f` on `n` in-process ranks, one scoped thread each; results by rank.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ThreadComm) -> T + Sync,
{
    let comms = ThreadComm::group(n);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Four-cell 1-D chain `0 - 1 - 2 - 3` over two ranks.
///
/// Rank 0 owns cells 0, 1 and ghosts 2; rank 1 owns 2, 3 and ghosts 1. Rank 1
/// lists its cells in reverse to exercise the local → global mapping.
pub fn chain_cells(rank: usize) -> (Vec<u64>, Vec<usize>) {
    match rank {
        0 => (vec![0, 1, 2], vec![0, 0, 1]),
        _ => (vec![3, 2, 1], vec![1, 1, 0]),
    }
}

pub fn chain_partition<C: Communicator>(comm: &C) -> CellPartition {
    let (cells, owners) = chain_cells(comm.rank());
    CellPartition::build(cells, owners, comm).expect("chain partition")
}

/// Overlapping-local index of a mesh cell id.
pub fn local_of(p: &CellPartition, cell: u64) -> Option<usize> {
    p.cell_ids().iter().position(|&c| c == cell)
}

/// Assemble `tridiag(-1, 2, -1)` over the owned rows of a chain of `n` cells.
pub fn assemble_chain(p: &CellPartition, m: &mut Matrix, n: u64) {
    for &i in p.owned_local_indices() {
        let cell = p.cell_ids()[i];
        m.add_to(i, i, 2.0).unwrap();
        for nb in [cell.checked_sub(1), Some(cell + 1)].into_iter().flatten() {
            if nb < n {
                let j = local_of(p, nb).expect("neighbour visible");
                m.add_to(i, j, -1.0).unwrap();
            }
        }
    }
}

/// Right-hand side whose chain solution is all ones.
pub fn ones_rhs(p: &CellPartition, n: u64) -> Vec<f64> {
    p.cell_ids()
        .iter()
        .map(|&c| if c == 0 || c == n - 1 { 1.0 } else { 0.0 })
        .collect()
}
