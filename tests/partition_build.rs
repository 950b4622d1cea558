mod util;

use mesh_linsolve::algs::communicator::Communicator;
use mesh_linsolve::mesh_error::MeshSolveError;
use mesh_linsolve::topology::partition::CellPartition;
use util::{chain_cells, chain_partition, run_ranks};

#[test]
fn two_rank_chain_numbering() {
    let parts = run_ranks(2, |comm| chain_partition(&comm));

    let p0 = &parts[0];
    assert_eq!(p0.owned_count(), 2);
    assert_eq!(p0.ghost_count(), 1);
    assert_eq!(p0.owned_global_ids().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(p0.overlapping_global_ids(), &[0, 1, 2]);

    let p1 = &parts[1];
    assert_eq!(p1.owned_count(), 2);
    assert_eq!(p1.owned_global_ids().collect::<Vec<_>>(), vec![2, 3]);
    // local order is [3, 2, 1]
    assert_eq!(p1.overlapping_global_ids(), &[3, 2, 1]);
    assert_eq!(p1.owned_local_indices(), &[1, 0]);
    assert!(!p1.is_owned(2));
    assert_eq!(p1.owner(2), Some(0));

    for p in &parts {
        assert_eq!(p.global_count(), 4);
    }
}

#[test]
fn numbering_follows_cell_ids_not_rank_input_order() {
    // mesh ids are sparse; rank 0 owns the larger ones
    let parts = run_ranks(2, |comm| {
        let (cells, owners) = match comm.rank() {
            0 => (vec![900, 700, 50], vec![0, 0, 1]),
            _ => (vec![50, 10, 700], vec![1, 1, 0]),
        };
        CellPartition::build(cells, owners, &comm).unwrap()
    });
    // rank 0: 700 → 0, 900 → 1; rank 1: 10 → 2, 50 → 3
    assert_eq!(parts[0].overlapping_global_ids(), &[1, 0, 3]);
    assert_eq!(parts[1].overlapping_global_ids(), &[3, 2, 0]);
}

#[test]
fn every_global_index_has_exactly_one_owner() {
    let parts = run_ranks(3, |comm| {
        // cell c is owned by rank c % 3; everyone ghosts cell 0
        let me = comm.rank();
        let mut cells: Vec<u64> = (0..9).filter(|c| c % 3 == me as u64).collect();
        if me != 0 {
            cells.push(0);
        }
        let owners = cells.iter().map(|&c| (c % 3) as usize).collect();
        CellPartition::build(cells, owners, &comm).unwrap()
    });
    let mut all: Vec<u64> = parts.iter().flat_map(|p| p.owned_global_ids()).collect();
    all.sort_unstable();
    assert_eq!(all, (0..9).collect::<Vec<_>>());
    // the ghost of cell 0 resolves to rank 0's index for it
    let g0 = parts[0].global_id(0).unwrap();
    for p in &parts[1..] {
        assert_eq!(p.global_id(p.overlapping_count() - 1), Some(g0));
    }
}

#[test]
fn bad_input_on_one_rank_fails_every_rank() {
    let results = run_ranks(2, |comm| {
        let (cells, mut owners) = chain_cells(comm.rank());
        if comm.rank() == 1 {
            owners[0] = 5;
        }
        CellPartition::build(cells, owners, &comm)
    });
    assert!(matches!(results[0], Err(MeshSolveError::CommError { .. })));
    assert!(matches!(
        results[1],
        Err(MeshSolveError::OwnerOutOfRange { cell: 3, owner: 5, size: 2 })
    ));
}

#[test]
fn ghost_unknown_to_its_owner_is_rejected() {
    let results = run_ranks(2, |comm| {
        let (cells, owners) = match comm.rank() {
            0 => (vec![0, 1], vec![0, 0]),
            // cell 7 does not exist on rank 0
            _ => (vec![2, 7], vec![1, 0]),
        };
        CellPartition::build(cells, owners, &comm)
    });
    assert!(results[0].is_err());
    assert!(matches!(
        results[1],
        Err(MeshSolveError::GhostWithoutOwner { cell: 7, owner: 0 })
    ));
}

#[test]
fn double_ownership_is_detected() {
    let results = run_ranks(2, |comm| CellPartition::build(vec![4], vec![comm.rank()], &comm));
    for r in results {
        assert!(matches!(
            r,
            Err(MeshSolveError::DuplicateOwnership { cell: 4, first: 0, second: 1 })
        ));
    }
}

#[test]
fn double_ownership_is_reported_by_the_directory_rank() {
    // cell 5 lands on directory rank 2, which owns neither claim
    let results = run_ranks(3, |comm| {
        let (cells, owners) = match comm.rank() {
            0 => (vec![5, 0], vec![0, 0]),
            1 => (vec![5, 1], vec![1, 1]),
            _ => (vec![2], vec![2]),
        };
        CellPartition::build(cells, owners, &comm)
    });
    for r in results {
        assert!(matches!(
            r,
            Err(MeshSolveError::DuplicateOwnership { cell: 5, first: 0, second: 1 })
        ));
    }
}
