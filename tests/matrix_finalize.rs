mod util;

use mesh_linsolve::algs::communicator::Communicator;
use mesh_linsolve::data::matrix::{DistributedMatrix, LegacyMatrix, Matrix};
use mesh_linsolve::mesh_error::MeshSolveError;
use util::{assemble_chain, chain_partition, local_of, run_ranks};

#[test]
fn ghost_row_contributions_are_summed_at_the_owner() {
    let got = run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let mut m = DistributedMatrix::new(&p);
        // every rank adds 1 on the diagonal of every cell it can see
        for i in 0..p.overlapping_count() {
            m.add_to(i, i, 1.0).unwrap();
        }
        assert_eq!(m.num_pending(), 1);
        m.finalize(&comm).unwrap();
        assert_eq!(m.num_pending(), 0);
        m.diagonal()
    });
    // cells 1 and 2 are visible on both ranks
    assert_eq!(got[0], vec![1.0, 2.0]);
    assert_eq!(got[1], vec![2.0, 1.0]);
}

#[test]
fn set_from_a_ghost_holder_replaces_the_owner_value() {
    let got = run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let mut m = DistributedMatrix::new(&p);
        let (c1, c2) = (local_of(&p, 1).unwrap(), local_of(&p, 2).unwrap());
        if comm.rank() == 0 {
            m.add_to(c1, c2, 1.0).unwrap();
        } else {
            m.set(c1, c2, 5.0).unwrap();
        }
        m.finalize(&comm).unwrap();
        m.get_global(1, 2)
    });
    assert_eq!(got[0], Some(5.0));
    assert_eq!(got[1], None);
}

#[test]
fn finalize_twice_changes_nothing() {
    run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let mut m = Matrix::distributed(&p);
        for i in 0..p.overlapping_count() {
            m.add_to(i, i, 3.0).unwrap();
        }
        m.finalize(&comm).unwrap();
        let Matrix::Distributed(d) = &m else { unreachable!() };
        let first = d.csr().cloned();
        m.finalize(&comm).unwrap();
        let Matrix::Distributed(d) = &m else { unreachable!() };
        assert_eq!(d.csr().cloned(), first);
    });
}

#[test]
fn distributed_to_legacy_and_back_preserves_coefficients() {
    run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let mut m = Matrix::distributed(&p);
        assemble_chain(&p, &mut m, 4);
        m.finalize(&comm).unwrap();
        let Matrix::Distributed(d) = &m else { unreachable!() };

        let legacy = d.to_legacy(&comm).unwrap();
        assert!(legacy.is_replicated());
        assert_eq!(legacy.nnz(), 10);
        for r in 0..4 {
            assert_eq!(legacy.get(r, r), 2.0);
        }

        let back = Matrix::Legacy(legacy);
        let (dist, converted) = back.as_distributed(&p, &comm).unwrap();
        assert!(converted);
        let want: Vec<_> = d.local_triplets().collect();
        let got: Vec<_> = dist.local_triplets().collect();
        assert_eq!(got, want);
    });
}

#[test]
fn per_process_legacy_is_refused_in_parallel() {
    let got = run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let mut m = Matrix::legacy(&p);
        assemble_chain(&p, &mut m, 4);
        m.finalize(&comm).unwrap();
        m.as_distributed(&p, &comm).map(|_| ()).unwrap_err()
    });
    for err in got {
        assert!(matches!(err, MeshSolveError::LegacyConversionInParallel { ranks: 2 }));
        assert!(err.is_configuration());
    }
}

#[test]
fn replicated_legacy_contributes_only_owned_rows() {
    let got = run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let mut full = LegacyMatrix::replicated(4);
        for r in 0..4 {
            full.set(r, r, (r + 1) as f64).unwrap();
        }
        let mut m = Matrix::Legacy(full);
        m.finalize(&comm).unwrap();
        let (d, _) = m.as_distributed(&p, &comm).unwrap();
        (comm.rank(), d.diagonal(), d.nnz_local())
    });
    assert_eq!(got[0], (0, vec![1.0, 2.0], 2));
    assert_eq!(got[1], (1, vec![3.0, 4.0], 2));
}
