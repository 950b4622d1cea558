mod util;

use mesh_linsolve::prelude::*;
use util::{assemble_chain, chain_partition, ones_rhs, run_ranks};

#[test]
fn single_cell_system() {
    let comm = NoComm;
    let p = CellPartition::serial(1);
    let ex = VectorExchange::new(&p, &comm).unwrap();
    let mut a = Matrix::distributed(&p);
    a.set(0, 0, 2.0).unwrap();
    a.finalize(&comm).unwrap();

    let mut solver = Solver::new(ConjugateGradient, SolverConfig::default()).unwrap();
    let mut x = vec![0.0];
    let report = solver.solve(&a, &[4.0], &mut x, &ex, &comm).unwrap();
    assert_eq!(x, vec![2.0]);
    assert_eq!(report.state, SolverState::Solved);
    assert_eq!(solver.last_state(), Some(SolverState::Solved));

    let mut lu = Solver::new(RedundantLu, SolverConfig::default()).unwrap();
    let mut y = vec![0.0];
    let mut legacy = Matrix::Legacy(LegacyMatrix::new(1));
    legacy.set(0, 0, 2.0).unwrap();
    legacy.finalize(&comm).unwrap();
    let report = lu.solve(&legacy, &[4.0], &mut y, &ex, &comm).unwrap();
    assert_eq!(y, vec![2.0]);
    assert!(!report.converted_legacy);
}

fn chain_solve<B: Backend>(backend: B) -> Vec<(Vec<u64>, Vec<f64>, SolveReport)>
where
    B: Copy + Send + Sync,
{
    run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let ex = VectorExchange::new(&p, &comm).unwrap();
        let mut a = Matrix::distributed(&p);
        assemble_chain(&p, &mut a, 4);
        a.finalize(&comm).unwrap();
        let mut solver = Solver::new(backend, SolverConfig::default()).unwrap();
        let mut x = vec![0.0; p.overlapping_count()];
        let report = solver.solve(&a, &ones_rhs(&p, 4), &mut x, &ex, &comm).unwrap();
        (p.cell_ids().to_vec(), x, report)
    })
}

fn value_at(rank: &(Vec<u64>, Vec<f64>, SolveReport), cell: u64) -> f64 {
    let i = rank.0.iter().position(|&c| c == cell).unwrap();
    rank.1[i]
}

#[test]
fn two_rank_chain_ghosts_match_owners_bit_for_bit() {
    for results in [chain_solve(ConjugateGradient), chain_solve(BiCgStab), chain_solve(RedundantLu)] {
        for r in &results {
            assert_eq!(r.2.state, SolverState::Solved);
            for &x in &r.1 {
                assert!((x - 1.0).abs() < 1e-8, "x = {x}");
            }
        }
        // rank 0 ghosts cell 2, rank 1 ghosts cell 1
        assert_eq!(value_at(&results[0], 2).to_bits(), value_at(&results[1], 2).to_bits());
        assert_eq!(value_at(&results[0], 1).to_bits(), value_at(&results[1], 1).to_bits());
        assert_eq!(results[0].2.iterations, results[1].2.iterations);
    }
}

#[test]
fn legacy_and_distributed_solves_agree() {
    let got = run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let ex = VectorExchange::new(&p, &comm).unwrap();
        let rhs: Vec<f64> = p.cell_ids().iter().map(|&c| (c + 1) as f64).collect();

        let mut dist = Matrix::distributed(&p);
        assemble_chain(&p, &mut dist, 4);
        dist.finalize(&comm).unwrap();

        let mut full = LegacyMatrix::replicated(4);
        for r in 0..4usize {
            full.set(r, r, 2.0).unwrap();
            if r + 1 < 4 {
                full.set(r, r + 1, -1.0).unwrap();
                full.set(r + 1, r, -1.0).unwrap();
            }
        }
        let mut legacy = Matrix::Legacy(full);
        legacy.finalize(&comm).unwrap();

        let cfg = SolverConfig::default().with_tolerance(1e-12);
        let mut cg = Solver::new(ConjugateGradient, cfg.clone()).unwrap();
        let mut x_dist = vec![0.0; p.overlapping_count()];
        let r_dist = cg.solve(&dist, &rhs, &mut x_dist, &ex, &comm).unwrap();
        let mut x_conv = vec![0.0; p.overlapping_count()];
        let r_conv = cg.solve(&legacy, &rhs, &mut x_conv, &ex, &comm).unwrap();

        let mut lu = Solver::new(RedundantLu, cfg).unwrap();
        let mut x_lu = vec![0.0; p.overlapping_count()];
        lu.solve(&legacy, &rhs, &mut x_lu, &ex, &comm).unwrap();

        assert!(!r_dist.converted_legacy);
        assert!(r_conv.converted_legacy);
        (x_dist, x_conv, x_lu)
    });
    for (d, c, l) in got {
        for ((d, c), l) in d.iter().zip(&c).zip(&l) {
            assert!((d - c).abs() < 1e-9);
            assert!((d - l).abs() < 1e-9);
        }
    }
}

#[test]
fn unfinalized_matrix_fails_on_every_rank() {
    let got = run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let ex = VectorExchange::new(&p, &comm).unwrap();
        let mut a = Matrix::distributed(&p);
        assemble_chain(&p, &mut a, 4);
        let mut solver = Solver::new(BiCgStab, SolverConfig::default()).unwrap();
        let mut x = vec![0.0; p.overlapping_count()];
        let err = solver.solve(&a, &ones_rhs(&p, 4), &mut x, &ex, &comm).unwrap_err();
        (err, x, solver.last_state())
    });
    for (err, x, last) in got {
        assert!(matches!(err, MeshSolveError::MatrixNotFinalized));
        assert!(x.iter().all(|&v| v == 0.0));
        assert_eq!(last, Some(SolverState::Failed));
    }
}

#[test]
fn iteration_cap_is_reported_as_failure() {
    let got = run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let ex = VectorExchange::new(&p, &comm).unwrap();
        let mut a = Matrix::distributed(&p);
        assemble_chain(&p, &mut a, 4);
        a.finalize(&comm).unwrap();
        let rhs: Vec<f64> = p.cell_ids().iter().map(|&c| if c == 0 { 1.0 } else { 0.0 }).collect();
        let cfg = SolverConfig::default().with_max_iterations(1);
        let mut solver = Solver::new(ConjugateGradient, cfg).unwrap();
        let mut x = vec![0.0; p.overlapping_count()];
        let err = solver.solve(&a, &rhs, &mut x, &ex, &comm).unwrap_err();
        (err, x, solver.state())
    });
    for (err, x, state) in got {
        match err {
            MeshSolveError::SolveFailed { backend, iterations, residual, .. } => {
                assert_eq!(backend, "conjugate-gradient");
                assert_eq!(iterations, 1);
                assert!(residual > 0.0);
            }
            other => panic!("expected SolveFailed, got {other:?}"),
        }
        assert!(x.iter().all(|&v| v == 0.0));
        assert_eq!(state, SolverState::Configured);
    }
}

#[test]
fn singular_system_fails_in_the_direct_backend() {
    let comm = NoComm;
    let p = CellPartition::serial(2);
    let ex = VectorExchange::new(&p, &comm).unwrap();
    let mut a = Matrix::Legacy(LegacyMatrix::new(2));
    for (r, c) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
        a.set(r, c, 1.0).unwrap();
    }
    a.finalize(&comm).unwrap();
    let mut solver = Solver::new(RedundantLu, SolverConfig::default()).unwrap();
    let mut x = vec![0.0; 2];
    let err = solver.solve(&a, &[1.0, 2.0], &mut x, &ex, &comm).unwrap_err();
    assert!(matches!(err, MeshSolveError::SolveFailed { backend: "redundant-lu", .. }));
    assert!(!err.is_configuration());
}

#[test]
fn per_process_legacy_solve_is_refused_in_parallel() {
    let got = run_ranks(2, |comm| {
        let p = chain_partition(&comm);
        let ex = VectorExchange::new(&p, &comm).unwrap();
        let mut a = Matrix::legacy(&p);
        assemble_chain(&p, &mut a, 4);
        a.finalize(&comm).unwrap();
        let mut solver = Solver::new(ConjugateGradient, SolverConfig::default()).unwrap();
        let mut x = vec![0.0; p.overlapping_count()];
        solver.solve(&a, &ones_rhs(&p, 4), &mut x, &ex, &comm).unwrap_err()
    });
    for err in got {
        assert!(matches!(err, MeshSolveError::LegacyConversionInParallel { ranks: 2 }));
    }
}

#[test]
fn widely_scaled_coefficients_solve_directly() {
    let comm = NoComm;
    let p = CellPartition::serial(2);
    let ex = VectorExchange::new(&p, &comm).unwrap();
    let mut a = Matrix::Legacy(LegacyMatrix::new(2));
    a.set(0, 0, 1e20).unwrap();
    a.set(1, 1, 1.0).unwrap();
    a.finalize(&comm).unwrap();

    let mut lu = Solver::new(RedundantLu, SolverConfig::default()).unwrap();
    let mut x = vec![0.0; 2];
    let report = lu.solve(&a, &[1e20, 3.0], &mut x, &ex, &comm).unwrap();
    assert_eq!(report.state, SolverState::Solved);
    assert_eq!(x, vec![1.0, 3.0]);

    let mut cg = Solver::new(ConjugateGradient, SolverConfig::default()).unwrap();
    let mut y = vec![0.0; 2];
    cg.solve(&a, &[1e20, 3.0], &mut y, &ex, &comm).unwrap();
    for (x, y) in x.iter().zip(&y) {
        assert!((x - y).abs() < 1e-12);
    }
}
