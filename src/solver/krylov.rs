//! Distributed Krylov backends over the row-partitioned matrix.
//!
//! Each rank applies its owned rows; ghost columns are filled through a
//! [`HaloPlan`] before every product. Inner products are reduced with
//! [`all_reduce_sum`], which every rank evaluates in the same order, so
//! convergence and breakdown decisions agree across ranks.

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags, all_reduce_sum};
use crate::algs::halo::HaloPlan;
use crate::data::matrix::{DistributedMatrix, MatrixForm};
use crate::data::vector::DistVector;
use crate::mesh_error::MeshSolveError;
use crate::solver::{
    Assembled, Backend, KernelOutcome, Preconditioner, SolverCommTags, SolverConfig, relative,
};

const BREAKDOWN: f64 = 1e-300;

/// Owned rows of a distributed matrix with columns resolved to
/// `owned offset` or `n_owned + ghost slot`.
#[derive(Debug)]
pub struct DistOperator<'m> {
    matrix: Cow<'m, DistributedMatrix>,
    local_cols: Vec<usize>,
    plan: HaloPlan,
    inv_diag: Vec<f64>,
    n_owned: usize,
}

impl<'m> DistOperator<'m> {
    /// Resolve ghost columns and build their import plan (collective).
    pub fn build<C: Communicator>(
        matrix: Cow<'m, DistributedMatrix>,
        comm: &C,
        tags: ExchangeTags,
    ) -> Result<Self, MeshSolveError> {
        let csr = matrix.csr().ok_or(MeshSolveError::MatrixNotFinalized)?;
        let layout = matrix.layout();
        let range = layout.local_range();
        let n_owned = layout.local_len();

        let mut ghost_slot: BTreeMap<u64, usize> = BTreeMap::new();
        for &c in csr.cols.iter().filter(|c| !range.contains(c)) {
            ghost_slot.entry(c).or_insert(0);
        }
        for (slot, v) in ghost_slot.values_mut().enumerate() {
            *v = slot;
        }
        let needed: Vec<u64> = ghost_slot.keys().copied().collect();
        let plan = HaloPlan::build(&needed, layout, comm, tags)?;

        let local_cols = csr
            .cols
            .iter()
            .map(|c| {
                if range.contains(c) {
                    (c - range.start) as usize
                } else {
                    n_owned + ghost_slot[c]
                }
            })
            .collect();
        let inv_diag = matrix
            .diagonal()
            .into_iter()
            .map(|d| if d == 0.0 { 1.0 } else { 1.0 / d })
            .collect();

        Ok(Self {
            matrix,
            local_cols,
            plan,
            inv_diag,
            n_owned,
        })
    }

    pub fn num_owned(&self) -> usize {
        self.n_owned
    }

    pub fn num_ghost_columns(&self) -> usize {
        self.plan.num_slots()
    }

    /// `y = A x` on the owned rows (collective).
    pub fn apply<C: Communicator>(&self, x: &[f64], y: &mut [f64], comm: &C) -> Result<(), MeshSolveError> {
        let csr = self.matrix.csr().ok_or(MeshSolveError::MatrixNotFinalized)?;
        let mut ghosts = vec![0.0; self.plan.num_slots()];
        self.plan.execute(x, &mut ghosts, comm)?;
        for (row, out) in y.iter_mut().enumerate() {
            let span = csr.row_ptr[row]..csr.row_ptr[row + 1];
            *out = self.local_cols[span.clone()]
                .iter()
                .zip(&csr.vals[span])
                .map(|(&c, v)| v * if c < self.n_owned { x[c] } else { ghosts[c - self.n_owned] })
                .sum();
        }
        Ok(())
    }

    /// `z = M⁻¹ r`; purely local.
    fn precondition(&self, kind: Preconditioner, r: &[f64], z: &mut [f64]) {
        match kind {
            Preconditioner::None => z.copy_from_slice(r),
            Preconditioner::Jacobi => {
                for ((z, r), d) in z.iter_mut().zip(r).zip(&self.inv_diag) {
                    *z = r * d;
                }
            }
        }
    }

    fn check_len(&self, what: &'static str, len: usize) -> Result<(), MeshSolveError> {
        if len == self.n_owned {
            Ok(())
        } else {
            Err(MeshSolveError::LengthMismatch {
                what,
                expected: self.n_owned,
                got: len,
            })
        }
    }
}

fn dot<C: Communicator>(comm: &C, tag: CommTag, a: &[f64], b: &[f64]) -> Result<f64, MeshSolveError> {
    all_reduce_sum(comm, tag, a.iter().zip(b).map(|(x, y)| x * y).sum())
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (y, x) in y.iter_mut().zip(x) {
        *y += alpha * x;
    }
}

fn operator_from<'m, C: Communicator>(
    name: &str,
    matrix: Assembled<'m>,
    comm: &C,
    tags: SolverCommTags,
) -> Result<DistOperator<'m>, MeshSolveError> {
    match matrix {
        Assembled::Distributed(m) => DistOperator::build(m, comm, tags.halo),
        Assembled::Legacy(_) => Err(MeshSolveError::InvalidConfig(format!(
            "{name} needs a distributed matrix"
        ))),
    }
}

/// Preconditioned conjugate gradients; the matrix must be symmetric positive definite.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConjugateGradient;

impl Backend for ConjugateGradient {
    const NAME: &'static str = "conjugate-gradient";
    const REQUIRED_FORM: MatrixForm = MatrixForm::Distributed;

    type Native<'m> = DistOperator<'m>;

    fn prepare<'m, C: Communicator>(
        &self,
        matrix: Assembled<'m>,
        comm: &C,
        tags: SolverCommTags,
    ) -> Result<Self::Native<'m>, MeshSolveError> {
        operator_from(Self::NAME, matrix, comm, tags)
    }

    fn kernel<C: Communicator>(
        &self,
        op: &Self::Native<'_>,
        rhs: &DistVector,
        x: &mut DistVector,
        config: &SolverConfig,
        comm: &C,
        tags: SolverCommTags,
    ) -> Result<KernelOutcome, MeshSolveError> {
        op.check_len("right-hand side", rhs.len())?;
        op.check_len("initial guess", x.len())?;
        let n = op.num_owned();
        let b = rhs.values();
        let tag = tags.reduce;

        let b_norm = dot(comm, tag, b, b)?.sqrt();
        if b_norm == 0.0 {
            x.values_mut().fill(0.0);
            return Ok(KernelOutcome::Converged {
                iterations: 0,
                residual: 0.0,
            });
        }

        let mut r = vec![0.0; n];
        op.apply(x.values(), &mut r, comm)?;
        for (r, b) in r.iter_mut().zip(b) {
            *r = b - *r;
        }
        let mut residual = relative(dot(comm, tag, &r, &r)?.sqrt(), b_norm);
        if residual <= config.tolerance {
            return Ok(KernelOutcome::Converged {
                iterations: 0,
                residual,
            });
        }

        let mut z = vec![0.0; n];
        op.precondition(config.preconditioner, &r, &mut z);
        let mut p = z.clone();
        let mut rz = dot(comm, tag, &r, &z)?;
        let mut q = vec![0.0; n];

        for it in 1..=config.max_iterations {
            op.apply(&p, &mut q, comm)?;
            let pq = dot(comm, tag, &p, &q)?;
            if pq.is_nan() || pq <= BREAKDOWN {
                return Ok(KernelOutcome::Failed {
                    iterations: it,
                    residual,
                    reason: format!("breakdown: p·Ap = {pq:e}, matrix is not positive definite"),
                });
            }
            let alpha = rz / pq;
            axpy(alpha, &p, x.values_mut());
            axpy(-alpha, &q, &mut r);

            residual = relative(dot(comm, tag, &r, &r)?.sqrt(), b_norm);
            if !residual.is_finite() {
                return Ok(KernelOutcome::Failed {
                    iterations: it,
                    residual,
                    reason: "non-finite residual".into(),
                });
            }
            if residual <= config.tolerance {
                return Ok(KernelOutcome::Converged {
                    iterations: it,
                    residual,
                });
            }

            op.precondition(config.preconditioner, &r, &mut z);
            let rz_new = dot(comm, tag, &r, &z)?;
            let beta = rz_new / rz;
            rz = rz_new;
            for (p, z) in p.iter_mut().zip(&z) {
                *p = z + beta * *p;
            }
        }

        Ok(KernelOutcome::Failed {
            iterations: config.max_iterations,
            residual,
            reason: format!("no convergence within {} iterations", config.max_iterations),
        })
    }
}

/// Right-preconditioned BiCGSTAB for non-symmetric systems.
#[derive(Copy, Clone, Debug, Default)]
pub struct BiCgStab;

impl Backend for BiCgStab {
    const NAME: &'static str = "bicgstab";
    const REQUIRED_FORM: MatrixForm = MatrixForm::Distributed;

    type Native<'m> = DistOperator<'m>;

    fn prepare<'m, C: Communicator>(
        &self,
        matrix: Assembled<'m>,
        comm: &C,
        tags: SolverCommTags,
    ) -> Result<Self::Native<'m>, MeshSolveError> {
        operator_from(Self::NAME, matrix, comm, tags)
    }

    fn kernel<C: Communicator>(
        &self,
        op: &Self::Native<'_>,
        rhs: &DistVector,
        x: &mut DistVector,
        config: &SolverConfig,
        comm: &C,
        tags: SolverCommTags,
    ) -> Result<KernelOutcome, MeshSolveError> {
        op.check_len("right-hand side", rhs.len())?;
        op.check_len("initial guess", x.len())?;
        let n = op.num_owned();
        let b = rhs.values();
        let tag = tags.reduce;
        let pc = config.preconditioner;

        let b_norm = dot(comm, tag, b, b)?.sqrt();
        if b_norm == 0.0 {
            x.values_mut().fill(0.0);
            return Ok(KernelOutcome::Converged {
                iterations: 0,
                residual: 0.0,
            });
        }

        let mut r = vec![0.0; n];
        op.apply(x.values(), &mut r, comm)?;
        for (r, b) in r.iter_mut().zip(b) {
            *r = b - *r;
        }
        let mut residual = relative(dot(comm, tag, &r, &r)?.sqrt(), b_norm);
        if residual <= config.tolerance {
            return Ok(KernelOutcome::Converged {
                iterations: 0,
                residual,
            });
        }

        let r_hat = r.clone();
        let (mut rho, mut alpha, mut omega) = (1.0, 1.0, 1.0);
        let mut p = vec![0.0; n];
        let mut v = vec![0.0; n];
        let mut p_hat = vec![0.0; n];
        let mut s_hat = vec![0.0; n];
        let mut t = vec![0.0; n];

        let failed = |it: usize, residual: f64, reason: &str| KernelOutcome::Failed {
            iterations: it,
            residual,
            reason: reason.to_string(),
        };

        for it in 1..=config.max_iterations {
            let rho_new = dot(comm, tag, &r_hat, &r)?;
            if rho_new.abs() < BREAKDOWN {
                return Ok(failed(it, residual, "breakdown: rho vanished"));
            }
            let beta = (rho_new / rho) * (alpha / omega);
            rho = rho_new;
            for ((p, r), v) in p.iter_mut().zip(&r).zip(&v) {
                *p = r + beta * (*p - omega * v);
            }

            op.precondition(pc, &p, &mut p_hat);
            op.apply(&p_hat, &mut v, comm)?;
            let rv = dot(comm, tag, &r_hat, &v)?;
            if rv.abs() < BREAKDOWN {
                return Ok(failed(it, residual, "breakdown: r̂·v vanished"));
            }
            alpha = rho / rv;

            // r becomes s = r - alpha v
            axpy(-alpha, &v, &mut r);
            let s_res = relative(dot(comm, tag, &r, &r)?.sqrt(), b_norm);
            if s_res <= config.tolerance {
                axpy(alpha, &p_hat, x.values_mut());
                return Ok(KernelOutcome::Converged {
                    iterations: it,
                    residual: s_res,
                });
            }

            op.precondition(pc, &r, &mut s_hat);
            op.apply(&s_hat, &mut t, comm)?;
            let tt = dot(comm, tag, &t, &t)?;
            if tt < BREAKDOWN {
                return Ok(failed(it, s_res, "breakdown: t vanished"));
            }
            omega = dot(comm, tag, &t, &r)? / tt;

            axpy(alpha, &p_hat, x.values_mut());
            axpy(omega, &s_hat, x.values_mut());
            axpy(-omega, &t, &mut r);

            residual = relative(dot(comm, tag, &r, &r)?.sqrt(), b_norm);
            if !residual.is_finite() {
                return Ok(failed(it, residual, "non-finite residual"));
            }
            if residual <= config.tolerance {
                return Ok(KernelOutcome::Converged {
                    iterations: it,
                    residual,
                });
            }
            if omega.abs() < BREAKDOWN {
                return Ok(failed(it, residual, "breakdown: omega vanished"));
            }
        }

        Ok(failed(
            config.max_iterations,
            residual,
            format!("no convergence within {} iterations", config.max_iterations).as_str(),
        ))
    }
}
