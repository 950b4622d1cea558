//! Direct backend: every rank factors the same replicated dense system.
//!
//! Suited to small systems and coarse problems; the work is repeated on every
//! rank so the result is identical everywhere without further communication.

use std::borrow::Cow;

use nalgebra::{DMatrix, DVector};

use crate::algs::communicator::{Communicator, allgather};
use crate::data::matrix::{LegacyMatrix, MatrixForm};
use crate::data::vector::DistVector;
use crate::mesh_error::MeshSolveError;
use crate::solver::{Assembled, Backend, KernelOutcome, SolverCommTags, SolverConfig, relative};

/// Dense LU with partial pivoting on a replicated copy of the global system.
#[derive(Copy, Clone, Debug, Default)]
pub struct RedundantLu;

impl Backend for RedundantLu {
    const NAME: &'static str = "redundant-lu";
    const REQUIRED_FORM: MatrixForm = MatrixForm::Legacy;

    type Native<'m> = Cow<'m, LegacyMatrix>;

    fn prepare<'m, C: Communicator>(
        &self,
        matrix: Assembled<'m>,
        _comm: &C,
        _tags: SolverCommTags,
    ) -> Result<Self::Native<'m>, MeshSolveError> {
        match matrix {
            Assembled::Legacy(m) => Ok(m),
            Assembled::Distributed(_) => Err(MeshSolveError::InvalidConfig(
                "redundant-lu needs a replicated legacy matrix".into(),
            )),
        }
    }

    fn kernel<C: Communicator>(
        &self,
        native: &Self::Native<'_>,
        rhs: &DistVector,
        x: &mut DistVector,
        _config: &SolverConfig,
        comm: &C,
        tags: SolverCommTags,
    ) -> Result<KernelOutcome, MeshSolveError> {
        let n = native.dimension();
        let b: Vec<f64> = allgather(comm, tags.gather, rhs.values())?
            .into_iter()
            .flatten()
            .collect();
        if b.len() != n {
            return Err(MeshSolveError::LengthMismatch {
                what: "gathered right-hand side",
                expected: n,
                got: b.len(),
            });
        }

        let Some(xg) = dense_solve(&native.to_dense(), &b, n) else {
            return Ok(KernelOutcome::Failed {
                iterations: 1,
                residual: f64::INFINITY,
                reason: "singular pivot".into(),
            });
        };

        let ax = native.matvec(&xg)?;
        let r_norm = ax.iter().zip(&b).map(|(a, b)| (b - a) * (b - a)).sum::<f64>().sqrt();
        let b_norm = b.iter().map(|v| v * v).sum::<f64>().sqrt();
        let residual = relative(r_norm, b_norm);
        if !residual.is_finite() {
            return Ok(KernelOutcome::Failed {
                iterations: 1,
                residual,
                reason: "non-finite solution".into(),
            });
        }

        let start = x.start() as usize;
        let len = x.len();
        x.values_mut().copy_from_slice(&xg[start..start + len]);
        Ok(KernelOutcome::Converged {
            iterations: 1,
            residual,
        })
    }
}

/// Solve a row-major `n × n` system; `None` when `U` has a zero pivot.
fn dense_solve(dense: &[f64], b: &[f64], n: usize) -> Option<Vec<f64>> {
    DMatrix::from_row_slice(n, n, dense)
        .lu()
        .solve(&DVector::from_column_slice(b))
        .map(|x| x.as_slice().to_vec())
}
