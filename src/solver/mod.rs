//! Linear solve orchestration over interchangeable backends.
//!
//! [`Solver`] owns the backend-independent part of a solve: precondition
//! checks, bringing the matrix into the form the backend asks for, moving the
//! right-hand side and initial guess into the non-overlapping numbering, and
//! importing the result back onto every rank's overlapping cells. A
//! [`Backend`] supplies only the native-matrix construction and the numerical
//! kernel.
//!
//! `solve` is collective: every rank calls it with the same backend type and
//! matrix form. Kernels make every decision from globally reduced values, so
//! all ranks reach the same terminal state.
//!
//! ```
//! use mesh_linsolve::prelude::*;
//!
//! let comm = NoComm;
//! let partition = CellPartition::serial(1);
//! let exchange = VectorExchange::new(&partition, &comm)?;
//! let mut a = Matrix::distributed(&partition);
//! a.add_to(0, 0, 2.0)?;
//! a.finalize(&comm)?;
//!
//! let mut solver = Solver::new(ConjugateGradient, SolverConfig::default())?;
//! let mut x = vec![0.0];
//! let report = solver.solve(&a, &[4.0], &mut x, &exchange, &comm)?;
//! assert_eq!(x, vec![2.0]);
//! assert_eq!(report.state, SolverState::Solved);
//! # Ok::<(), MeshSolveError>(())
//! ```

pub mod config;
pub mod krylov;
pub mod lu;

use std::borrow::Cow;

pub use config::{Preconditioner, SolverConfig};
pub use krylov::{BiCgStab, ConjugateGradient, DistOperator};
pub use lu::RedundantLu;

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags, all_reduce_max};
use crate::data::exchange::VectorExchange;
use crate::data::matrix::{DistributedMatrix, LegacyMatrix, Matrix, MatrixForm};
use crate::data::vector::DistVector;
use crate::mesh_error::MeshSolveError;
use crate::topology::partition::CellPartition;

/// Communication tags used during a solve.
#[derive(Copy, Clone, Debug)]
pub struct SolverCommTags {
    pub agree: CommTag,
    pub reduce: CommTag,
    pub gather: CommTag,
    pub halo: ExchangeTags,
}

impl SolverCommTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            agree: base,
            reduce: base.offset(1),
            gather: base.offset(2),
            halo: ExchangeTags::from_base(base.offset(3)),
        }
    }
}

impl Default for SolverCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0x5400))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SolverState {
    Configured,
    Assembling,
    Solving,
    Exchanging,
    Solved,
    Failed,
}

/// Matrix in the form a backend asked for.
#[derive(Debug)]
pub enum Assembled<'m> {
    Legacy(Cow<'m, LegacyMatrix>),
    Distributed(Cow<'m, DistributedMatrix>),
}

/// What a kernel reports back. `residual` is relative: `||b - Ax|| / ||b||`.
#[derive(Clone, Debug, PartialEq)]
pub enum KernelOutcome {
    Converged {
        iterations: usize,
        residual: f64,
    },
    Failed {
        iterations: usize,
        residual: f64,
        reason: String,
    },
}

/// Outcome of a successful solve.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveReport {
    pub backend: &'static str,
    pub state: SolverState,
    pub iterations: usize,
    pub residual: f64,
    /// The legacy → distributed slow path ran.
    pub converted_legacy: bool,
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::RedundantLu {}
    impl Sealed for super::ConjugateGradient {}
    impl Sealed for super::BiCgStab {}
}

/// A numerical backend. Implemented only by the backends in this module.
///
/// There is no abstract solver to instantiate:
///
/// ```compile_fail
/// use mesh_linsolve::solver::{Backend, Solver, SolverConfig};
/// let s: Solver<dyn Backend> = Solver::new(todo!(), SolverConfig::default()).unwrap();
/// ```
///
/// and outside types cannot become backends, with or without a kernel:
///
/// ```compile_fail
/// use mesh_linsolve::solver::Backend;
/// struct NoKernel;
/// impl Backend for NoKernel {
///     const NAME: &'static str = "no-kernel";
/// }
/// ```
pub trait Backend: private::Sealed {
    const NAME: &'static str;
    const REQUIRED_FORM: MatrixForm;

    /// Backend-native operator built from the assembled matrix.
    type Native<'m>;

    /// Build the native operator. Collective.
    fn prepare<'m, C: Communicator>(
        &self,
        matrix: Assembled<'m>,
        comm: &C,
        tags: SolverCommTags,
    ) -> Result<Self::Native<'m>, MeshSolveError>;

    /// Solve `A x = rhs` starting from the contents of `x`. Collective.
    fn kernel<C: Communicator>(
        &self,
        native: &Self::Native<'_>,
        rhs: &DistVector,
        x: &mut DistVector,
        config: &SolverConfig,
        comm: &C,
        tags: SolverCommTags,
    ) -> Result<KernelOutcome, MeshSolveError>;
}

#[derive(Debug)]
pub struct Solver<B: Backend> {
    backend: B,
    config: SolverConfig,
    tags: SolverCommTags,
    state: SolverState,
    last_state: Option<SolverState>,
}

impl<B: Backend> Solver<B> {
    pub fn new(backend: B, config: SolverConfig) -> Result<Self, MeshSolveError> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            tags: SolverCommTags::default(),
            state: SolverState::Configured,
            last_state: None,
        })
    }

    pub fn with_comm_tags(mut self, tags: SolverCommTags) -> Self {
        self.tags = tags;
        self
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current state; `Configured` whenever no solve is running.
    pub fn state(&self) -> SolverState {
        self.state
    }

    /// Terminal state of the most recent solve, if any.
    pub fn last_state(&self) -> Option<SolverState> {
        self.last_state
    }

    fn enter(&mut self, next: SolverState) {
        log::trace!("{}: {:?} -> {:?}", B::NAME, self.state, next);
        self.state = next;
    }

    fn finish(&mut self, terminal: SolverState) {
        self.enter(terminal);
        self.last_state = Some(terminal);
        self.enter(SolverState::Configured);
    }

    /// Solve `matrix · solution = rhs`, both vectors in overlapping-local form.
    ///
    /// On success every entry of `solution`, ghosts included, holds the
    /// solved value. On failure `solution` is left untouched. Collective.
    pub fn solve<C: Communicator>(
        &mut self,
        matrix: &Matrix,
        rhs: &[f64],
        solution: &mut [f64],
        exchange: &VectorExchange<'_>,
        comm: &C,
    ) -> Result<SolveReport, MeshSolveError> {
        let result = self.run(matrix, rhs, solution, exchange, comm);
        match &result {
            Ok(_) => self.finish(SolverState::Solved),
            Err(_) => self.finish(SolverState::Failed),
        }
        result
    }

    fn run<C: Communicator>(
        &mut self,
        matrix: &Matrix,
        rhs: &[f64],
        solution: &mut [f64],
        exchange: &VectorExchange<'_>,
        comm: &C,
    ) -> Result<SolveReport, MeshSolveError> {
        let partition = exchange.partition();
        let local_err = check_preconditions(matrix, rhs, solution, partition).err();
        let any_err = all_reduce_max(
            comm,
            self.tags.agree,
            if local_err.is_some() { 1.0 } else { 0.0 },
        )?;
        if let Some(err) = local_err {
            return Err(err);
        }
        if any_err > 0.0 {
            return Err(MeshSolveError::CommError {
                neighbor: comm.rank(),
                source: "solve preconditions failed on another rank".into(),
            });
        }

        self.enter(SolverState::Assembling);
        let (assembled, converted_legacy) = match B::REQUIRED_FORM {
            MatrixForm::Distributed => {
                let (m, converted) = matrix.as_distributed(partition, comm)?;
                (Assembled::Distributed(m), converted)
            }
            MatrixForm::Legacy => {
                if matrix.form() == MatrixForm::Distributed {
                    log::debug!("{}: gathering distributed matrix into a replicated copy", B::NAME);
                }
                (Assembled::Legacy(matrix.as_replicated_legacy(partition, comm)?), false)
            }
        };
        let native = self.backend.prepare(assembled, comm, self.tags)?;
        let b = exchange.scatter_to_solve(rhs)?;
        let mut x = exchange.scatter_to_solve(solution)?;

        self.enter(SolverState::Solving);
        let outcome = self
            .backend
            .kernel(&native, &b, &mut x, &self.config, comm, self.tags)?;
        let (iterations, residual) = match outcome {
            KernelOutcome::Converged {
                iterations,
                residual,
            } => {
                log::debug!(
                    "{}: converged in {iterations} iterations, relative residual {residual:e}",
                    B::NAME
                );
                (iterations, residual)
            }
            KernelOutcome::Failed {
                iterations,
                residual,
                reason,
            } => {
                log::debug!("{}: failed after {iterations} iterations: {reason}", B::NAME);
                return Err(MeshSolveError::SolveFailed {
                    backend: B::NAME,
                    iterations,
                    residual,
                    reason,
                });
            }
        };

        self.enter(SolverState::Exchanging);
        exchange.import_from_solve(&x, solution, comm)?;

        Ok(SolveReport {
            backend: B::NAME,
            state: SolverState::Solved,
            iterations,
            residual,
            converted_legacy,
        })
    }
}

fn check_preconditions(
    matrix: &Matrix,
    rhs: &[f64],
    solution: &[f64],
    partition: &CellPartition,
) -> Result<(), MeshSolveError> {
    if !matrix.is_finalized() {
        return Err(MeshSolveError::MatrixNotFinalized);
    }
    let n = partition.overlapping_count();
    for (what, len) in [("right-hand side", rhs.len()), ("solution vector", solution.len())] {
        if len != n {
            return Err(MeshSolveError::LengthMismatch {
                what,
                expected: n,
                got: len,
            });
        }
    }
    Ok(())
}

/// Relative residual norm, defined as zero for a zero right-hand side.
pub(crate) fn relative(residual_norm: f64, rhs_norm: f64) -> f64 {
    if rhs_norm == 0.0 {
        0.0
    } else {
        residual_norm / rhs_norm
    }
}
