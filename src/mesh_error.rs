//! MeshSolveError: Unified error type for mesh-linsolve public APIs
//!
//! Every fallible operation in the crate returns this type. Configuration
//! errors and precondition violations are surfaced as distinct variants so
//! callers can tell them apart from backend solve failures.

use thiserror::Error;

/// Unified error type for mesh-linsolve operations.
#[derive(Debug, Error)]
pub enum MeshSolveError {
    /// Two overlapping-local entries carry the same mesh cell id.
    #[error("partition error: cell id {0} appears more than once on this rank")]
    DuplicateCellId(u64),
    /// A cell was claimed as owned by more than one rank.
    #[error("partition error: cell id {cell} is owned by ranks {first} and {second}")]
    DuplicateOwnership { cell: u64, first: usize, second: usize },
    /// A cell names an owning rank outside the process group.
    #[error("partition error: cell id {cell} names owner rank {owner}, but the group has {size} ranks")]
    OwnerOutOfRange { cell: u64, owner: usize, size: usize },
    /// A ghost cell whose declared owner does not own it.
    #[error("partition error: ghost cell id {cell} is not owned by its declared owner rank {owner}")]
    GhostWithoutOwner { cell: u64, owner: usize },
    /// Two buffers that must agree in length do not.
    #[error("length mismatch for {what}: expected {expected}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A row/column index outside the writable range.
    #[error("index ({row}, {col}) out of bounds for dimension {dim}")]
    IndexOutOfBounds { row: usize, col: usize, dim: usize },
    /// A global index outside this rank's row range was used for an owned-row operation.
    #[error("global row {row} is not owned by rank {rank} (owned range {start}..{end})")]
    RowNotOwned {
        row: u64,
        rank: usize,
        start: u64,
        end: u64,
    },
    /// The matrix was handed to a solver before `finalize()`.
    #[error("matrix has pending writes; call finalize() before solving")]
    MatrixNotFinalized,
    /// A per-process legacy matrix cannot be reinterpreted as a row slice.
    #[error(
        "cannot convert a per-process legacy matrix to distributed form with {ranks} ranks active; \
         only replicated legacy matrices may be converted in parallel"
    )]
    LegacyConversionInParallel { ranks: usize },
    /// Solver configuration rejected at construction time.
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),
    /// The backend reported non-convergence or a numerical fault.
    #[error(
        "{backend} failed after {iterations} iterations (relative residual {residual:e}): {reason}"
    )]
    SolveFailed {
        backend: &'static str,
        iterations: usize,
        residual: f64,
        reason: String,
    },
    /// Communication failure with a neighbor.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A received buffer had the wrong byte length.
    #[error("buffer size mismatch with rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// Checkpoint blob failed to encode or decode.
    #[error("checkpoint codec error: {0}")]
    Checkpoint(String),
    /// Checkpoint file I/O failed on the coordinator.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshSolveError {
    /// True for the configuration/precondition class (fatal, never retried).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MeshSolveError::InvalidConfig(_)
                | MeshSolveError::LengthMismatch { .. }
                | MeshSolveError::MatrixNotFinalized
                | MeshSolveError::LegacyConversionInParallel { .. }
                | MeshSolveError::DuplicateCellId(_)
                | MeshSolveError::DuplicateOwnership { .. }
                | MeshSolveError::OwnerOutOfRange { .. }
                | MeshSolveError::GhostWithoutOwner { .. }
                | MeshSolveError::IndexOutOfBounds { .. }
                | MeshSolveError::RowNotOwned { .. }
        )
    }
}
