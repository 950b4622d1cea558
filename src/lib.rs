#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-linsolve
//!
//! mesh-linsolve turns a cell-centred discretization on a domain-decomposed
//! mesh into a solved linear system and scatters the result back onto the
//! mesh. It provides the partition descriptor that reconciles each rank's
//! overlapping (owned plus ghost) cells with a non-overlapping global
//! numbering, matrix representations in legacy and distributed form, vector
//! exchange between the two numberings, and a solver front end over
//! interchangeable backends.
//!
//! ## Features
//! - Explicit process-group handles: serial ([`NoComm`](algs::communicator::NoComm)),
//!   in-process threads ([`ThreadComm`](algs::communicator::ThreadComm)) and MPI
//!   (feature `mpi-support`)
//! - Collective ghost-row reduction and halo import with precomputed plans
//! - Sealed solver backends: redundant dense LU, distributed CG and BiCGSTAB
//! - Checkpoint blobs with single-coordinator I/O
//!
//! ## Collectives
//!
//! Every operation that touches another rank's data is collective: partition
//! construction, [`VectorExchange`](data::exchange::VectorExchange)
//! construction and import, distributed `finalize`, `to_legacy`, and
//! [`Solver::solve`](solver::Solver::solve). All ranks must call them in the
//! same order with matching shapes. A rank that skips one leaves its peers
//! blocked; this is the caller's obligation and is not detected at runtime.
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! mesh-linsolve = "0.3"
//! # features = ["mpi-support"]
//! ```

pub mod algs;
pub mod data;
pub mod io;
pub mod mesh_error;
pub mod overlap;
pub mod solver;
pub mod topology;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{CommTag, Communicator, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::data::exchange::VectorExchange;
    pub use crate::data::matrix::{DistributedMatrix, LegacyMatrix, Matrix, MatrixForm};
    pub use crate::data::row_layout::RowLayout;
    pub use crate::data::vector::DistVector;
    pub use crate::io::checkpoint::{
        TempCheckpoint, persist, read_checkpoint, read_temp_checkpoint, restore, write_checkpoint,
        write_temp_checkpoint,
    };
    pub use crate::mesh_error::MeshSolveError;
    pub use crate::overlap::delta::{AddDelta, CopyDelta, Delta};
    pub use crate::solver::{
        Backend, BiCgStab, ConjugateGradient, Preconditioner, RedundantLu, SolveReport, Solver,
        SolverConfig, SolverState,
    };
    pub use crate::topology::partition::CellPartition;
}
