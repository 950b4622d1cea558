//! Data module: row layouts, vectors, matrices and the vector exchange.

pub mod exchange;
pub mod matrix;
pub mod row_layout;
pub mod vector;

pub use exchange::VectorExchange;
pub use matrix::{DistributedMatrix, LegacyMatrix, Matrix, MatrixForm};
pub use row_layout::RowLayout;
pub use vector::DistVector;
