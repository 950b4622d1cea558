//! Decomposition of the mesh's cells across ranks.

pub mod partition;

pub use partition::CellPartition;
