//! Overlap module: rules for merging values that cross partition boundaries.

pub mod delta;
