//! Persistence helpers.

pub mod checkpoint;
