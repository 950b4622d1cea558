//! Communication and exchange algorithms shared by the data structures.

pub mod communicator;
pub mod completion;
pub mod halo;
pub mod wire;

pub use halo::HaloPlan;
