//! Small dependency-free helpers shared across the crate.

pub mod bits;

pub use bits::Bits;
