//! Domain models for signing credential management.

pub mod signing;

pub use signing::*;
