//! CLI command implementations.

pub mod check;
pub mod config;
pub mod identifier;
pub mod ios;
