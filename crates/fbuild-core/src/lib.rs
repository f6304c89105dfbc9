//! fbuild Core Library
//!
//! Ephemeral code-signing credential management for Flutter iOS release builds.

pub mod error;
pub mod executor;
pub mod models;
pub mod preflight;
pub mod signing;

pub use error::{FbuildError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
