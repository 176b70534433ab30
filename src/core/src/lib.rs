//! Skiff Core - shared error types for the skiff image copy tool.

pub mod error;

pub use error::{CopyError, Result};

/// Skiff version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
