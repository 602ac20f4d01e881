//! Core types and utilities shared across hint-rs crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Configuration management with TOML support
//! - Logging initialization helpers

pub mod config;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use config::{CouplingKind, HintConfig, PermuteMode};
pub use error::{HintError, Result};
