//! # Core Module
//!
//! Configuration and the error taxonomy shared by every feature.
//!
//! - **Version**: 1.1.0
//! - **Since**: 0.1.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 1.1.0: Add typed error taxonomy
//! - 1.0.0: Initial creation with config module

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{BackoffStrategy, Config, GateFailurePolicy, ImageSize, SizePreset};
pub use error::HeroError;
