//! # Keystone Common
//!
//! Shared types, errors, and constants used across Keystone components.
//!
//! ## Modules
//! - `types` - Cluster state snapshot, settings, blocks, and the cluster identifier
//! - `error` - Common error types
//! - `constants` - Settings keys, task sources, and defaults

pub mod constants;
pub mod error;
pub mod types;

pub use error::KeystoneError;
pub use types::*;
