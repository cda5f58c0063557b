//! # callrelay-common
//!
//! Shared configuration, error handling, and validation used across all callrelay crates.
//! This is the foundation layer: no routing logic, just primitives and contracts.

pub mod config;
pub mod error;
pub mod validation;

pub use error::{RelayError, RelayResult};
