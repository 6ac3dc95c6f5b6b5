//! Common Infrastructure Module
//!
//! Shared error types for the bridge client.

pub mod error;

// Re-exports for convenience
pub use error::{BridgeError, Result};
