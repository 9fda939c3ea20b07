//! txnrep Common - Shared types and utilities
//!
//! This crate provides the identifiers, error types, checksums and
//! configuration shared by the state manager and its tooling.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use config::{CheckpointConfig, ReplicationRetryConfig, StateManagerConfig};
pub use error::{Error, Result};
pub use types::*;
