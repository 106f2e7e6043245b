//! spmd Common - Shared types and utilities
//!
//! This crate provides the error type, the API status wrapper, identifiers,
//! domain enums, checksums and configuration used by every spmd crate.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result, Status};
pub use types::*;
