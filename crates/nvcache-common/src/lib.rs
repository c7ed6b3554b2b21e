//! NVCache Common - Shared types and utilities
//!
//! This crate provides the error type, the engine configuration and the
//! page arithmetic used across all NVCache components.

pub mod config;
pub mod error;
pub mod types;

pub use config::NvCacheConfig;
pub use error::{Error, Result};
pub use types::*;
