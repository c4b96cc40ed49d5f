//! cainject core - shared types for injecting a CA into container images.
//!
//! Holds the error type, the run configuration and the trust-store tables
//! consumed by the runtime.

pub mod config;
pub mod error;

pub use config::{CustomLocation, InjectConfig, LogLevel, TrustStoreTables, NAME_PLACEHOLDER};
pub use error::{InjectError, Result};

/// cainject version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
