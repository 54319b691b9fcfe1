//! Apptainer Core - Foundational Types
//!
//! Error types, digests, and runtime configuration shared by the
//! acquisition pipeline, the cgroups manager, and the fakeroot mapper.

pub mod config;
pub mod digest;
pub mod error;

// Re-export commonly used types
pub use config::{CacheConfig, CgroupsConfig, FakerootConfig, LibraryConfig, RegistryConfig, RuntimeConfig};
pub use digest::Digest;
pub use error::{ApptainerError, ErrorKind, Result};

/// Apptainer core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
