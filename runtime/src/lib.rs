//! Apptainer Runtime - image acquisition, cgroups, and fakeroot mapping.
//!
//! This crate provides the host-side pieces a container launch depends on:
//! pulling images from registries, layouts, archives, daemons and the
//! library service into a content-addressed cache; creating and
//! controlling cgroups through cgroupfs or systemd; and resolving
//! subordinate id ranges for fakeroot user namespaces.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod cache;
pub mod cgroups;
pub mod context;
pub mod fakeroot;
pub mod fs;
pub mod host_check;
pub mod library;
pub mod lock;
pub mod oci;
pub mod pull;
pub mod sif;

#[cfg(test)]
mod testutil;

// Re-export common types
pub use archive::{extract_archive, extract_file, ExtractOptions};
pub use cache::{CacheEntry, CacheHandle, CacheItem, CleanOptions, CleanReport, Namespace};
pub use cgroups::{check_rootless, CgroupDriver, CgroupManager, CgroupVersion, GateVerdict, ResourceSpec};
pub use context::Context;
pub use fakeroot::{gid_range, uid_range, FileSubidSource, IdMapping, SubidConfig, SubidEntry, SubidSource};
pub use host_check::{check_user_namespace_support, UserNamespaceSupport};
pub use library::{LibraryClient, LibraryRef};
pub use lock::FileLock;
pub use oci::{parse_uri, ImageRef, ImageReference, OrasClient, Platform, RegistryClient, Transport};
pub use pull::{pull_to_file, ImageConverter, ImagePuller, PullFlags, PullOutcome, SignatureVerifier};

/// Apptainer Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
