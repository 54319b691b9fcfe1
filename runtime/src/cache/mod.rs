//! Content-addressed image cache.
//!
//! Entries are keyed by `(namespace, digest)`:
//! - `library`, `oras`, `oci-sif`, `net`: one file per digest hex
//! - `oci-blob`: a single OCI layout shared by every cached image
//!
//! Every write goes through a reservation ([`CacheEntry`]) that is
//! verified and atomically finalized, or cleaned up on drop.

pub mod entry;
pub mod handle;

pub use entry::CacheEntry;
pub use handle::{CacheHandle, CacheItem, CleanOptions, CleanReport, Namespace};
