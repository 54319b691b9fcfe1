//! OCI image acquisition.
//!
//! Images are read from, and written to, a set of transports:
//!
//! ```text
//!   docker://       registry (oci-distribution)
//!   oci:            OCI image layout directory
//!   oci-archive:    tar of an OCI layout
//!   docker-archive: `docker save` tar (or a tar of an OCI layout)
//!   docker-daemon:  Docker Engine API over its unix socket
//!   tarball:        single-image `docker save` tar
//!   oras://         SIF artifact in a registry (file, not an image)
//! ```
//!
//! Every transport produces an [`OciImage`]; the content cache stores
//! images in one shared layout keyed by manifest digest.

pub mod archive;
pub mod credentials;
pub mod daemon;
pub mod image;
pub mod layout;
pub mod oras;
pub mod platform;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod source;
pub mod tarball;
pub mod transport;

pub use credentials::{AuthFile, Credentials};
pub use image::{write_image, BlobFetcher, Layer, OciImage};
pub use layout::{LayoutSelector, OciLayout};
pub use oras::OrasClient;
pub use platform::Platform;
pub use progress::{IndicatifProgress, ProgressFactory, ProgressReporter, ProgressWriter};
pub use reference::ImageReference;
pub use registry::{PushResult, RegistryClient};
pub use source::{fetch, write, TransportOptions};
pub use transport::{parse_uri, ImageRef, Transport};
