//! Image acquisition pipeline.
//!
//! Resolves a URI to a transport, fetches through the content cache so a
//! digest is downloaded at most once, then optionally verifies signatures
//! and converts the result for the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use apptainer_core::config::LibraryConfig;
use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use async_trait::async_trait;

use crate::cache::{CacheHandle, Namespace};
use crate::context::Context;
use crate::library::{stream_to_file, LibraryClient, LibraryRef};
use crate::oci::image::{scratch_dir, write_image, OciImage};
use crate::oci::layout::{LayoutSelector, OciLayout};
use crate::oci::oras::OrasClient;
use crate::oci::reference::ImageReference;
use crate::oci::source::{self, TransportOptions};
use crate::oci::transport::ImageRef;

/// Result of a pull. Unsigned images are still delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Pulled(PathBuf),
    Unsigned(PathBuf),
}

impl PullOutcome {
    pub fn path(&self) -> &Path {
        match self {
            PullOutcome::Pulled(p) | PullOutcome::Unsigned(p) => p,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, PullOutcome::Pulled(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullFlags {
    /// Check signatures with the configured verifier.
    pub verify: bool,
    /// Key material handed to the verifier.
    pub keys: Vec<PathBuf>,
    /// Unpack into a sandbox directory at the destination.
    pub to_sandbox: bool,
    /// Convert an OCI image into a single OCI-SIF file.
    pub to_oci_sif: bool,
    /// Overwrite an existing destination.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Signed,
    Unsigned,
}

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Errors mean a bad signature; an image without any signature is
    /// `Verification::Unsigned`.
    async fn verify(&self, ctx: &Context, path: &Path, keys: &[PathBuf]) -> Result<Verification>;
}

#[async_trait]
pub trait ImageConverter: Send + Sync {
    async fn sif_to_sandbox(&self, ctx: &Context, sif: &Path, dest: &Path) -> Result<()>;

    async fn layout_to_oci_sif(
        &self,
        ctx: &Context,
        layout: &Path,
        digest: &Digest,
        dest: &Path,
        workdir: &Path,
    ) -> Result<()>;

    async fn layout_to_sandbox(&self, _ctx: &Context, layout: &Path, digest: &Digest, _dest: &Path) -> Result<()> {
        Err(ApptainerError::Unsupported(format!(
            "cannot unpack {}@{} into a sandbox",
            layout.display(),
            digest
        )))
    }
}

/// What a transport left in the cache.
enum Fetched {
    File(PathBuf),
    Layout { root: PathBuf, digest: Digest },
}

impl Fetched {
    fn path(&self) -> &Path {
        match self {
            Fetched::File(p) => p,
            Fetched::Layout { root, .. } => root,
        }
    }
}

pub struct ImagePuller {
    cache: CacheHandle,
    library: LibraryConfig,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    converter: Option<Arc<dyn ImageConverter>>,
}

impl ImagePuller {
    pub fn new(cache: CacheHandle, library: LibraryConfig) -> Self {
        Self {
            cache,
            library,
            verifier: None,
            converter: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn ImageConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    /// Pull `uri`, delivering to `dest` when given.
    ///
    /// Without a destination the returned path points into the cache; for
    /// OCI sources that is the shared layout holding the image.
    pub async fn pull(
        &self,
        ctx: &Context,
        uri: &str,
        dest: Option<&Path>,
        opts: &TransportOptions,
        flags: &PullFlags,
    ) -> Result<PullOutcome> {
        let reference = ImageRef::parse(uri)?;
        self.pull_ref(ctx, &reference, dest, opts, flags).await
    }

    pub async fn pull_ref(
        &self,
        ctx: &Context,
        reference: &ImageRef,
        dest: Option<&Path>,
        opts: &TransportOptions,
        flags: &PullFlags,
    ) -> Result<PullOutcome> {
        if let Some(dest) = dest {
            check_destination(dest, flags.force)?;
        }
        tracing::info!(reference = %reference, cache = %self.cache.root().display(), "Pulling image");

        let fetched = match reference {
            ImageRef::Library(r) => Fetched::File(self.pull_library(ctx, r, opts).await?),
            ImageRef::Oras(r) => Fetched::File(self.pull_oras(ctx, r, opts).await?),
            ImageRef::Http { url } => Fetched::File(self.pull_http(ctx, url, opts).await?),
            _ => self.pull_oci(ctx, reference, opts).await?,
        };

        let verification = if flags.verify {
            let verifier = self.verifier.as_ref().ok_or_else(|| {
                ApptainerError::InvalidInput("signature verification requested but no verifier is configured".to_string())
            })?;
            verifier.verify(ctx, fetched.path(), &flags.keys).await?
        } else {
            Verification::Signed
        };

        let delivered = self.deliver(ctx, reference, &fetched, dest, opts, flags).await?;
        Ok(match verification {
            Verification::Signed => PullOutcome::Pulled(delivered),
            Verification::Unsigned => {
                tracing::warn!(reference = %reference, "Image is not signed");
                PullOutcome::Unsigned(delivered)
            }
        })
    }

    async fn pull_library(&self, ctx: &Context, reference: &LibraryRef, opts: &TransportOptions) -> Result<PathBuf> {
        let client = LibraryClient::for_ref(&self.library, reference)?.with_progress(opts.progress.clone());
        let arch = opts.platform.architecture.as_str();
        let image = client.get_image(ctx, reference, arch).await?;

        let mut entry = self.cache.reserve(Namespace::Library, &image.hash).await?;
        if entry.exists() {
            tracing::info!(reference = %reference, digest = %image.hash, "Using cached library image");
        } else {
            client.download_image(ctx, reference, arch, entry.tmp_path()).await?;
            entry = entry.commit(ctx).await?;
        }
        Ok(entry.path().to_path_buf())
    }

    async fn pull_oras(&self, ctx: &Context, reference: &ImageReference, opts: &TransportOptions) -> Result<PathBuf> {
        let client = OrasClient::new(reference, opts)?;
        let layer = client.resolve_sif(ctx, reference).await?;
        let digest = Digest::parse(layer.digest())?;

        let mut entry = self.cache.reserve(Namespace::Oras, &digest).await?;
        if entry.exists() {
            tracing::info!(reference = %reference, digest = %digest, "Using cached SIF artifact");
        } else {
            client.download(ctx, reference, &layer, entry.tmp_path()).await?;
            entry = entry.commit(ctx).await?;
        }
        Ok(entry.path().to_path_buf())
    }

    async fn pull_http(&self, ctx: &Context, url: &str, opts: &TransportOptions) -> Result<PathBuf> {
        let user_agent = opts
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("apptainer/{}", crate::VERSION));
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .danger_accept_invalid_certs(opts.insecure)
            .build()
            .map_err(|e| ApptainerError::Other(format!("failed to build HTTP client: {}", e)))?;

        let response = ctx
            .run("http request", async {
                client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ApptainerError::Other(format!("request to {} failed: {}", url, e)))
            })
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                404 => ApptainerError::NotFound(format!("{} not found", url)),
                401 | 403 => ApptainerError::PermissionDenied(format!("access to {} denied", url)),
                code => ApptainerError::Other(format!("{} returned HTTP {}", url, code)),
            });
        }

        let key = net_cache_key(url, response.headers());
        let entry = self.cache.reserve(Namespace::Net, &key).await?;
        if entry.exists() {
            tracing::info!(url, "Using cached download");
            return Ok(entry.path().to_path_buf());
        }
        let total = response.content_length();
        let dst = entry.tmp_path().to_path_buf();
        ctx.run(
            "http download",
            stream_to_file(response, &dst, opts.progress.as_deref(), url, total),
        )
        .await?;
        let entry = entry.commit(ctx).await?;
        Ok(entry.path().to_path_buf())
    }

    async fn pull_oci(&self, ctx: &Context, reference: &ImageRef, opts: &TransportOptions) -> Result<Fetched> {
        let image = source::fetch(ctx, reference, opts).await?;
        let digest = image.digest().clone();

        let mut entry = self.cache.reserve(Namespace::OciBlob, &digest).await?;
        if entry.exists() {
            tracing::info!(reference = %reference, digest = %digest, "Using cached image");
        } else {
            let staged = OciLayout::create(entry.tmp_path())?;
            write_image(ctx, &image, &staged, Some(&reference.to_string())).await?;
            entry = entry.commit(ctx).await?;
            tracing::info!(reference = %reference, digest = %digest, "Image cached");
        }
        Ok(Fetched::Layout {
            root: entry.path().to_path_buf(),
            digest,
        })
    }

    async fn deliver(
        &self,
        ctx: &Context,
        reference: &ImageRef,
        fetched: &Fetched,
        dest: Option<&Path>,
        opts: &TransportOptions,
        flags: &PullFlags,
    ) -> Result<PathBuf> {
        if flags.to_sandbox || flags.to_oci_sif {
            let dest = dest.ok_or_else(|| {
                ApptainerError::InvalidInput("image conversion needs a destination".to_string())
            })?;
            let converter = self.converter.as_ref().ok_or_else(|| {
                ApptainerError::Unsupported("no image converter is configured".to_string())
            })?;
            match fetched {
                Fetched::File(_) if flags.to_oci_sif => {
                    return Err(ApptainerError::InvalidInput(format!(
                        "{} is not an OCI image and cannot be converted to OCI-SIF",
                        reference
                    )))
                }
                Fetched::File(sif) => converter.sif_to_sandbox(ctx, sif, dest).await?,
                Fetched::Layout { root, digest } if flags.to_oci_sif => {
                    self.convert_oci_sif(ctx, converter.as_ref(), root, digest, dest, opts).await?
                }
                Fetched::Layout { root, digest } => converter.layout_to_sandbox(ctx, root, digest, dest).await?,
            }
            return Ok(dest.to_path_buf());
        }

        let Some(dest) = dest else {
            return Ok(fetched.path().to_path_buf());
        };
        match fetched {
            Fetched::File(path) => pull_to_file(path, dest, flags.force)?,
            Fetched::Layout { root, digest } => {
                let layout = OciLayout::open(root)?;
                let resolved = layout.resolve(&LayoutSelector::Digest(digest.clone()), &opts.platform)?;
                let image = OciImage::from_layout(reference.to_string(), layout, resolved, None)?;
                let target = if OciLayout::is_layout(dest) {
                    OciLayout::open(dest)?
                } else {
                    OciLayout::create(dest)?
                };
                write_image(ctx, &image, &target, None).await?;
            }
        }
        tracing::info!(reference = %reference, dest = %dest.display(), "Image delivered");
        Ok(dest.to_path_buf())
    }

    /// OCI-SIF conversions are cached by source manifest digest.
    async fn convert_oci_sif(
        &self,
        ctx: &Context,
        converter: &dyn ImageConverter,
        layout: &Path,
        digest: &Digest,
        dest: &Path,
        opts: &TransportOptions,
    ) -> Result<()> {
        let mut entry = self.cache.reserve(Namespace::OciSif, digest).await?;
        if !entry.exists() {
            let workdir = scratch_dir(opts.tmp_dir.as_deref())?;
            converter
                .layout_to_oci_sif(ctx, layout, digest, entry.tmp_path(), workdir.path())
                .await?;
            entry = entry.commit(ctx).await?;
        }
        crate::fs::copy_file_atomic(entry.path(), dest, 0o755)
    }
}

/// Copy a cached file to a user path, replacing it only when `force`.
pub fn pull_to_file(src: &Path, dst: &Path, force: bool) -> Result<()> {
    check_destination(dst, force)?;
    crate::fs::copy_file_atomic(src, dst, 0o755)?;
    tracing::debug!(src = %src.display(), dst = %dst.display(), "Copied image from cache");
    Ok(())
}

fn check_destination(dest: &Path, force: bool) -> Result<()> {
    if force || dest.symlink_metadata().is_err() || OciLayout::is_layout(dest) {
        return Ok(());
    }
    Err(ApptainerError::Conflict(format!(
        "{} already exists; use force to overwrite",
        dest.display()
    )))
}

/// Downloads are keyed by URL plus whatever validators the server sent.
fn net_cache_key(url: &str, headers: &reqwest::header::HeaderMap) -> Digest {
    let validator = |name: reqwest::header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let key = format!(
        "{}\n{}\n{}",
        url,
        validator(reqwest::header::ETAG),
        validator(reqwest::header::LAST_MODIFIED)
    );
    Digest::of_bytes(key.as_bytes())
}
