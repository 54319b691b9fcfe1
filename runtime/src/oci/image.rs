//! In-memory view of a single OCI image and its blob backing.
//!
//! An [`OciImage`] is produced by every source transport. Its blobs either
//! live in an OCI layout on disk (a user directory, or a scratch layout the
//! image owns) or are fetched on demand from a remote. Scratch directories
//! are removed when the image is dropped.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_spec::image::{Descriptor, ImageManifest, MediaType};
use tempfile::TempDir;

use super::layout::{with_ref_name, OciLayout, ResolvedManifest};
use crate::context::Context;

/// Squashfs layer produced for OCI-SIF images.
pub const SQUASHFS_LAYER_MEDIA_TYPE: &str = "application/vnd.sylabs.image.layer.v1.squashfs";

/// Fetches blobs of a remote image into local files.
///
/// Implementations must verify the blob digest before returning.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch_blob(&self, ctx: &Context, descriptor: &Descriptor, dst: &Path) -> Result<()>;
}

/// One filesystem layer of an image.
#[derive(Debug, Clone)]
pub struct Layer {
    pub digest: Digest,
    /// Uncompressed digest from the config's `rootfs.diff_ids`.
    pub diff_id: Option<Digest>,
    pub size: u64,
    pub media_type: String,
    pub descriptor: Descriptor,
}

impl Layer {
    pub fn is_gzip(&self) -> bool {
        self.media_type.ends_with("+gzip") || self.media_type.ends_with(".tar.gzip")
    }

    pub fn is_squashfs(&self) -> bool {
        self.media_type == SQUASHFS_LAYER_MEDIA_TYPE
    }
}

enum Backing {
    Layout {
        layout: OciLayout,
        scratch: Option<TempDir>,
    },
    Remote {
        fetcher: Arc<dyn BlobFetcher>,
        scratch: TempDir,
    },
}

/// A resolved image: manifest, config and layers.
pub struct OciImage {
    reference: String,
    digest: Digest,
    manifest: ImageManifest,
    manifest_bytes: Vec<u8>,
    config_bytes: Vec<u8>,
    layers: Vec<Layer>,
    backing: Backing,
}

impl fmt::Debug for OciImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OciImage")
            .field("reference", &self.reference)
            .field("digest", &self.digest)
            .field("layers", &self.layers.len())
            .field("transient", &self.is_transient())
            .finish()
    }
}

impl OciImage {
    /// Image whose blobs are in `layout`. A `scratch` directory is kept
    /// alive (and removed) together with the image.
    pub fn from_layout(
        reference: impl Into<String>,
        layout: OciLayout,
        resolved: ResolvedManifest,
        scratch: Option<TempDir>,
    ) -> Result<Self> {
        let config_digest = Digest::parse(resolved.manifest.config().digest())?;
        let config_bytes = layout.read_blob(&config_digest)?;
        let layers = build_layers(&resolved.manifest, &config_bytes)?;
        Ok(Self {
            reference: reference.into(),
            digest: resolved.digest,
            manifest: resolved.manifest,
            manifest_bytes: resolved.bytes,
            config_bytes,
            layers,
            backing: Backing::Layout { layout, scratch },
        })
    }

    /// Image whose blobs are fetched on demand.
    pub fn from_remote(
        reference: impl Into<String>,
        manifest_bytes: Vec<u8>,
        config_bytes: Vec<u8>,
        fetcher: Arc<dyn BlobFetcher>,
        tmp_dir: Option<&Path>,
    ) -> Result<Self> {
        let digest = Digest::of_bytes(&manifest_bytes);
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| ApptainerError::OciImageError(format!("invalid manifest {}: {}", digest, e)))?;
        let config_digest = Digest::parse(manifest.config().digest())?;
        let actual = Digest::of_bytes(&config_bytes);
        if !actual.ct_eq(&config_digest) {
            return Err(ApptainerError::DigestMismatch {
                expected: config_digest.to_string(),
                actual: actual.to_string(),
            });
        }
        let layers = build_layers(&manifest, &config_bytes)?;
        Ok(Self {
            reference: reference.into(),
            digest,
            manifest,
            manifest_bytes,
            config_bytes,
            layers,
            backing: Backing::Remote {
                fetcher,
                scratch: scratch_dir(tmp_dir)?,
            },
        })
    }

    /// Manifest digest.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    pub fn manifest_media_type(&self) -> MediaType {
        self.manifest
            .media_type()
            .clone()
            .unwrap_or(MediaType::ImageManifest)
    }

    pub fn config_bytes(&self) -> &[u8] {
        &self.config_bytes
    }

    pub fn config_descriptor(&self) -> &Descriptor {
        self.manifest.config()
    }

    /// Layers in application order, bottom first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Whether the image owns a scratch directory.
    pub fn is_transient(&self) -> bool {
        match self.backing {
            Backing::Layout { ref scratch, .. } => scratch.is_some(),
            Backing::Remote { .. } => true,
        }
    }

    /// The backing layout, for images read from disk.
    pub fn layout(&self) -> Option<&OciLayout> {
        match self.backing {
            Backing::Layout { ref layout, .. } => Some(layout),
            Backing::Remote { .. } => None,
        }
    }

    /// Descriptor for the manifest itself.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            self.manifest_media_type(),
            self.manifest_bytes.len() as i64,
            self.digest.to_string(),
        )
    }

    /// Copy the blob described by `descriptor` to `dst`.
    pub async fn copy_blob(&self, ctx: &Context, descriptor: &Descriptor, dst: &Path) -> Result<()> {
        ctx.check()?;
        match self.backing {
            Backing::Layout { ref layout, .. } => {
                let digest = Digest::parse(descriptor.digest())?;
                let src = layout.blob_path(&digest);
                tokio::fs::copy(&src, dst).await.map_err(|e| {
                    ApptainerError::IoError(std::io::Error::new(
                        e.kind(),
                        format!("failed to copy blob {} from {}: {}", digest, src.display(), e),
                    ))
                })?;
                Ok(())
            }
            Backing::Remote { ref fetcher, .. } => fetcher.fetch_blob(ctx, descriptor, dst).await,
        }
    }

    /// Local path of a layer blob, fetching it into scratch space if remote.
    pub async fn layer_path(&self, ctx: &Context, layer: &Layer) -> Result<PathBuf> {
        match self.backing {
            Backing::Layout { ref layout, .. } => Ok(layout.blob_path(&layer.digest)),
            Backing::Remote {
                ref fetcher,
                ref scratch,
            } => {
                let path = scratch.path().join(layer.digest.hex());
                if !path.is_file() {
                    fetcher.fetch_blob(ctx, &layer.descriptor, &path).await?;
                }
                Ok(path)
            }
        }
    }

    /// Read-once stream of a layer as stored.
    pub async fn open_layer(&self, ctx: &Context, layer: &Layer) -> Result<File> {
        let path = self.layer_path(ctx, layer).await?;
        File::open(&path).map_err(|e| {
            ApptainerError::OciImageError(format!("failed to open layer {}: {}", layer.digest, e))
        })
    }

    /// Read-once stream of a layer with gzip compression removed.
    pub async fn open_layer_uncompressed(&self, ctx: &Context, layer: &Layer) -> Result<Box<dyn Read + Send>> {
        let mut reader = BufReader::new(self.open_layer(ctx, layer).await?);
        let gzip = layer.is_gzip() || crate::archive::is_gzip(reader.fill_buf()?);
        if gzip {
            Ok(Box::new(GzDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }
}

/// Store `image` into `layout` and index it, optionally under `ref_name`.
///
/// Blobs already present are not copied again; copied blobs are verified
/// before they become visible.
pub async fn write_image(ctx: &Context, image: &OciImage, layout: &OciLayout, ref_name: Option<&str>) -> Result<()> {
    crate::fs::ensure_dir(&layout.blobs_dir())?;

    let mut descriptors = vec![image.config_descriptor().clone()];
    descriptors.extend(image.layers().iter().map(|l| l.descriptor.clone()));
    for descriptor in &descriptors {
        let digest = Digest::parse(descriptor.digest())?;
        if layout.has_blob(&digest) {
            continue;
        }
        let staged = crate::fs::sibling_temp_path(&layout.blob_path(&digest), "dl");
        let copied = image.copy_blob(ctx, descriptor, &staged).await;
        if let Err(e) = copied.and_then(|_| layout.import_blob(&staged, &digest)) {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }
        tracing::debug!(digest = %digest, layout = %layout.root().display(), "Stored blob");
    }

    let written = layout.write_blob(image.manifest_bytes())?;
    if written != *image.digest() {
        return Err(ApptainerError::DigestMismatch {
            expected: image.digest().to_string(),
            actual: written.to_string(),
        });
    }
    let descriptor = match ref_name {
        Some(name) => with_ref_name(image.descriptor(), name),
        None => image.descriptor(),
    };
    layout.add_manifest(descriptor)
}

fn build_layers(manifest: &ImageManifest, config_bytes: &[u8]) -> Result<Vec<Layer>> {
    let diff_ids = diff_ids(config_bytes);
    manifest
        .layers()
        .iter()
        .enumerate()
        .map(|(i, d)| {
            Ok(Layer {
                digest: Digest::parse(d.digest())?,
                diff_id: diff_ids.get(i).cloned(),
                size: u64::try_from(d.size()).unwrap_or(0),
                media_type: d.media_type().to_string(),
                descriptor: d.clone(),
            })
        })
        .collect()
}

/// `rootfs.diff_ids` of a config; configs without one (ORAS `{}`) yield none.
fn diff_ids(config_bytes: &[u8]) -> Vec<Digest> {
    let Ok(config) = serde_json::from_slice::<serde_json::Value>(config_bytes) else {
        return Vec::new();
    };
    config["rootfs"]["diff_ids"]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| Digest::parse(s).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn scratch_dir(tmp_dir: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("apptainer-image-");
    match tmp_dir {
        Some(dir) => builder.tempdir_in(dir),
        None => builder.tempdir(),
    }
    .map_err(|e| {
        ApptainerError::IoError(std::io::Error::new(
            e.kind(),
            format!("failed to create temporary directory: {}", e),
        ))
    })
}
