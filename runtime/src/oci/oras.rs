//! `oras://` transport: SIF files stored as single-layer OCI artifacts.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use oci_distribution::client::{Config, ImageLayer};
use oci_spec::image::{Descriptor, ImageManifest};

use super::reference::ImageReference;
use super::registry::{is_index_document, PushResult, RegistryClient};
use super::source::TransportOptions;
use crate::context::Context;
use crate::sif::ensure_sif;

pub const SIF_LAYER_MEDIA_TYPE: &str = "application/vnd.sylabs.sif.layer.v1.sif";
/// Misspelled type written by early clients; accepted on pull only.
pub const SIF_LAYER_MEDIA_TYPE_LEGACY: &str = "appliciation/vnd.sylabs.sif.layer.tar";
pub const SIF_CONFIG_MEDIA_TYPE: &str = "application/vnd.sylabs.sif.config.v1+json";

pub struct OrasClient {
    registry: RegistryClient,
}

impl OrasClient {
    pub fn new(reference: &ImageReference, opts: &TransportOptions) -> Result<Self> {
        Ok(Self {
            registry: RegistryClient::new(reference, opts)?,
        })
    }

    pub fn from_registry(registry: RegistryClient) -> Self {
        Self { registry }
    }

    /// The SIF layer of the artifact at `reference`.
    pub async fn resolve_sif(&self, ctx: &Context, reference: &ImageReference) -> Result<Descriptor> {
        let (bytes, digest) = self
            .registry
            .pull_manifest_raw(ctx, &reference.to_oci_reference())
            .await?;
        if is_index_document(&bytes) {
            return Err(ApptainerError::OrasNotASif(format!(
                "{} is an image index, not a SIF artifact",
                reference
            )));
        }
        let manifest: ImageManifest = serde_json::from_slice(&bytes).map_err(|e| {
            ApptainerError::OrasNotASif(format!("{}: invalid manifest {}: {}", reference, digest, e))
        })?;
        sif_layer(&manifest)
            .cloned()
            .ok_or_else(|| ApptainerError::OrasNotASif(format!("{} does not contain a single SIF layer", reference)))
    }

    /// Download the SIF layer `layer` to `dst` and make it executable.
    pub async fn download(&self, ctx: &Context, reference: &ImageReference, layer: &Descriptor, dst: &Path) -> Result<()> {
        tracing::info!(reference = %reference, digest = %layer.digest(), "Downloading SIF from OCI registry");
        self.registry
            .pull_blob_to(ctx, &reference.to_oci_reference(), layer, dst)
            .await?;
        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Resolve and download in one step; returns the layer digest.
    pub async fn pull(&self, ctx: &Context, reference: &ImageReference, dst: &Path) -> Result<Digest> {
        let layer = self.resolve_sif(ctx, reference).await?;
        self.download(ctx, reference, &layer, dst).await?;
        Digest::parse(layer.digest())
    }

    /// Push the SIF at `path` as an artifact.
    pub async fn push(&self, ctx: &Context, path: &Path, reference: &ImageReference) -> Result<PushResult> {
        ensure_sif(path)?;
        let data = tokio::fs::read(path).await?;
        tracing::info!(reference = %reference, size = data.len(), "Pushing SIF to OCI registry");
        let layer = ImageLayer::new(data, SIF_LAYER_MEDIA_TYPE.to_string(), None);
        let config = Config::new(b"{}".to_vec(), SIF_CONFIG_MEDIA_TYPE.to_string(), None);
        self.registry.push_parts(ctx, reference, &[layer], config, None).await
    }
}

/// The one SIF layer of `manifest`, if that is all it holds.
fn sif_layer(manifest: &ImageManifest) -> Option<&Descriptor> {
    match manifest.layers().as_slice() {
        [only] => {
            let media_type = only.media_type().to_string();
            (media_type == SIF_LAYER_MEDIA_TYPE || media_type == SIF_LAYER_MEDIA_TYPE_LEGACY).then_some(only)
        }
        _ => None,
    }
}
