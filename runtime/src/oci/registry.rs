//! OCI registry client for pulling and pushing images.
//!
//! Uses the `oci-distribution` crate to talk to container registries
//! (Docker Hub, GHCR, ORAS-capable registries, ...). Manifests are fetched
//! raw so that their digest is computed over the exact bytes served; blobs
//! are streamed to disk through a progress writer and verified afterwards.

use std::path::Path;
use std::sync::Arc;

use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer, PushResponse};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};
use tokio::io::AsyncWriteExt;

use super::credentials::{credential_store, resolve_credentials, Credentials};
use super::image::{BlobFetcher, OciImage};
use super::platform::{select_manifest, Platform};
use super::progress::{ProgressFactory, ProgressWriter};
use super::reference::ImageReference;
use super::source::TransportOptions;
use crate::context::Context;

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

const ACCEPTED_MANIFESTS: [&str; 4] = [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST];

/// Result of a successful image push.
#[derive(Debug, Clone)]
pub struct PushResult {
    /// URL of the pushed config blob.
    pub config_url: String,
    /// URL of the pushed manifest.
    pub manifest_url: String,
}

/// A single-manifest pull result, before blobs are fetched.
#[derive(Debug, Clone)]
pub struct RemoteManifest {
    pub digest: Digest,
    pub bytes: Vec<u8>,
    pub manifest: ImageManifest,
}

/// Client bound to one registry and one set of credentials.
#[derive(Clone)]
pub struct RegistryClient {
    client: Arc<Client>,
    auth: RegistryAuth,
    registry: String,
    progress: Option<Arc<dyn ProgressFactory>>,
}

impl RegistryClient {
    /// Client for the registry of `reference`, with credentials resolved
    /// from `opts`, the auth file, then the credential store.
    pub fn new(reference: &ImageReference, opts: &TransportOptions) -> Result<Self> {
        let store = credential_store();
        let credentials = resolve_credentials(
            &reference.registry,
            opts.credentials.as_ref(),
            opts.auth_file.as_deref(),
            store.as_ref(),
            |k| std::env::var(k).ok(),
        )?;
        Ok(Self::with_credentials(&reference.registry, &credentials, opts))
    }

    pub fn with_credentials(registry: &str, credentials: &Credentials, opts: &TransportOptions) -> Self {
        let config = ClientConfig {
            protocol: if opts.insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: opts.insecure,
            ..Default::default()
        };
        tracing::debug!(registry, credentials = ?credentials, insecure = opts.insecure, "Registry client");
        Self {
            client: Arc::new(Client::new(config)),
            auth: credentials.to_oci_auth(),
            registry: registry.to_string(),
            progress: opts.progress.clone(),
        }
    }

    fn error(&self, message: String) -> ApptainerError {
        ApptainerError::RegistryError {
            registry: self.registry.clone(),
            message,
        }
    }

    /// Fetch manifest bytes as served, checking a digest if one was requested.
    pub async fn pull_manifest_raw(&self, ctx: &Context, oci_ref: &Reference) -> Result<(Vec<u8>, Digest)> {
        let (bytes, _) = ctx
            .run("manifest pull", async {
                self.client
                    .pull_manifest_raw(oci_ref, &self.auth, &ACCEPTED_MANIFESTS)
                    .await
                    .map_err(|e| self.error(format!("failed to pull manifest {}: {}", oci_ref, e)))
            })
            .await?;
        let digest = Digest::of_bytes(&bytes);
        if let Some(wanted) = oci_ref.digest() {
            let wanted = Digest::parse(wanted)?;
            if !digest.ct_eq(&wanted) {
                return Err(ApptainerError::DigestMismatch {
                    expected: wanted.to_string(),
                    actual: digest.to_string(),
                });
            }
        }
        Ok((bytes, digest))
    }

    /// Resolve `reference` to a single image manifest for `platform`.
    ///
    /// Index entries for attestations (`unknown/unknown`) are never chosen.
    pub async fn resolve_manifest(
        &self,
        ctx: &Context,
        reference: &ImageReference,
        platform: &Platform,
    ) -> Result<RemoteManifest> {
        let oci_ref = reference.to_oci_reference();
        let (mut bytes, mut digest) = self.pull_manifest_raw(ctx, &oci_ref).await?;

        if is_index_document(&bytes) {
            let index: ImageIndex = serde_json::from_slice(&bytes)
                .map_err(|e| self.error(format!("invalid image index {}: {}", digest, e)))?;
            let chosen = select_manifest(index.manifests(), platform).ok_or_else(|| {
                ApptainerError::ManifestNotFound {
                    reference: reference.to_string(),
                    platform: platform.to_string(),
                }
            })?;
            tracing::debug!(
                reference = %reference,
                platform = %platform,
                digest = %chosen.digest(),
                "Selected manifest from index"
            );
            let by_digest = Reference::with_digest(
                oci_ref.registry().to_string(),
                oci_ref.repository().to_string(),
                chosen.digest().clone(),
            );
            (bytes, digest) = self.pull_manifest_raw(ctx, &by_digest).await?;
        }

        let manifest: ImageManifest = serde_json::from_slice(&bytes)
            .map_err(|e| self.error(format!("invalid manifest {}: {}", digest, e)))?;
        Ok(RemoteManifest { digest, bytes, manifest })
    }

    /// Stream one blob to `dst` and verify its digest.
    pub async fn pull_blob_to(&self, ctx: &Context, oci_ref: &Reference, descriptor: &Descriptor, dst: &Path) -> Result<()> {
        let expected = Digest::parse(descriptor.digest())?;
        let result = ctx
            .run("blob download", async {
                let file = tokio::fs::File::create(dst).await?;
                let size = u64::try_from(descriptor.size()).ok();
                let mut writer = ProgressWriter::new(file, self.progress.as_deref(), descriptor.digest(), size);
                self.client
                    .pull_blob(oci_ref, &to_oci_descriptor(descriptor), &mut writer)
                    .await
                    .map_err(|e| self.error(format!("failed to pull blob {}: {}", expected, e)))?;
                writer.flush().await?;
                writer.complete();
                Ok::<_, ApptainerError>(())
            })
            .await
            .and_then(|_| {
                let actual = Digest::of_path(dst)?;
                if actual.ct_eq(&expected) {
                    Ok(())
                } else {
                    Err(ApptainerError::DigestMismatch {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    })
                }
            });
        if result.is_err() {
            let _ = std::fs::remove_file(dst);
        }
        result
    }

    /// Pull an image for `platform`. Blobs are fetched lazily.
    pub async fn fetch(
        &self,
        ctx: &Context,
        reference: &ImageReference,
        platform: &Platform,
        tmp_dir: Option<&Path>,
    ) -> Result<OciImage> {
        tracing::info!(reference = %reference, platform = %platform, "Pulling image from registry");
        let remote = self.resolve_manifest(ctx, reference, platform).await?;

        let config_desc = remote.manifest.config().clone();
        let mut config = Vec::new();
        ctx.run("config pull", async {
            self.client
                .pull_blob(&reference.to_oci_reference(), &to_oci_descriptor(&config_desc), &mut config)
                .await
                .map_err(|e| self.error(format!("failed to pull config blob: {}", e)))
        })
        .await?;

        let fetcher = Arc::new(RegistryBlobs {
            client: self.clone(),
            reference: reference.to_oci_reference(),
        });
        let image = OciImage::from_remote(reference.to_string(), remote.bytes, config, fetcher, tmp_dir)?;
        tracing::info!(reference = %reference, digest = %image.digest(), "Resolved image manifest");
        Ok(image)
    }

    /// Push `image` under `reference`.
    pub async fn push(&self, ctx: &Context, image: &OciImage, reference: &ImageReference) -> Result<PushResult> {
        tracing::info!(reference = %reference, digest = %image.digest(), "Pushing image to registry");
        let scratch = super::image::scratch_dir(None)?;

        let mut layers = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            let path = scratch.path().join(layer.digest.hex());
            image.copy_blob(ctx, &layer.descriptor, &path).await?;
            let data = tokio::fs::read(&path).await?;
            tracing::debug!(digest = %layer.digest, size = data.len(), "Read layer for push");
            layers.push(ImageLayer::new(data, layer.media_type.clone(), None));
        }
        let config = Config::new(
            image.config_bytes().to_vec(),
            image.config_descriptor().media_type().to_string(),
            None,
        );
        let manifest: OciImageManifest = serde_json::from_slice(image.manifest_bytes())
            .map_err(|e| ApptainerError::OciImageError(format!("invalid manifest: {}", e)))?;

        self.push_parts(ctx, reference, &layers, config, Some(manifest)).await
    }

    /// Push pre-built layers and config; a manifest is generated if absent.
    pub async fn push_parts(
        &self,
        ctx: &Context,
        reference: &ImageReference,
        layers: &[ImageLayer],
        config: Config,
        manifest: Option<OciImageManifest>,
    ) -> Result<PushResult> {
        let oci_ref = reference.to_oci_reference();
        let response: PushResponse = ctx
            .run("image push", async {
                self.client
                    .push(&oci_ref, layers, config, &self.auth, manifest)
                    .await
                    .map_err(|e| self.error(format!("failed to push image: {}", e)))
            })
            .await?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Image pushed successfully"
        );
        Ok(PushResult {
            config_url: response.config_url,
            manifest_url: response.manifest_url,
        })
    }
}

/// Blob access for an image pulled from a registry.
struct RegistryBlobs {
    client: RegistryClient,
    reference: Reference,
}

#[async_trait]
impl BlobFetcher for RegistryBlobs {
    async fn fetch_blob(&self, ctx: &Context, descriptor: &Descriptor, dst: &Path) -> Result<()> {
        tracing::debug!(digest = %descriptor.digest(), size = descriptor.size(), "Pulling blob");
        self.client.pull_blob_to(ctx, &self.reference, descriptor, dst).await
    }
}

pub(crate) fn to_oci_descriptor(descriptor: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: descriptor.media_type().to_string(),
        digest: descriptor.digest().clone(),
        size: descriptor.size(),
        ..Default::default()
    }
}

/// Whether manifest bytes hold an index rather than an image manifest.
pub(crate) fn is_index_document(bytes: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return false;
    };
    match value.get("mediaType").and_then(|m| m.as_str()) {
        Some(OCI_INDEX) | Some(DOCKER_MANIFEST_LIST) => true,
        Some(_) => false,
        None => value.get("manifests").is_some() && value.get("layers").is_none(),
    }
}
