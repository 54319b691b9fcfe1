//! Transport dispatch: read an image from, or write one to, any `ImageRef`.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use apptainer_core::config::RuntimeConfig;
use apptainer_core::error::{ApptainerError, Result};

use super::archive;
use super::credentials::Credentials;
use super::daemon::DockerDaemon;
use super::image::{write_image, OciImage};
use super::layout::{LayoutSelector, OciLayout};
use super::platform::Platform;
use super::progress::ProgressFactory;
use super::registry::RegistryClient;
use super::tarball;
use super::transport::ImageRef;
use crate::context::Context;

/// Per-call options for a transport. Never persisted.
#[derive(Clone)]
pub struct TransportOptions {
    pub platform: Platform,
    pub credentials: Option<Credentials>,
    pub auth_file: Option<PathBuf>,
    /// Plain HTTP and no certificate checks.
    pub insecure: bool,
    pub tmp_dir: Option<PathBuf>,
    /// `unix://` docker host.
    pub docker_host: Option<String>,
    pub user_agent: Option<String>,
    /// Registry host → mirror host.
    pub mirrors: HashMap<String, String>,
    pub progress: Option<Arc<dyn ProgressFactory>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            platform: Platform::host(),
            credentials: None,
            auth_file: None,
            insecure: false,
            tmp_dir: None,
            docker_host: None,
            user_agent: None,
            mirrors: HashMap::new(),
            progress: None,
        }
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("platform", &self.platform)
            .field("credentials", &self.credentials)
            .field("auth_file", &self.auth_file)
            .field("insecure", &self.insecure)
            .field("tmp_dir", &self.tmp_dir)
            .field("docker_host", &self.docker_host)
            .field("user_agent", &self.user_agent)
            .field("mirrors", &self.mirrors)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl TransportOptions {
    /// Options seeded from the registry section of `config`.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            insecure: config.registry.insecure,
            auth_file: config.registry.auth_file.clone(),
            mirrors: config.registry.mirrors.clone(),
            ..Default::default()
        }
    }
}

/// Read the image named by `reference`.
///
/// Library, ORAS and plain HTTP references name files rather than OCI
/// images; those go through the pull pipeline instead.
pub async fn fetch(ctx: &Context, reference: &ImageRef, opts: &TransportOptions) -> Result<OciImage> {
    ctx.check()?;
    let tmp_dir = opts.tmp_dir.as_deref();
    let owned_tmp = opts.tmp_dir.clone();
    let platform = opts.platform.clone();
    tracing::debug!(reference = %reference, transport = reference.transport().name(), "Fetching image");
    match reference {
        ImageRef::Registry(r) => {
            let client = RegistryClient::new(r, opts)?;
            let mirrored = r.clone().with_mirrors(&opts.mirrors);
            client.fetch(ctx, &mirrored, &opts.platform, tmp_dir).await
        }
        ImageRef::OciLayout { dir, selector } => {
            let (dir, selector, name) = (dir.clone(), selector.clone(), reference.to_string());
            ctx.blocking("oci layout read", move || {
                let layout = OciLayout::open(&dir)?;
                let resolved = layout.resolve(&selector, &platform)?;
                OciImage::from_layout(name, layout, resolved, None)
            })
            .await
        }
        ImageRef::OciArchive { path, tag } => {
            let (path, tag) = (path.clone(), tag.clone());
            ctx.blocking("oci archive read", move || {
                archive::read_oci_archive(&path, tag.as_deref(), &platform, owned_tmp.as_deref())
            })
            .await
        }
        ImageRef::DockerArchive { path, tag } => {
            let (path, tag) = (path.clone(), tag.clone());
            ctx.blocking("docker archive read", move || {
                archive::read_docker_archive(&path, tag.as_deref(), &platform, owned_tmp.as_deref())
            })
            .await
        }
        ImageRef::Tarball { path } => {
            let path = path.clone();
            ctx.blocking("tarball read", move || tarball::read_file(&path, None, owned_tmp.as_deref()))
                .await
        }
        ImageRef::DockerDaemon { name } => {
            DockerDaemon::from_env(opts.docker_host.as_deref())?
                .fetch(ctx, name, tmp_dir)
                .await
        }
        ImageRef::Library(_) | ImageRef::Oras(_) | ImageRef::Http { .. } => Err(ApptainerError::Unsupported(format!(
            "{} does not name an OCI image",
            reference
        ))),
    }
}

/// Write `image` to the destination named by `reference`.
pub async fn write(ctx: &Context, image: &OciImage, reference: &ImageRef, opts: &TransportOptions) -> Result<()> {
    ctx.check()?;
    tracing::debug!(reference = %reference, digest = %image.digest(), "Writing image");
    match reference {
        ImageRef::Registry(r) => {
            RegistryClient::new(r, opts)?.push(ctx, image, r).await?;
            Ok(())
        }
        ImageRef::OciLayout { dir, selector } => {
            let tag = match selector {
                LayoutSelector::Only => None,
                LayoutSelector::Tag(tag) => Some(tag.as_str()),
                LayoutSelector::Digest(d) => {
                    return Err(ApptainerError::InvalidInput(format!(
                        "cannot write to an OCI layout by digest ({})",
                        d
                    )))
                }
            };
            let layout = if OciLayout::is_layout(dir) {
                OciLayout::open(dir)?
            } else {
                OciLayout::create(dir)?
            };
            write_image(ctx, image, &layout, tag).await
        }
        ImageRef::OciArchive { path, tag } => archive::write_oci_archive(ctx, image, path, tag.as_deref()).await,
        ImageRef::DockerArchive { path, tag } => {
            archive::write_docker_archive(ctx, image, path, tag.as_deref()).await
        }
        ImageRef::Tarball { path } => tarball::write_file(ctx, image, path, None).await,
        ImageRef::DockerDaemon { name } => {
            DockerDaemon::from_env(opts.docker_host.as_deref())?
                .write(ctx, image, name, opts.tmp_dir.as_deref())
                .await
        }
        ImageRef::Library(_) => Err(ApptainerError::Unsupported(
            "writing images to the library service is not supported".to_string(),
        )),
        ImageRef::Oras(_) | ImageRef::Http { .. } => Err(ApptainerError::Unsupported(format!(
            "cannot write an OCI image to {}",
            reference
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layout::tests::write_test_image;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_layout_to_archive_to_layout() {
        let tmp = TempDir::new().unwrap();
        let src = OciLayout::create(&tmp.path().join("src")).unwrap();
        let digest = write_test_image(&src, b"layer", Some("v1"));
        let ctx = Context::background();
        let opts = TransportOptions::default();

        let image = fetch(&ctx, &ImageRef::parse(&format!("oci:{}:v1", src.root().display())).unwrap(), &opts)
            .await
            .unwrap();
        assert_eq!(image.digest(), &digest);

        let archive = ImageRef::parse(&format!("oci-archive:{}", tmp.path().join("a.tar").display())).unwrap();
        write(&ctx, &image, &archive, &opts).await.unwrap();
        let from_archive = fetch(&ctx, &archive, &opts).await.unwrap();
        assert_eq!(from_archive.digest(), &digest);

        let dst = ImageRef::parse(&format!("oci:{}:copy", tmp.path().join("dst").display())).unwrap();
        write(&ctx, &from_archive, &dst, &opts).await.unwrap();
        let copied = OciLayout::open(&tmp.path().join("dst")).unwrap();
        assert!(copied.contains_manifest(&digest));
    }

    #[tokio::test]
    async fn test_tarball_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let src = OciLayout::create(&tmp.path().join("src")).unwrap();
        write_test_image(&src, b"layer", None);
        let ctx = Context::background();
        let opts = TransportOptions::default();
        let image = fetch(&ctx, &ImageRef::parse(&format!("oci:{}", src.root().display())).unwrap(), &opts)
            .await
            .unwrap();

        let target = ImageRef::parse(&format!("docker-archive:{}", tmp.path().join("d.tar").display())).unwrap();
        write(&ctx, &image, &target, &opts).await.unwrap();
        let back = fetch(&ctx, &target, &opts).await.unwrap();
        assert_eq!(back.layers().len(), 1);
        assert_eq!(back.layers()[0].digest, image.layers()[0].digest);
    }

    #[tokio::test]
    async fn test_unsupported_directions() {
        let tmp = TempDir::new().unwrap();
        let src = OciLayout::create(&tmp.path().join("src")).unwrap();
        write_test_image(&src, b"layer", None);
        let ctx = Context::background();
        let opts = TransportOptions::default();
        let image = fetch(&ctx, &ImageRef::parse(&format!("oci:{}", src.root().display())).unwrap(), &opts)
            .await
            .unwrap();

        let library = ImageRef::parse("library://user/col/img:1").unwrap();
        assert!(matches!(
            write(&ctx, &image, &library, &opts).await,
            Err(ApptainerError::Unsupported(_))
        ));
        assert!(matches!(
            fetch(&ctx, &library, &opts).await,
            Err(ApptainerError::Unsupported(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_archive_reads_on_spawned_tasks() {
        let tmp = TempDir::new().unwrap();
        let src = OciLayout::create(&tmp.path().join("src")).unwrap();
        let digest = write_test_image(&src, b"layer", None);
        let ctx = Context::background();
        let opts = TransportOptions::default();
        let image = fetch(&ctx, &ImageRef::parse(&format!("oci:{}", src.root().display())).unwrap(), &opts)
            .await
            .unwrap();

        let targets = [
            format!("oci-archive:{}", tmp.path().join("o.tar").display()),
            format!("docker-archive:{}", tmp.path().join("d.tar").display()),
        ];
        let mut tasks = Vec::new();
        for target in &targets {
            let reference = ImageRef::parse(target).unwrap();
            write(&ctx, &image, &reference, &opts).await.unwrap();
            let (ctx, opts) = (ctx.clone(), opts.clone());
            tasks.push(tokio::spawn(async move { fetch(&ctx, &reference, &opts).await }));
        }
        for task in tasks {
            let fetched = task.await.unwrap().unwrap();
            assert_eq!(fetched.layers()[0].digest, image.layers()[0].digest);
        }
        assert_eq!(image.digest(), &digest);
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let ctx = Context::background();
        ctx.cancel();
        let err = fetch(&ctx, &ImageRef::parse("oci:/nonexistent").unwrap(), &TransportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApptainerError::TimeoutError(_)));
    }

    #[test]
    fn test_from_config() {
        let mut config = RuntimeConfig::default();
        config.registry.insecure = true;
        config
            .registry
            .mirrors
            .insert("docker.io".to_string(), "mirror.local".to_string());
        let opts = TransportOptions::from_config(&config);
        assert!(opts.insecure);
        assert_eq!(opts.mirrors.get("docker.io").map(String::as_str), Some("mirror.local"));
        assert!(format!("{:?}", opts).contains("mirror.local"));
    }
}
