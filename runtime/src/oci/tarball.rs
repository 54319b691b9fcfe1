//! `docker save` style tarballs.
//!
//! A tarball holds a `manifest.json` listing, per image, a config file, its
//! repo tags and the layer files in order. Reading turns one image into a
//! transient OCI layout; writing produces exactly one image per file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use super::image::{scratch_dir, OciImage};
use super::layout::{with_ref_name, LayoutSelector, OciLayout};
use super::platform::Platform;
use super::registry::OCI_MANIFEST;
use crate::archive::{extract_file, is_gzip, join_clean, ExtractOptions};
use crate::context::Context;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Ref name given to images written without an explicit tag.
pub const DEFAULT_TAG: &str = "image:latest";

const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TarballEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

impl TarballEntry {
    fn has_tag(&self, tag: &str) -> bool {
        let wanted = qualify_tag(tag);
        self.repo_tags
            .iter()
            .flatten()
            .any(|t| t == tag || qualify_tag(t) == wanted)
    }
}

/// `name` → `name:latest`; names with a tag are kept.
fn qualify_tag(tag: &str) -> String {
    let last = tag.rsplit('/').next().unwrap_or(tag);
    if last.contains(':') {
        tag.to_string()
    } else {
        format!("{}:latest", tag)
    }
}

/// Read one image out of a tarball file.
pub fn read_file(path: &Path, tag: Option<&str>, tmp_dir: Option<&Path>) -> Result<OciImage> {
    if !path.is_file() {
        return Err(ApptainerError::SourceMissing(format!(
            "tarball {} does not exist",
            path.display()
        )));
    }
    let scratch = scratch_dir(tmp_dir)?;
    let extracted = scratch.path().join("tar");
    extract_file(path, &extracted, &unprivileged_extract())?;
    read_dir(&extracted, tag, &format!("tarball:{}", path.display()), scratch)
}

/// Whether an extracted directory looks like a docker-save tarball.
pub fn is_tarball_dir(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file()
}

/// Build an image from an extracted tarball in `dir`.
///
/// Layer files are moved out of `dir` into a layout under `scratch`, which
/// the returned image owns.
pub fn read_dir(dir: &Path, tag: Option<&str>, reference: &str, scratch: TempDir) -> Result<OciImage> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let data = fs::read(&manifest_path).map_err(|_| {
        ApptainerError::ArchiveUnknown(format!("{}: no {} found", reference, MANIFEST_FILE))
    })?;
    let entries: Vec<TarballEntry> = serde_json::from_slice(&data).map_err(|e| {
        ApptainerError::ArchiveUnknown(format!("{}: invalid {}: {}", reference, MANIFEST_FILE, e))
    })?;

    let entry = match (tag, entries.as_slice()) {
        (Some(tag), _) => entries.iter().find(|e| e.has_tag(tag)).ok_or_else(|| {
            ApptainerError::NotFound(format!("tag {} not found in {}", tag, reference))
        })?,
        (None, [one]) => one,
        (None, []) => {
            return Err(ApptainerError::ArchiveUnknown(format!(
                "{}: {} lists no images",
                reference, MANIFEST_FILE
            )))
        }
        (None, many) => {
            return Err(ApptainerError::AmbiguousLayout(format!(
                "{} holds {} images; specify a tag",
                reference,
                many.len()
            )))
        }
    };

    let layout = OciLayout::create(&scratch.path().join("layout"))?;
    let config = fs::read(join_clean(dir, Path::new(&entry.config))).map_err(|e| {
        ApptainerError::OciImageError(format!("{}: missing config {}: {}", reference, entry.config, e))
    })?;
    let config_digest = layout.write_blob(&config)?;

    let mut imported: HashMap<&str, serde_json::Value> = HashMap::new();
    let mut layers = Vec::with_capacity(entry.layers.len());
    for name in &entry.layers {
        if let Some(desc) = imported.get(name.as_str()) {
            layers.push(desc.clone());
            continue;
        }
        let path = join_clean(dir, Path::new(name));
        let (digest, size, gzip) = inspect_layer(&path).map_err(|e| {
            ApptainerError::OciImageError(format!("{}: unreadable layer {}: {}", reference, name, e))
        })?;
        layout.import_blob(&path, &digest)?;
        let desc = serde_json::json!({
            "mediaType": if gzip { OCI_LAYER_GZIP } else { OCI_LAYER },
            "digest": digest.to_string(),
            "size": size,
        });
        imported.insert(name.as_str(), desc.clone());
        layers.push(desc);
    }

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": OCI_CONFIG,
            "digest": config_digest.to_string(),
            "size": config.len(),
        },
        "layers": layers,
    });
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let digest = layout.write_blob(&manifest_bytes)?;
    let descriptor = oci_spec::image::Descriptor::new(
        oci_spec::image::MediaType::ImageManifest,
        manifest_bytes.len() as i64,
        digest.to_string(),
    );
    let ref_name = entry
        .repo_tags
        .iter()
        .flatten()
        .next()
        .cloned()
        .unwrap_or_else(|| DEFAULT_TAG.to_string());
    layout.add_manifest(with_ref_name(descriptor, &ref_name))?;

    tracing::debug!(reference, digest = %digest, layers = layers.len(), "Converted tarball to OCI layout");
    let resolved = layout.resolve(&LayoutSelector::Digest(digest), &Platform::host())?;
    OciImage::from_layout(reference, layout, resolved, Some(scratch))
}

fn inspect_layer(path: &Path) -> std::io::Result<(Digest, u64, bool)> {
    let mut head = [0u8; 2];
    let mut file = File::open(path)?;
    let n = file.read(&mut head)?;
    let size = file.metadata()?.len();
    let digest = Digest::of_path(path).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok((digest, size, is_gzip(&head[..n])))
}

/// Write `image` as a single-image tarball at `path`.
pub async fn write_file(ctx: &Context, image: &OciImage, path: &Path, tag: Option<&str>) -> Result<()> {
    let scratch = scratch_dir(path.parent())?;

    let config_name = format!("{}.json", Digest::parse(image.config_descriptor().digest())?.hex());
    let config_path = scratch.path().join(&config_name);
    fs::write(&config_path, image.config_bytes())?;

    let mut layer_files = Vec::with_capacity(image.layers().len());
    for layer in image.layers() {
        let name = if layer.is_gzip() {
            format!("{}.tar.gz", layer.digest.hex())
        } else {
            format!("{}.tar", layer.digest.hex())
        };
        let local = scratch.path().join(&name);
        if !local.exists() {
            image.copy_blob(ctx, &layer.descriptor, &local).await?;
        }
        layer_files.push((name, local));
    }

    let entry = TarballEntry {
        config: config_name.clone(),
        repo_tags: Some(vec![qualify_tag(tag.unwrap_or(DEFAULT_TAG))]),
        layers: layer_files.iter().map(|(n, _)| n.clone()).collect(),
    };
    let manifest = serde_json::to_vec(&vec![entry])?;

    let staged = crate::fs::sibling_temp_path(path, "tmp");
    let written = (|| -> std::io::Result<()> {
        let mut builder = tar::Builder::new(File::create(&staged)?);
        builder.append_path_with_name(&config_path, &config_name)?;
        let mut seen = std::collections::HashSet::new();
        for (name, local) in &layer_files {
            if seen.insert(name.clone()) {
                builder.append_path_with_name(local, name)?;
            }
        }
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, MANIFEST_FILE, manifest.as_slice())?;
        builder.into_inner()?.sync_all()?;
        fs::rename(&staged, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&staged);
        return Err(ApptainerError::IoError(std::io::Error::new(
            e.kind(),
            format!("failed to write tarball {}: {}", path.display(), e),
        )));
    }
    tracing::info!(path = %path.display(), digest = %image.digest(), "Wrote image tarball");
    Ok(())
}

/// Extraction settings for image archives: never take ownership from headers.
pub(crate) fn unprivileged_extract() -> ExtractOptions {
    ExtractOptions {
        preserve_owner: Some(false),
        xattr_best_effort: true,
        ..Default::default()
    }
}
