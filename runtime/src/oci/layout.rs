//! OCI image layout directories (`oci-layout`, `index.json`, `blobs/sha256/`).
//!
//! Used both as a transport (`oci:DIR`) and as the storage format of the
//! shared `oci-blob` cache namespace.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use oci_spec::image::{Descriptor, ImageIndex, ImageIndexBuilder, ImageManifest, MediaType, SCHEMA_VERSION};

use super::platform::{select_manifest, Platform};
use crate::fs::{rename_or_copy, sibling_temp_path};
use crate::lock::FileLock;

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";
pub const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// How to pick one image out of a layout's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutSelector {
    /// The layout must hold exactly one image.
    Only,
    Digest(Digest),
    /// Matched against the `org.opencontainers.image.ref.name` annotation.
    Tag(String),
}

/// A manifest picked out of a layout.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub descriptor: Descriptor,
    pub digest: Digest,
    pub manifest: ImageManifest,
    pub bytes: Vec<u8>,
}

/// An OCI image layout on disk.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open an existing layout; `oci-layout` and `index.json` must exist.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(ApptainerError::SourceMissing(format!(
                "OCI layout directory {} does not exist",
                root.display()
            )));
        }
        for required in [OCI_LAYOUT_FILE, INDEX_FILE] {
            if !root.join(required).is_file() {
                return Err(ApptainerError::OciImageError(format!(
                    "not a valid OCI layout: missing {} in {}",
                    required,
                    root.display()
                )));
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Open `root` as a layout, initialising an empty one if needed.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("blobs").join("sha256")).map_err(|e| {
            ApptainerError::OciImageError(format!(
                "failed to create OCI layout {}: {}",
                root.display(),
                e
            ))
        })?;
        let layout = Self {
            root: root.to_path_buf(),
        };
        if !root.join(OCI_LAYOUT_FILE).exists() {
            write_atomic(&root.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT.as_bytes())?;
        }
        if !root.join(INDEX_FILE).exists() {
            layout.write_index(&empty_index()?)?;
        }
        Ok(layout)
    }

    /// Whether `dir` looks like a layout.
    pub fn is_layout(dir: &Path) -> bool {
        dir.join(OCI_LAYOUT_FILE).is_file() && dir.join(INDEX_FILE).is_file()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.algorithm()).join(digest.hex())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Read a blob and check that its content matches its digest.
    pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ApptainerError::NotFound(format!("blob {} in {}", digest, self.root.display()))
            } else {
                ApptainerError::IoError(e)
            }
        })?;
        let actual = Digest::of_bytes(&bytes);
        if !actual.ct_eq(digest) {
            return Err(ApptainerError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Store `bytes` as a blob, returning its digest.
    pub fn write_blob(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(bytes);
        let path = self.blob_path(&digest);
        if !path.is_file() {
            crate::fs::ensure_dir(&self.blobs_dir())?;
            write_atomic(&path, bytes)?;
        }
        Ok(digest)
    }

    /// Move a verified file into the blob store.
    pub fn import_blob(&self, src: &Path, digest: &Digest) -> Result<()> {
        let actual = Digest::of_path(src)?;
        if !actual.ct_eq(digest) {
            let _ = fs::remove_file(src);
            return Err(ApptainerError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        let dst = self.blob_path(digest);
        if dst.is_file() {
            let _ = fs::remove_file(src);
            return Ok(());
        }
        crate::fs::ensure_dir(&self.blobs_dir())?;
        rename_or_copy(src, &dst)
    }

    pub fn index(&self) -> Result<ImageIndex> {
        let path = self.root.join(INDEX_FILE);
        let content = fs::read(&path).map_err(|e| {
            ApptainerError::OciImageError(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&content).map_err(|e| {
            ApptainerError::OciImageError(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let content = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.root.join(INDEX_FILE), &content)
    }

    /// Add (or replace, by digest) a manifest entry in `index.json`.
    ///
    /// Serialized against other writers of the same layout.
    pub fn add_manifest(&self, descriptor: Descriptor) -> Result<()> {
        let _guard = FileLock::exclusive(&self.root.join(format!("{}.lock", INDEX_FILE)))?;
        let mut index = self.index()?;
        let mut manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|d| d.digest() != descriptor.digest())
            .cloned()
            .collect();

        // A ref name points at one image only.
        if let Some(name) = ref_name(&descriptor) {
            for d in manifests.iter_mut() {
                if ref_name(d) == Some(name) {
                    let mut annotations = d.annotations().clone().unwrap_or_default();
                    annotations.remove(REF_NAME_ANNOTATION);
                    d.set_annotations(if annotations.is_empty() {
                        None
                    } else {
                        Some(annotations)
                    });
                }
            }
        }
        manifests.push(descriptor);
        index.set_manifests(manifests);
        self.write_index(&index)
    }

    /// Whether the index references `digest`.
    pub fn contains_manifest(&self, digest: &Digest) -> bool {
        let wanted = digest.to_string();
        self.index()
            .map(|i| i.manifests().iter().any(|d| *d.digest() == wanted))
            .unwrap_or(false)
            && self.has_blob(digest)
    }

    /// Pick one image manifest out of the layout.
    pub fn resolve(&self, selector: &LayoutSelector, platform: &Platform) -> Result<ResolvedManifest> {
        let index = self.index()?;
        let entries = index.manifests();

        let chosen = match selector {
            LayoutSelector::Only => {
                let images: Vec<&Descriptor> = entries.iter().filter(|d| is_manifest(d)).collect();
                match (images.as_slice(), entries.as_slice()) {
                    ([one], _) => (*one).clone(),
                    ([], [only]) if is_index(only) => only.clone(),
                    ([], []) => {
                        return Err(ApptainerError::NotFound(format!(
                            "no images in OCI layout {}",
                            self.root.display()
                        )))
                    }
                    _ => {
                        return Err(ApptainerError::AmbiguousLayout(format!(
                            "{} holds {} entries; specify an image digest",
                            self.root.display(),
                            entries.len()
                        )))
                    }
                }
            }
            LayoutSelector::Digest(digest) => {
                let wanted = digest.to_string();
                match entries.iter().find(|d| *d.digest() == wanted) {
                    Some(d) => d.clone(),
                    None => self.find_nested(entries, &wanted)?.ok_or_else(|| {
                        ApptainerError::NotFound(format!(
                            "image {} not found in OCI layout {}",
                            digest,
                            self.root.display()
                        ))
                    })?,
                }
            }
            LayoutSelector::Tag(tag) => entries
                .iter()
                .find(|d| ref_name(d) == Some(tag.as_str()))
                .cloned()
                .ok_or_else(|| {
                    ApptainerError::NotFound(format!(
                        "tag {} not found in OCI layout {}",
                        tag,
                        self.root.display()
                    ))
                })?,
        };

        let descriptor = if is_index(&chosen) {
            self.select_from_index(&chosen, platform)?
        } else {
            chosen
        };
        self.load_manifest(descriptor)
    }

    fn select_from_index(&self, index_desc: &Descriptor, platform: &Platform) -> Result<Descriptor> {
        let digest = Digest::parse(index_desc.digest())?;
        let nested: ImageIndex = serde_json::from_slice(&self.read_blob(&digest)?)?;
        select_manifest(nested.manifests(), platform)
            .cloned()
            .ok_or_else(|| ApptainerError::ManifestNotFound {
                reference: format!("{}@{}", self.root.display(), digest),
                platform: platform.to_string(),
            })
    }

    fn find_nested(&self, entries: &[Descriptor], wanted: &str) -> Result<Option<Descriptor>> {
        for entry in entries.iter().filter(|d| is_index(d)) {
            let digest = Digest::parse(entry.digest())?;
            let Ok(bytes) = self.read_blob(&digest) else {
                continue;
            };
            let nested: ImageIndex = serde_json::from_slice(&bytes)?;
            if let Some(found) = nested.manifests().iter().find(|d| d.digest() == wanted) {
                return Ok(Some(found.clone()));
            }
        }
        Ok(None)
    }

    fn load_manifest(&self, descriptor: Descriptor) -> Result<ResolvedManifest> {
        let digest = Digest::parse(descriptor.digest())?;
        let bytes = self.read_blob(&digest)?;
        let manifest: ImageManifest = serde_json::from_slice(&bytes).map_err(|e| {
            ApptainerError::OciImageError(format!("invalid manifest {}: {}", digest, e))
        })?;
        Ok(ResolvedManifest {
            descriptor,
            digest,
            manifest,
            bytes,
        })
    }

    /// Move every blob and index entry of this layout into `dst`.
    ///
    /// Blobs already present in `dst` are kept; blobs are verified before
    /// they become visible. Index entries are added last.
    pub fn merge_into(&self, dst: &OciLayout) -> Result<()> {
        let blobs = self.blobs_dir();
        if blobs.is_dir() {
            for entry in fs::read_dir(&blobs)? {
                let entry = entry?;
                let name = entry.file_name();
                let Ok(digest) = Digest::from_hex(&name.to_string_lossy()) else {
                    tracing::debug!(file = ?name, "Ignoring non-blob file in layout");
                    continue;
                };
                dst.import_blob(&entry.path(), &digest)?;
            }
        }
        for descriptor in self.index()?.manifests() {
            dst.add_manifest(descriptor.clone())?;
        }
        Ok(())
    }
}

/// The `org.opencontainers.image.ref.name` of an index entry.
pub fn ref_name(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(String::as_str)
}

/// Attach a ref-name annotation to a descriptor.
pub fn with_ref_name(mut descriptor: Descriptor, name: &str) -> Descriptor {
    let mut annotations: HashMap<String, String> = descriptor.annotations().clone().unwrap_or_default();
    annotations.insert(REF_NAME_ANNOTATION.to_string(), name.to_string());
    descriptor.set_annotations(Some(annotations));
    descriptor
}

pub fn is_manifest(descriptor: &Descriptor) -> bool {
    match descriptor.media_type() {
        MediaType::ImageManifest => true,
        MediaType::Other(m) => m == DOCKER_MANIFEST_V2,
        _ => false,
    }
}

pub fn is_index(descriptor: &Descriptor) -> bool {
    match descriptor.media_type() {
        MediaType::ImageIndex => true,
        MediaType::Other(m) => m == DOCKER_MANIFEST_LIST,
        _ => false,
    }
}

fn empty_index() -> Result<ImageIndex> {
    ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageIndex)
        .manifests(Vec::<Descriptor>::new())
        .build()
        .map_err(|e| ApptainerError::OciImageError(format!("failed to build index: {}", e)))
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let staged = sibling_temp_path(path, "tmp");
    if let Err(e) = fs::write(&staged, content).and_then(|_| fs::rename(&staged, path)) {
        let _ = fs::remove_file(&staged);
        return Err(ApptainerError::IoError(std::io::Error::new(
            e.kind(),
            format!("failed to write {}: {}", path.display(), e),
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a small single-image layout and return the manifest digest.
    pub(crate) fn write_test_image(layout: &OciLayout, layer: &[u8], tag: Option<&str>) -> Digest {
        let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;
        let config_digest = layout.write_blob(config).unwrap();
        let layer_digest = layout.write_blob(layer).unwrap();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest.to_string(),
                "size": config.len()
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": layer_digest.to_string(),
                "size": layer.len()
            }]
        });
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let digest = layout.write_blob(&bytes).unwrap();
        let mut desc = Descriptor::new(MediaType::ImageManifest, bytes.len() as i64, digest.to_string());
        if let Some(tag) = tag {
            desc = with_ref_name(desc, tag);
        }
        layout.add_manifest(desc).unwrap();
        digest
    }

    #[test]
    fn test_create_and_open() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("layout");
        OciLayout::create(&root).unwrap();
        assert!(OciLayout::is_layout(&root));
        let layout = OciLayout::open(&root).unwrap();
        assert!(layout.index().unwrap().manifests().is_empty());
    }

    #[test]
    fn test_open_missing_is_source_missing() {
        let tmp = TempDir::new().unwrap();
        let err = OciLayout::open(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, ApptainerError::SourceMissing(_)));
    }

    #[test]
    fn test_resolve_single_image() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        let digest = write_test_image(&layout, b"layer-one", None);

        let resolved = layout.resolve(&LayoutSelector::Only, &Platform::host()).unwrap();
        assert_eq!(resolved.digest, digest);
        assert_eq!(resolved.manifest.layers().len(), 1);
    }

    #[test]
    fn test_resolve_ambiguous_and_by_digest() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        let first = write_test_image(&layout, b"layer-one", Some("one"));
        let second = write_test_image(&layout, b"layer-two", Some("two"));

        let err = layout.resolve(&LayoutSelector::Only, &Platform::host()).unwrap_err();
        assert!(matches!(err, ApptainerError::AmbiguousLayout(_)));

        let by_digest = layout
            .resolve(&LayoutSelector::Digest(second.clone()), &Platform::host())
            .unwrap();
        assert_eq!(by_digest.digest, second);

        let by_tag = layout
            .resolve(&LayoutSelector::Tag("one".to_string()), &Platform::host())
            .unwrap();
        assert_eq!(by_tag.digest, first);
    }

    #[test]
    fn test_resolve_unknown_digest() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        write_test_image(&layout, b"layer-one", None);
        let missing = Digest::of_bytes(b"missing");
        let err = layout
            .resolve(&LayoutSelector::Digest(missing), &Platform::host())
            .unwrap_err();
        assert!(matches!(err, ApptainerError::NotFound(_)));
    }

    #[test]
    fn test_ref_name_moves_to_newest() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        write_test_image(&layout, b"old", Some("latest"));
        let newest = write_test_image(&layout, b"new", Some("latest"));

        let index = layout.index().unwrap();
        let tagged: Vec<_> = index
            .manifests()
            .iter()
            .filter(|d| ref_name(d) == Some("latest"))
            .collect();
        assert_eq!(tagged.len(), 1);
        assert_eq!(*tagged[0].digest(), newest.to_string());
    }

    #[test]
    fn test_read_blob_detects_corruption() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        let digest = layout.write_blob(b"content").unwrap();
        fs::write(layout.blob_path(&digest), b"tampered").unwrap();
        assert!(matches!(
            layout.read_blob(&digest),
            Err(ApptainerError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_into_dedups() {
        let tmp = TempDir::new().unwrap();
        let shared = OciLayout::create(&tmp.path().join("shared")).unwrap();
        let a = OciLayout::create(&tmp.path().join("a")).unwrap();
        let b = OciLayout::create(&tmp.path().join("b")).unwrap();
        let da = write_test_image(&a, b"layer-a", None);
        let db = write_test_image(&b, b"layer-b", None);

        a.merge_into(&shared).unwrap();
        b.merge_into(&shared).unwrap();
        // Same image again is a no-op.
        let again = OciLayout::create(&tmp.path().join("again")).unwrap();
        write_test_image(&again, b"layer-a", None);
        again.merge_into(&shared).unwrap();

        assert!(shared.contains_manifest(&da));
        assert!(shared.contains_manifest(&db));
        assert_eq!(shared.index().unwrap().manifests().len(), 2);
    }
}
