//! Cache root, namespaces, reservations and housekeeping.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use apptainer_core::config::CacheConfig;
use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use super::entry::CacheEntry;
use crate::lock::FileLock;
use crate::oci::layout::OciLayout;

/// Sub-directory of the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Library,
    Oras,
    OciSif,
    OciBlob,
    /// Plain `http(s)://` downloads.
    Net,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Library,
        Namespace::Oras,
        Namespace::OciSif,
        Namespace::OciBlob,
        Namespace::Net,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Namespace::Library => "library",
            Namespace::Oras => "oras",
            Namespace::OciSif => "oci-sif",
            Namespace::OciBlob => "oci-blob",
            Namespace::Net => "net",
        }
    }

    /// Whether entries are keyed by the sha256 of their content.
    ///
    /// `net` entries are keyed by the source URL and its validators,
    /// `oci-sif` entries by the manifest digest of the source image.
    pub fn is_content_addressed(&self) -> bool {
        !matches!(self, Namespace::Net | Namespace::OciSif)
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.dir_name() == s)
            .ok_or_else(|| ApptainerError::InvalidInput(format!("unknown cache type '{}'", s)))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One object stored in the cache.
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub namespace: Namespace,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    /// Report what would be removed without removing it.
    pub dry_run: bool,
    /// Only remove items last modified more than this many days ago.
    pub days: Option<u64>,
}

#[derive(Debug, Default)]
pub struct CleanReport {
    pub removed: Vec<CacheItem>,
    pub skipped_busy: usize,
    pub bytes: u64,
}

struct Inner {
    root: PathBuf,
    disabled: bool,
    _scratch: Option<TempDir>,
}

/// Handle to an on-disk cache. Cheap to clone.
#[derive(Clone)]
pub struct CacheHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("root", &self.inner.root)
            .field("disabled", &self.inner.disabled)
            .finish()
    }
}

impl CacheHandle {
    /// Open the cache described by configuration.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        if config.disabled {
            return Self::disabled(None);
        }
        Self::at(&config.resolve_root())
    }

    /// Open (creating if needed) a cache rooted at `root`.
    pub fn at(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            ApptainerError::CacheError(format!(
                "failed to create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;
        tracing::debug!(root = %root.display(), "Using image cache");
        Ok(Self {
            inner: Arc::new(Inner {
                root: root.to_path_buf(),
                disabled: false,
                _scratch: None,
            }),
        })
    }

    /// A cache that keeps nothing: entries live in a scratch directory
    /// (under `tmp_dir` if given) removed when the last handle drops.
    pub fn disabled(tmp_dir: Option<&Path>) -> Result<Self> {
        let scratch = match tmp_dir {
            Some(dir) => tempfile::Builder::new().prefix("apptainer-cache-").tempdir_in(dir),
            None => tempfile::Builder::new().prefix("apptainer-cache-").tempdir(),
        }
        .map_err(|e| ApptainerError::CacheError(format!("failed to create scratch cache: {}", e)))?;
        tracing::debug!(root = %scratch.path().display(), "Image cache disabled, using scratch directory");
        Ok(Self {
            inner: Arc::new(Inner {
                root: scratch.path().to_path_buf(),
                disabled: true,
                _scratch: Some(scratch),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.disabled
    }

    /// Directory of a namespace, created on first use.
    pub fn namespace_dir(&self, namespace: Namespace) -> Result<PathBuf> {
        let dir = self.inner.root.join(namespace.dir_name());
        fs::create_dir_all(&dir).map_err(|e| {
            ApptainerError::CacheError(format!(
                "failed to create cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(dir)
    }

    /// The shared OCI layout of the `oci-blob` namespace.
    pub fn blob_layout(&self) -> Result<OciLayout> {
        OciLayout::create(&self.namespace_dir(Namespace::OciBlob)?)
    }

    /// Reserve `(namespace, digest)`; blocks while another holder has it.
    pub fn get_entry(&self, namespace: Namespace, digest: &Digest) -> Result<CacheEntry> {
        let dir = self.namespace_dir(namespace)?;
        let hex = digest.hex();
        let lock = if self.inner.disabled {
            None
        } else {
            Some(FileLock::exclusive(&dir.join(format!("{}.lock", hex)))?)
        };

        let nonce = format!("{:016x}", rand::random::<u64>());
        let tmp_path = dir.join(format!("{}.tmp-{}", hex, nonce));
        let (path, exists) = if namespace == Namespace::OciBlob {
            let exists = OciLayout::is_layout(&dir)
                && OciLayout::open(&dir).is_ok_and(|l| l.contains_manifest(digest));
            (dir, exists)
        } else {
            let path = dir.join(hex);
            let exists = path.is_file();
            (path, exists)
        };

        tracing::debug!(
            namespace = %namespace,
            digest = %digest,
            exists,
            "Reserved cache entry"
        );

        Ok(CacheEntry {
            namespace,
            digest: digest.clone(),
            path,
            tmp_path,
            exists,
            finalized: exists,
            // Nothing to write, let other readers through.
            lock: if exists { None } else { lock },
        })
    }

    /// [`CacheHandle::get_entry`] without blocking the async runtime.
    pub async fn reserve(&self, namespace: Namespace, digest: &Digest) -> Result<CacheEntry> {
        let this = self.clone();
        let digest = digest.clone();
        tokio::task::spawn_blocking(move || this.get_entry(namespace, &digest))
            .await
            .map_err(|e| ApptainerError::CacheError(format!("cache reservation task failed: {}", e)))?
    }

    /// Canonical path of a finalized single-file entry, if present.
    pub fn lookup(&self, namespace: Namespace, digest: &Digest) -> Option<PathBuf> {
        let path = self.inner.root.join(namespace.dir_name()).join(digest.hex());
        path.is_file().then_some(path)
    }

    /// List the items of a namespace. `oci-blob` lists its blobs.
    pub fn list(&self, namespace: Namespace) -> Result<Vec<CacheItem>> {
        let dir = self.inner.root.join(namespace.dir_name());
        let scan = if namespace == Namespace::OciBlob {
            dir.join("blobs").join("sha256")
        } else {
            dir
        };
        if !scan.is_dir() {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        for entry in fs::read_dir(&scan).map_err(|e| {
            ApptainerError::CacheError(format!("failed to read {}: {}", scan.display(), e))
        })? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if Digest::from_hex(&name).is_err() {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            items.push(CacheItem {
                namespace,
                name,
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    /// Remove cached items. Entries reserved by a live writer are skipped.
    ///
    /// The shared `oci-blob` layout is removed as a whole: with an age
    /// filter, only once every blob in it is older than the cutoff.
    pub fn clean(&self, namespaces: &[Namespace], opts: &CleanOptions) -> Result<CleanReport> {
        // An age beyond the representable range expires nothing.
        let cutoff = opts
            .days
            .map(|d| {
                d.checked_mul(24 * 60 * 60)
                    .and_then(|secs| SystemTime::now().checked_sub(Duration::from_secs(secs)))
                    .unwrap_or(UNIX_EPOCH)
            })
            .map(DateTime::<Utc>::from);
        let expired = |item: &CacheItem| cutoff.map_or(true, |c| item.modified < c);
        let mut report = CleanReport::default();

        for &namespace in namespaces {
            let dir = self.inner.root.join(namespace.dir_name());
            if !dir.is_dir() {
                continue;
            }
            let items = self.list(namespace)?;

            if namespace == Namespace::OciBlob {
                if items.is_empty() || !items.iter().all(expired) {
                    continue;
                }
                let Some(_guard) = FileLock::try_exclusive(&dir.join("index.json.lock"))? else {
                    report.skipped_busy += 1;
                    continue;
                };
                if busy_reservations(&dir)? {
                    report.skipped_busy += 1;
                    continue;
                }
                report.bytes += items.iter().map(|i| i.size).sum::<u64>();
                report.removed.extend(items);
                if !opts.dry_run {
                    crate::fs::remove_path(&dir)?;
                }
                continue;
            }

            for item in items.into_iter().filter(|i| expired(i)) {
                let lock_path = dir.join(format!("{}.lock", item.name));
                let Some(_guard) = FileLock::try_exclusive(&lock_path)? else {
                    report.skipped_busy += 1;
                    continue;
                };
                if !opts.dry_run {
                    fs::remove_file(&item.path)?;
                    let _ = fs::remove_file(&lock_path);
                }
                report.bytes += item.size;
                report.removed.push(item);
            }
            if !opts.dry_run {
                self.remove_stale_tmp(&dir)?;
            }
        }

        tracing::info!(
            removed = report.removed.len(),
            bytes = report.bytes,
            dry_run = opts.dry_run,
            "Cache cleaned"
        );
        Ok(report)
    }

    /// Remove temporaries left behind by crashed writers.
    fn remove_stale_tmp(&self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((hex, _)) = name.split_once(".tmp-") else {
                continue;
            };
            let Some(_guard) = FileLock::try_exclusive(&dir.join(format!("{}.lock", hex)))? else {
                continue;
            };
            tracing::debug!(path = %entry.path().display(), "Removing stale cache temporary");
            crate::fs::remove_path(&entry.path())?;
        }
        Ok(())
    }
}

fn busy_reservations(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if let Some(hex) = name.strip_suffix(".lock") {
            if Digest::from_hex(hex).is_ok() && FileLock::try_exclusive(&dir.join(&name))?.is_none() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
