//! A single cache reservation.

use std::fs;
use std::path::{Path, PathBuf};

use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};

use super::handle::Namespace;
use crate::context::Context;
use crate::lock::FileLock;
use crate::oci::layout::OciLayout;

/// A reserved slot for `(namespace, digest)`.
///
/// While the entry is alive and not yet finalized it holds the per-entry
/// lock, so other processes reserving the same digest wait. Dropping an
/// unfinalized entry removes its temporary path.
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) namespace: Namespace,
    pub(crate) digest: Digest,
    pub(crate) path: PathBuf,
    pub(crate) tmp_path: PathBuf,
    pub(crate) exists: bool,
    pub(crate) finalized: bool,
    pub(crate) lock: Option<FileLock>,
}

impl CacheEntry {
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Canonical location. For `oci-blob` this is the shared layout root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the caller writes content before [`CacheEntry::finalize`].
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Whether finalized content was already present when reserved.
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Verify the temporary content and publish it under the canonical path.
    ///
    /// Calling it again after success is a no-op.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let result = if self.namespace == Namespace::OciBlob {
            self.finalize_layout()
        } else {
            self.finalize_file()
        };
        match result {
            Ok(()) => {
                self.finalized = true;
                self.exists = true;
                self.lock = None;
                tracing::debug!(
                    namespace = %self.namespace,
                    digest = %self.digest,
                    path = %self.path.display(),
                    "Cache entry finalized"
                );
                Ok(())
            }
            Err(e) => {
                self.clean_tmp();
                Err(e)
            }
        }
    }

    /// [`CacheEntry::finalize`] on the blocking pool, under `ctx`.
    pub async fn commit(mut self, ctx: &Context) -> Result<Self> {
        ctx.blocking("cache finalize", move || {
            self.finalize()?;
            Ok(self)
        })
        .await
    }

    fn finalize_file(&self) -> Result<()> {
        if !self.namespace.is_content_addressed() {
            if !self.tmp_path.is_file() {
                return Err(ApptainerError::CacheError(format!(
                    "nothing written to {}",
                    self.tmp_path.display()
                )));
            }
            return crate::fs::rename_or_copy(&self.tmp_path, &self.path);
        }
        let actual = Digest::of_path(&self.tmp_path).map_err(|e| {
            ApptainerError::CacheError(format!(
                "failed to hash {}: {}",
                self.tmp_path.display(),
                e
            ))
        })?;
        if !actual.ct_eq(&self.digest) {
            return Err(ApptainerError::DigestMismatch {
                expected: self.digest.to_string(),
                actual: actual.to_string(),
            });
        }

        if self.path.exists() {
            // Someone else won the race; accept only identical content.
            let existing = Digest::of_path(&self.path)?;
            if !existing.ct_eq(&self.digest) {
                return Err(ApptainerError::DigestMismatch {
                    expected: self.digest.to_string(),
                    actual: existing.to_string(),
                });
            }
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %self.tmp_path.display(),
                        error = %e,
                        "Failed to remove cache temporary"
                    );
                }
            }
            return Ok(());
        }

        crate::fs::rename_or_copy(&self.tmp_path, &self.path)
    }

    fn finalize_layout(&self) -> Result<()> {
        let staged = OciLayout::open(&self.tmp_path)?;
        if !staged.contains_manifest(&self.digest) {
            let actual = staged
                .index()?
                .manifests()
                .first()
                .map(|d| d.digest().to_string())
                .unwrap_or_else(|| "<empty layout>".to_string());
            return Err(ApptainerError::DigestMismatch {
                expected: self.digest.to_string(),
                actual,
            });
        }
        // Recompute from bytes, the index alone proves nothing.
        staged.read_blob(&self.digest)?;

        let shared = OciLayout::create(&self.path)?;
        staged.merge_into(&shared)?;
        crate::fs::remove_path(&self.tmp_path)?;
        Ok(())
    }

    /// Remove the temporary path unless finalized. Safe to call repeatedly.
    pub fn clean_tmp(&mut self) {
        if self.finalized {
            return;
        }
        if let Err(e) = crate::fs::remove_path(&self.tmp_path) {
            tracing::warn!(
                path = %self.tmp_path.display(),
                error = %e,
                "Failed to remove cache temporary"
            );
        }
        self.lock = None;
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.clean_tmp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheHandle;
    use crate::oci::layout::tests::write_test_image;
    use tempfile::TempDir;

    #[test]
    fn test_finalize_file_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let digest = Digest::of_bytes(b"sif image");

        let mut entry = cache.get_entry(Namespace::Library, &digest).unwrap();
        assert!(!entry.exists());
        fs::write(entry.tmp_path(), b"sif image").unwrap();
        entry.finalize().unwrap();

        assert!(entry.is_finalized());
        assert_eq!(Digest::of_path(entry.path()).unwrap(), digest);
        assert_eq!(entry.path(), tmp.path().join("library").join(digest.hex()));
        drop(entry);

        let again = cache.get_entry(Namespace::Library, &digest).unwrap();
        assert!(again.exists());
    }

    #[test]
    fn test_finalize_rejects_wrong_content() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let digest = Digest::of_bytes(b"expected");

        let mut entry = cache.get_entry(Namespace::Oras, &digest).unwrap();
        fs::write(entry.tmp_path(), b"something else").unwrap();
        let err = entry.finalize().unwrap_err();
        assert!(matches!(err, ApptainerError::DigestMismatch { .. }));
        assert!(!entry.path().exists());
        assert!(!entry.tmp_path().exists());
    }

    #[test]
    fn test_drop_cleans_tmp() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let digest = Digest::of_bytes(b"abandoned");

        let entry = cache.get_entry(Namespace::Net, &digest).unwrap();
        let tmp_path = entry.tmp_path().to_path_buf();
        fs::write(&tmp_path, b"partial").unwrap();
        drop(entry);
        assert!(!tmp_path.exists());
    }

    #[test]
    fn test_clean_tmp_idempotent_after_finalize() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let digest = Digest::of_bytes(b"x");

        let mut entry = cache.get_entry(Namespace::OciSif, &digest).unwrap();
        fs::write(entry.tmp_path(), b"x").unwrap();
        entry.finalize().unwrap();
        entry.clean_tmp();
        entry.clean_tmp();
        assert!(entry.path().exists());
    }

    #[test]
    fn test_second_finalize_equal_content_is_noop() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let digest = Digest::of_bytes(b"same");

        let mut first = cache.get_entry(Namespace::Library, &digest).unwrap();
        fs::write(first.tmp_path(), b"same").unwrap();
        // A second writer that bypassed the lock, e.g. after a crash.
        let path = first.path().to_path_buf();
        fs::write(&path, b"same").unwrap();
        let tmp_path = first.tmp_path().to_path_buf();
        first.finalize().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"same");
        assert!(!tmp_path.exists());
    }

    #[tokio::test]
    async fn test_commit_on_blocking_pool() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let digest = Digest::of_bytes(b"committed");
        let ctx = Context::background();

        let entry = cache.reserve(Namespace::Library, &digest).await.unwrap();
        fs::write(entry.tmp_path(), b"committed").unwrap();
        let entry = entry.commit(&ctx).await.unwrap();
        assert!(entry.is_finalized());
        assert_eq!(Digest::of_path(entry.path()).unwrap(), digest);
    }

    #[tokio::test]
    async fn test_commit_cancelled_discards_tmp() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let digest = Digest::of_bytes(b"late");
        let ctx = Context::background();

        let entry = cache.reserve(Namespace::Oras, &digest).await.unwrap();
        let tmp_path = entry.tmp_path().to_path_buf();
        let path = entry.path().to_path_buf();
        fs::write(&tmp_path, b"late").unwrap();
        ctx.cancel();
        assert!(entry.commit(&ctx).await.is_err());
        assert!(!tmp_path.exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_finalize_detects_corrupt_canonical() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let digest = Digest::of_bytes(b"good");

        let mut entry = cache.get_entry(Namespace::Library, &digest).unwrap();
        fs::write(entry.tmp_path(), b"good").unwrap();
        fs::write(entry.path(), b"bad").unwrap();
        assert!(matches!(
            entry.finalize(),
            Err(ApptainerError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_finalize_blob_layout_merges() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();

        // Build the image once to learn its digest.
        let scratch = TempDir::new().unwrap();
        let digest = write_test_image(&OciLayout::create(scratch.path()).unwrap(), b"layer", None);

        let mut entry = cache.get_entry(Namespace::OciBlob, &digest).unwrap();
        assert!(!entry.exists());
        let staged = OciLayout::create(entry.tmp_path()).unwrap();
        write_test_image(&staged, b"layer", None);
        entry.finalize().unwrap();

        let shared = OciLayout::open(entry.path()).unwrap();
        assert!(shared.contains_manifest(&digest));
        assert!(!entry.tmp_path().exists());
        drop(entry);

        assert!(cache.get_entry(Namespace::OciBlob, &digest).unwrap().exists());
    }

    #[test]
    fn test_finalize_blob_layout_wrong_image() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let wanted = Digest::of_bytes(b"not this manifest");

        let mut entry = cache.get_entry(Namespace::OciBlob, &wanted).unwrap();
        let staged = OciLayout::create(entry.tmp_path()).unwrap();
        write_test_image(&staged, b"layer", None);
        assert!(matches!(
            entry.finalize(),
            Err(ApptainerError::DigestMismatch { .. })
        ));
        assert!(!entry.tmp_path().exists());
    }

    #[test]
    fn test_net_entry_keyed_by_url() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheHandle::at(tmp.path()).unwrap();
        let key = Digest::of_bytes(b"https://example.org/image.sif");

        let mut entry = cache.get_entry(Namespace::Net, &key).unwrap();
        fs::write(entry.tmp_path(), b"downloaded body").unwrap();
        entry.finalize().unwrap();
        assert_eq!(fs::read(entry.path()).unwrap(), b"downloaded body");
    }
}
