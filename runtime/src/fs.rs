//! Filesystem helpers shared by the cache and the pull pipeline.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use apptainer_core::error::{ApptainerError, Result};

/// Create `path` and its parents if missing.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        ApptainerError::IoError(std::io::Error::new(
            e.kind(),
            format!("failed to create directory {}: {}", path.display(), e),
        ))
    })
}

/// Check write access for the calling user with `access(2)`.
pub fn is_writable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

/// A sibling path in the same directory, unique per call.
pub fn sibling_temp_path(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{}.{}-{:016x}", name, tag, rand::random::<u64>()))
}

/// Move `src` onto `dst` so that `dst` is only ever observed whole.
///
/// Same filesystem: `rename(2)`. Across devices: copy into a temporary
/// sibling of `dst`, sync it, then rename it into place.
pub fn rename_or_copy(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            tracing::debug!(
                src = %src.display(),
                dst = %dst.display(),
                "Cross-device rename, falling back to copy"
            );
            let staged = sibling_temp_path(dst, "xdev");
            let copied = if src.is_dir() {
                copy_dir_recursive(src, &staged)
            } else {
                fs::copy(src, &staged).and_then(|_| File::open(&staged)?.sync_all())
            };
            if let Err(e) = copied.and_then(|_| fs::rename(&staged, dst)) {
                let _ = remove_path(&staged);
                return Err(io_context(e, "failed to move", src, dst));
            }
            let _ = remove_path(src);
            Ok(())
        }
        Err(e) => Err(io_context(e, "failed to rename", src, dst)),
    }
}

/// Copy `src` to `dst` atomically; `mode` applies when `dst` is created.
pub fn copy_file_atomic(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    let staged = sibling_temp_path(dst, "copy");
    let result = (|| -> std::io::Result<()> {
        let mut input = File::open(src)?;
        let mut output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&staged)?;
        std::io::copy(&mut input, &mut output)?;
        output.flush()?;
        output.sync_all()?;
        fs::rename(&staged, dst)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&staged);
        return Err(io_context(e, "failed to copy", src, dst));
    }
    Ok(())
}

/// Recursively copy a directory tree. Symlinks are recreated, not followed.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&src_path)?, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Calculate total size of a file or directory recursively.
pub fn dir_size(path: &Path) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    let mut total = 0;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            total += dir_size(&entry.path());
        }
    }
    total
}

/// Remove a file or directory tree; missing paths are not an error.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn io_context(e: std::io::Error, what: &str, src: &Path, dst: &Path) -> ApptainerError {
    ApptainerError::IoError(std::io::Error::new(
        e.kind(),
        format!("{} {} to {}: {}", what, src.display(), dst.display(), e),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_rename_or_copy_file() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::write(&src, b"payload").unwrap();

        rename_or_copy(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn test_rename_or_copy_missing_source() {
        let tmp = TempDir::new().unwrap();
        let err = rename_or_copy(&tmp.path().join("nope"), &tmp.path().join("dst")).unwrap_err();
        assert!(err.to_string().contains("failed to rename"));
    }

    #[test]
    fn test_copy_file_atomic_mode() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("image.sif");
        let dst = tmp.path().join("out.sif");
        fs::write(&src, b"sif").unwrap();

        copy_file_atomic(&src, &dst, 0o700).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"sif");
        let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & 0o077, 0);
        // No staging leftovers.
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_copy_file_atomic_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("new");
        let dst = tmp.path().join("old");
        fs::write(&src, b"new").unwrap();
        fs::write(&dst, b"old").unwrap();

        copy_file_atomic(&src, &dst, 0o644).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn test_copy_dir_recursive_and_size() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("blobs/sha256")).unwrap();
        fs::write(src.join("index.json"), "{}").unwrap();
        fs::write(src.join("blobs/sha256/aa"), "x".repeat(1024)).unwrap();
        std::os::unix::fs::symlink("index.json", src.join("link")).unwrap();

        let dst = tmp.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();
        assert!(dst.join("blobs/sha256/aa").exists());
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), PathBuf::from("index.json"));
        assert!(dir_size(&dst) >= 1026);
    }

    #[test]
    fn test_remove_path_missing_ok() {
        let tmp = TempDir::new().unwrap();
        remove_path(&tmp.path().join("gone")).unwrap();
    }

    #[test]
    fn test_is_writable() {
        let tmp = TempDir::new().unwrap();
        assert!(is_writable(tmp.path()));
        assert!(!is_writable(Path::new("/nonexistent/dir")));
    }

    #[test]
    fn test_sibling_temp_path_same_dir() {
        let p = sibling_temp_path(Path::new("/cache/oras/abc"), "copy");
        assert_eq!(p.parent(), Some(Path::new("/cache/oras")));
        assert!(p.file_name().unwrap().to_string_lossy().starts_with(".abc.copy-"));
    }
}
