//! Safe tar / tar.gz extraction.
//!
//! Every entry is resolved lexically against the destination before anything
//! touches the disk, and link targets are confined to an extraction root that
//! may be wider than the destination (so layers unpacked into sub-trees can
//! link across them). Existing symlinks in an entry's parent chain are
//! followed inside the destination only.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::ffi::{CString, OsStr};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use apptainer_core::error::{ApptainerError, Result};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

const MAX_SYMLINK_HOPS: usize = 255;

/// Extraction options.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Links may point anywhere under this directory. Defaults to the destination.
    pub root: Option<PathBuf>,

    /// Log and continue when extended attributes cannot be set (ENOTSUP / EPERM).
    pub xattr_best_effort: bool,

    /// Apply tar header ownership. Defaults to "running as root".
    pub preserve_owner: Option<bool>,
}

/// Extract a tar or gzipped tar file into `dest`.
pub fn extract_file(archive: &Path, dest: &Path, opts: &ExtractOptions) -> Result<()> {
    if !archive.exists() {
        return Err(ApptainerError::SourceMissing(archive.display().to_string()));
    }
    let file = File::open(archive).map_err(|e| {
        ApptainerError::IoError(std::io::Error::new(
            e.kind(),
            format!("failed to open archive {}: {}", archive.display(), e),
        ))
    })?;
    extract_archive(file, dest, opts)
}

/// Extract a tar stream, gzip-compressed or not, into `dest`.
pub fn extract_archive<R: Read>(reader: R, dest: &Path, opts: &ExtractOptions) -> Result<()> {
    let mut buffered = BufReader::new(reader);
    let is_gzip = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        unpack(GzDecoder::new(buffered), dest, opts)
    } else {
        unpack(buffered, dest, opts)
    }
}

/// Whether a stream starts with the gzip magic.
pub fn is_gzip(header: &[u8]) -> bool {
    header.starts_with(&GZIP_MAGIC)
}

struct Unpacker<'a> {
    dest: PathBuf,
    root: PathBuf,
    opts: &'a ExtractOptions,
    chown: bool,
    // Directory modes and mtimes are applied last so read-only
    // directories don't block extraction of their children.
    dirs: Vec<(PathBuf, u32, u64)>,
}

fn unpack<R: Read>(reader: R, dest: &Path, opts: &ExtractOptions) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| {
        ApptainerError::IoError(std::io::Error::new(
            e.kind(),
            format!("failed to create {}: {}", dest.display(), e),
        ))
    })?;
    let dest = lexical_clean(&absolute(dest)?);
    let root = match opts.root {
        Some(ref r) => lexical_clean(&absolute(r)?),
        None => dest.clone(),
    };
    if !dest.starts_with(&root) {
        return Err(ApptainerError::InvalidInput(format!(
            "extraction directory {} is not under root {}",
            dest.display(),
            root.display()
        )));
    }

    // SAFETY: geteuid has no preconditions.
    let privileged = unsafe { libc::geteuid() } == 0;
    let mut unpacker = Unpacker {
        dest,
        root,
        opts,
        chown: opts.preserve_owner.unwrap_or(privileged),
        dirs: Vec::new(),
    };

    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| ApptainerError::OciImageError(format!("corrupt archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| ApptainerError::OciImageError(format!("corrupt archive: {}", e)))?;
        unpacker.unpack_entry(&mut entry)?;
    }
    unpacker.finish_dirs()
}

impl Unpacker<'_> {
    fn unpack_entry<R: Read>(&mut self, entry: &mut tar::Entry<'_, R>) -> Result<()> {
        let kind = entry.header().entry_type();
        if kind.is_pax_global_extensions() {
            tracing::debug!("PAX global extended header ignored");
            return Ok(());
        }

        let name: PathBuf = entry
            .path()
            .map_err(|e| ApptainerError::OciImageError(format!("bad entry name: {}", e)))?
            .into_owned();

        let lexical = join_clean(&self.dest, &name);
        if !lexical.starts_with(&self.dest) {
            return Err(ApptainerError::IllegalPath(format!(
                "{} is outside of {}",
                name.display(),
                self.dest.display()
            )));
        }
        let rel = match lexical.strip_prefix(&self.dest) {
            Ok(r) => r.to_path_buf(),
            Err(_) => PathBuf::new(),
        };
        let Some(file_name) = rel.file_name().map(|f| f.to_os_string()) else {
            // The destination itself ("." / "./").
            if kind.is_dir() {
                let mode = entry.header().mode().unwrap_or(0o755);
                let mtime = entry.header().mtime().unwrap_or(0);
                self.dirs.push((self.dest.clone(), mode, mtime));
            }
            return Ok(());
        };

        if kind.is_character_special() || kind.is_block_special() {
            tracing::warn!(path = %name.display(), "Skipping block / char device");
            return Ok(());
        }
        if kind.is_fifo() {
            tracing::warn!(path = %name.display(), "Skipping fifo");
            return Ok(());
        }

        // Resolve the parent through any symlinks already on disk, confined to dest.
        let parent_rel = rel.parent().unwrap_or(Path::new(""));
        let parent = secure_join(&self.dest, parent_rel)?;

        // Validate link targets before creating anything for this entry.
        let link_target = if kind.is_hard_link() || kind.is_symlink() {
            let link: PathBuf = entry
                .link_name()
                .map_err(|e| ApptainerError::OciImageError(format!("bad link name: {}", e)))?
                .map(Cow::into_owned)
                .ok_or_else(|| {
                    ApptainerError::OciImageError(format!("link {} has no target", name.display()))
                })?;
            let resolved = if kind.is_hard_link() {
                join_clean(&self.dest, &link)
            } else {
                join_clean(&self.dest.join(parent_rel), &link)
            };
            if !resolved.starts_with(&self.root) {
                return Err(ApptainerError::LinkEscape {
                    link: name.display().to_string(),
                    target: link.display().to_string(),
                });
            }
            Some((link, resolved))
        } else {
            None
        };

        fs::create_dir_all(&parent).map_err(|e| io_at(e, "create", &parent))?;
        let path = parent.join(&file_name);
        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644) & 0o7777;
        let mtime = header.mtime().unwrap_or(0);
        let uid = header.uid().unwrap_or(0);
        let gid = header.gid().unwrap_or(0);

        // Replace whatever exists unless both sides are directories.
        if let Ok(existing) = fs::symlink_metadata(&path) {
            if !(existing.is_dir() && kind.is_dir()) {
                crate::fs::remove_path(&path).map_err(|e| io_at(e, "replace", &path))?;
            }
        }

        match kind {
            EntryType::Directory => {
                if !path.is_dir() {
                    fs::DirBuilder::new()
                        .mode(0o755)
                        .create(&path)
                        .map_err(|e| io_at(e, "create directory", &path))?;
                }
                self.dirs.push((path.clone(), mode, mtime));
            }
            EntryType::Link => {
                let (_, resolved) = link_target.as_ref().ok_or_else(|| {
                    ApptainerError::OciImageError("hard link without target".to_string())
                })?;
                let rel_target = resolved.strip_prefix(&self.root).unwrap_or(Path::new(""));
                let source = secure_join(&self.root, rel_target)?;
                fs::hard_link(&source, &path).map_err(|e| io_at(e, "hard link", &path))?;
                return Ok(());
            }
            EntryType::Symlink => {
                let (link, _) = link_target.as_ref().ok_or_else(|| {
                    ApptainerError::OciImageError("symlink without target".to_string())
                })?;
                std::os::unix::fs::symlink(link, &path).map_err(|e| io_at(e, "symlink", &path))?;
            }
            k if k.is_file() => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o600)
                    .open(&path)
                    .map_err(|e| io_at(e, "create", &path))?;
                std::io::copy(entry, &mut file).map_err(|e| io_at(e, "write", &path))?;
                file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime))
                    .map_err(|e| io_at(e, "set mtime on", &path))?;
            }
            other => {
                tracing::debug!(path = %name.display(), kind = ?other, "Skipping unsupported entry type");
                return Ok(());
            }
        }

        if self.chown {
            lchown(&path, uid as u32, gid as u32)?;
        }
        if !kind.is_symlink() && !kind.is_dir() {
            fs::set_permissions(&path, Permissions::from_mode(mode))
                .map_err(|e| io_at(e, "chmod", &path))?;
        }
        self.apply_xattrs(entry, &path)
    }

    fn apply_xattrs<R: Read>(&self, entry: &mut tar::Entry<'_, R>, path: &Path) -> Result<()> {
        let Ok(Some(extensions)) = entry.pax_extensions() else {
            return Ok(());
        };
        for ext in extensions {
            let ext = ext.map_err(|e| ApptainerError::OciImageError(format!("bad PAX record: {}", e)))?;
            let Ok(key) = ext.key() else { continue };
            let Some(attr) = key.strip_prefix(PAX_SCHILY_XATTR) else {
                continue;
            };
            if let Err(e) = lsetxattr(path, attr, ext.value_bytes()) {
                if self.opts.xattr_best_effort && xattr_error_is_tolerable(&e) {
                    tracing::warn!(
                        path = %path.display(),
                        xattr = attr,
                        error = %e,
                        "Ignoring xattr"
                    );
                    continue;
                }
                return Err(io_at(e, &format!("set xattr {} on", attr), path));
            }
        }
        Ok(())
    }

    fn finish_dirs(&mut self) -> Result<()> {
        // Children before parents so mtimes stick.
        for (path, mode, mtime) in self.dirs.drain(..).rev() {
            fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777))
                .map_err(|e| io_at(e, "chmod", &path))?;
            if let Ok(dir) = File::open(&path) {
                let _ = dir.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime));
            }
        }
        Ok(())
    }
}

/// Whether an xattr failure may be skipped in best-effort mode.
pub fn xattr_error_is_tolerable(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ENOTSUP) | Some(libc::EPERM))
}

/// Join `path` onto `base` and normalize `.`/`..` lexically.
///
/// Absolute components of `path` are treated as relative to `base`.
pub fn join_clean(base: &Path, path: &Path) -> PathBuf {
    let mut out = lexical_clean(base);
    let floor = out.components().count().min(1);
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                if out.components().count() > floor {
                    out.pop();
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Normalize a path lexically without touching the filesystem.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `rel` under `root`, following symlinks that already exist on
/// disk as if `root` were `/`. The result never leaves `root`.
pub fn secure_join(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: VecDeque<PathBuf> = normal_parts(rel).collect();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part.as_os_str() == OsStr::new("..") {
            resolved.pop();
            continue;
        }
        let candidate = root.join(&resolved).join(&part);
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(ApptainerError::IllegalPath(format!(
                        "too many levels of symbolic links under {}",
                        root.display()
                    )));
                }
                let target = fs::read_link(&candidate).map_err(|e| io_at(e, "read link", &candidate))?;
                if target.is_absolute() {
                    resolved.clear();
                }
                for p in normal_parts(&target).collect::<Vec<_>>().into_iter().rev() {
                    pending.push_front(p);
                }
            }
            _ => resolved.push(&part),
        }
    }
    Ok(root.join(resolved))
}

fn normal_parts(path: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(n) => Some(PathBuf::from(n)),
        Component::ParentDir => Some(PathBuf::from("..")),
        _ => None,
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = c_path(path)?;
    // SAFETY: c_path is a valid NUL-terminated path for the duration of the call.
    let ret = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if ret != 0 {
        return Err(io_at(std::io::Error::last_os_error(), "chown", path));
    }
    Ok(())
}

fn lsetxattr(path: &Path, name: &str, value: &[u8]) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let c_name =
        CString::new(name).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: pointers are valid for the given lengths during the call.
    let ret = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ApptainerError::InvalidInput(format!("path contains NUL: {}", path.display())))
}

fn io_at(e: std::io::Error, what: &str, path: &Path) -> ApptainerError {
    ApptainerError::IoError(std::io::Error::new(
        e.kind(),
        format!("failed to {} {}: {}", what, path.display(), e),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    /// One tar member for test fixtures. Names are written raw so that
    /// hostile paths can be expressed.
    pub(crate) struct Member<'a> {
        pub name: &'a str,
        pub kind: EntryType,
        pub link: Option<&'a str>,
        pub data: &'a [u8],
        pub mode: u32,
    }

    impl<'a> Member<'a> {
        pub fn file(name: &'a str, data: &'a [u8]) -> Self {
            Self { name, kind: EntryType::Regular, link: None, data, mode: 0o644 }
        }
        pub fn dir(name: &'a str) -> Self {
            Self { name, kind: EntryType::Directory, link: None, data: b"", mode: 0o755 }
        }
        pub fn symlink(name: &'a str, target: &'a str) -> Self {
            Self { name, kind: EntryType::Symlink, link: Some(target), data: b"", mode: 0o777 }
        }
        pub fn hardlink(name: &'a str, target: &'a str) -> Self {
            Self { name, kind: EntryType::Link, link: Some(target), data: b"", mode: 0o644 }
        }
    }

    pub(crate) fn build_tar(members: &[Member<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for m in members {
            let mut header = tar::Header::new_gnu();
            {
                let old = header.as_old_mut();
                old.name[..m.name.len()].copy_from_slice(m.name.as_bytes());
                if let Some(link) = m.link {
                    old.linkname[..link.len()].copy_from_slice(link.as_bytes());
                }
            }
            header.set_entry_type(m.kind);
            header.set_size(m.data.len() as u64);
            header.set_mode(m.mode);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append(&header, m.data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn extract(bytes: &[u8], dest: &Path) -> Result<()> {
        extract_archive(bytes, dest, &ExtractOptions::default())
    }

    #[test]
    fn test_extracts_files_and_dirs() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let tar = build_tar(&[
            Member::dir("etc/"),
            Member::file("etc/hostname", b"box\n"),
            Member { mode: 0o755, ..Member::file("bin/tool", b"#!/bin/sh\n") },
        ]);

        extract(&tar, &dest).unwrap();
        assert_eq!(fs::read(dest.join("etc/hostname")).unwrap(), b"box\n");
        let mode = fs::metadata(dest.join("bin/tool")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        assert!(dest.join("bin").is_dir());
    }

    #[test]
    fn test_gzip_detected_by_magic() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let tar = gzip(&build_tar(&[Member::file("a.txt", b"gz")]));
        assert!(is_gzip(&tar));

        extract(&tar, &dest).unwrap();
        assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"gz");
    }

    #[test]
    fn test_traversal_rejected_without_side_effects() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("x");
        let tar = build_tar(&[
            Member::file("ok.txt", b"fine"),
            Member::file("../../etc/passwd", b"root::0:0"),
        ]);

        let err = extract(&tar, &dest).unwrap_err();
        assert!(matches!(err, ApptainerError::IllegalPath(_)));
        assert!(dest.join("ok.txt").exists());
        assert!(!tmp.path().join("etc").exists());
    }

    #[test]
    fn test_absolute_name_stays_inside() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let tar = build_tar(&[Member::file("/etc/motd", b"hi")]);
        extract(&tar, &dest).unwrap();
        assert!(dest.join("etc/motd").exists());
    }

    #[test]
    fn test_symlink_written_verbatim() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let tar = build_tar(&[
            Member::file("usr/bin/busybox", b"elf"),
            Member::symlink("bin/sh", "/usr/bin/busybox"),
            Member::symlink("bin/ls", "../usr/bin/busybox"),
        ]);

        extract(&tar, &dest).unwrap();
        assert_eq!(fs::read_link(dest.join("bin/sh")).unwrap(), PathBuf::from("/usr/bin/busybox"));
        assert_eq!(fs::read_link(dest.join("bin/ls")).unwrap(), PathBuf::from("../usr/bin/busybox"));
    }

    #[test]
    fn test_symlink_escape_rejected() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let tar = build_tar(&[Member::symlink("evil", "../../../etc/shadow")]);
        let err = extract(&tar, &dest).unwrap_err();
        assert!(matches!(err, ApptainerError::LinkEscape { .. }));
        assert!(fs::symlink_metadata(dest.join("evil")).is_err());
    }

    #[test]
    fn test_symlink_allowed_within_wider_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("rootfs");
        let dest = root.join("layer1");
        fs::create_dir_all(root.join("shared")).unwrap();
        let tar = build_tar(&[Member::symlink("lib", "../shared/lib")]);

        let opts = ExtractOptions { root: Some(root.clone()), ..Default::default() };
        extract_archive(&tar[..], &dest, &opts).unwrap();
        assert!(fs::symlink_metadata(dest.join("lib")).unwrap().file_type().is_symlink());

        // Same archive without the wider root escapes.
        let other = tmp.path().join("other");
        assert!(matches!(
            extract(&tar, &other),
            Err(ApptainerError::LinkEscape { .. })
        ));
    }

    #[test]
    fn test_hardlink_inside_and_escape() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let tar = build_tar(&[
            Member::file("data/a", b"same"),
            Member::hardlink("data/b", "data/a"),
        ]);
        extract(&tar, &dest).unwrap();
        assert_eq!(fs::read(dest.join("data/b")).unwrap(), b"same");

        let dest2 = tmp.path().join("out2");
        let tar = build_tar(&[Member::hardlink("x", "../../etc/passwd")]);
        assert!(matches!(
            extract(&tar, &dest2),
            Err(ApptainerError::LinkEscape { .. })
        ));
    }

    #[test]
    fn test_write_through_absolute_symlink_stays_inside() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let outside_str = outside.to_string_lossy().into_owned();
        let tar = build_tar(&[
            Member::symlink("link", &outside_str),
            Member::file("link/payload", b"trapped"),
        ]);

        extract(&tar, &dest).unwrap();
        assert!(!outside.join("payload").exists());
        let inside = join_clean(&dest, &outside).join("payload");
        assert_eq!(fs::read(inside).unwrap(), b"trapped");
    }

    #[test]
    fn test_fifo_and_devices_skipped() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let tar = build_tar(&[
            Member { kind: EntryType::Fifo, ..Member::file("run/pipe", b"") },
            Member { kind: EntryType::Char, ..Member::file("dev/null", b"") },
            Member { kind: EntryType::Block, ..Member::file("dev/sda", b"") },
            Member::file("kept", b"yes"),
        ]);
        extract(&tar, &dest).unwrap();
        assert!(!dest.join("run/pipe").exists());
        assert!(!dest.join("dev/null").exists());
        assert!(!dest.join("dev/sda").exists());
        assert!(dest.join("kept").exists());
    }

    #[test]
    fn test_readonly_dir_mode_applied_last() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let tar = build_tar(&[
            Member { mode: 0o555, ..Member::dir("ro/") },
            Member::file("ro/file", b"x"),
        ]);
        extract(&tar, &dest).unwrap();
        let mode = fs::metadata(dest.join("ro")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o555);
        assert!(dest.join("ro/file").exists());
        fs::set_permissions(dest.join("ro"), Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_existing_file_replaced() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        extract(&build_tar(&[Member::file("f", b"one")]), &dest).unwrap();
        extract(&build_tar(&[Member::file("f", b"two")]), &dest).unwrap();
        assert_eq!(fs::read(dest.join("f")).unwrap(), b"two");
    }

    #[test]
    fn test_extract_file_missing() {
        let tmp = TempDir::new().unwrap();
        let err = extract_file(&tmp.path().join("none.tar"), tmp.path(), &ExtractOptions::default())
            .unwrap_err();
        assert!(matches!(err, ApptainerError::SourceMissing(_)));
    }

    #[test]
    fn test_join_clean() {
        assert_eq!(join_clean(Path::new("/tmp/x"), Path::new("a/../b")), PathBuf::from("/tmp/x/b"));
        assert_eq!(join_clean(Path::new("/tmp/x"), Path::new("/etc")), PathBuf::from("/tmp/x/etc"));
        assert_eq!(
            join_clean(Path::new("/tmp/x"), Path::new("../../etc/passwd")),
            PathBuf::from("/etc/passwd")
        );
    }

    #[test]
    fn test_xattr_error_classification() {
        assert!(xattr_error_is_tolerable(&std::io::Error::from_raw_os_error(libc::ENOTSUP)));
        assert!(xattr_error_is_tolerable(&std::io::Error::from_raw_os_error(libc::EPERM)));
        assert!(!xattr_error_is_tolerable(&std::io::Error::from_raw_os_error(libc::ENOSPC)));
    }
}
