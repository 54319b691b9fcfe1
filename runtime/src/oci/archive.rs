//! `oci-archive:` and `docker-archive:` transports.
//!
//! Both are tar files (optionally gzip-compressed) unpacked with the safe
//! extractor into a scratch directory owned by the resulting image.

use std::fs::{self, File};
use std::path::Path;

use apptainer_core::error::{ApptainerError, Result};
use tempfile::TempDir;

use super::image::{scratch_dir, write_image, OciImage};
use super::layout::{LayoutSelector, OciLayout, INDEX_FILE, OCI_LAYOUT_FILE};
use super::platform::Platform;
use super::tarball;
use crate::archive::extract_file;
use crate::context::Context;

/// Read an image from an OCI layout packed in a tar file.
pub fn read_oci_archive(path: &Path, tag: Option<&str>, platform: &Platform, tmp_dir: Option<&Path>) -> Result<OciImage> {
    let (scratch, dir) = unpack(path, tmp_dir)?;
    if !is_layout_dir(&dir) {
        return Err(ApptainerError::ArchiveUnknown(format!(
            "{} is not an OCI archive",
            path.display()
        )));
    }
    open_layout(&dir, tag, platform, &format!("oci-archive:{}", path.display()), scratch)
}

/// Read an image from a docker archive.
///
/// Archives that actually hold an OCI layout are read as OCI archives.
pub fn read_docker_archive(
    path: &Path,
    tag: Option<&str>,
    platform: &Platform,
    tmp_dir: Option<&Path>,
) -> Result<OciImage> {
    let (scratch, dir) = unpack(path, tmp_dir)?;
    let reference = format!("docker-archive:{}", path.display());
    if is_layout_dir(&dir) {
        tracing::debug!(path = %path.display(), "Docker archive holds an OCI layout");
        return open_layout(&dir, tag, platform, &reference, scratch);
    }
    if tarball::is_tarball_dir(&dir) {
        return tarball::read_dir(&dir, tag, &reference, scratch);
    }
    Err(ApptainerError::ArchiveUnknown(format!(
        "{} is neither a docker nor an OCI archive",
        path.display()
    )))
}

/// Pack `image` as an OCI layout tar at `path`.
pub async fn write_oci_archive(ctx: &Context, image: &OciImage, path: &Path, tag: Option<&str>) -> Result<()> {
    let scratch = scratch_dir(path.parent())?;
    let layout = OciLayout::create(&scratch.path().join("layout"))?;
    write_image(ctx, image, &layout, tag).await?;

    let staged = crate::fs::sibling_temp_path(path, "tmp");
    let written = (|| -> std::io::Result<()> {
        let mut builder = tar::Builder::new(File::create(&staged)?);
        builder.append_path_with_name(layout.root().join(OCI_LAYOUT_FILE), OCI_LAYOUT_FILE)?;
        builder.append_path_with_name(layout.root().join(INDEX_FILE), INDEX_FILE)?;
        for entry in fs::read_dir(layout.blobs_dir())? {
            let entry = entry?;
            let name = Path::new("blobs").join("sha256").join(entry.file_name());
            builder.append_path_with_name(entry.path(), name)?;
        }
        builder.into_inner()?.sync_all()?;
        fs::rename(&staged, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&staged);
        return Err(ApptainerError::IoError(std::io::Error::new(
            e.kind(),
            format!("failed to write OCI archive {}: {}", path.display(), e),
        )));
    }
    tracing::info!(path = %path.display(), digest = %image.digest(), "Wrote OCI archive");
    Ok(())
}

/// Pack `image` as a docker archive at `path`.
pub async fn write_docker_archive(ctx: &Context, image: &OciImage, path: &Path, tag: Option<&str>) -> Result<()> {
    tarball::write_file(ctx, image, path, tag).await
}

fn unpack(path: &Path, tmp_dir: Option<&Path>) -> Result<(TempDir, std::path::PathBuf)> {
    if !path.is_file() {
        return Err(ApptainerError::SourceMissing(format!(
            "archive {} does not exist",
            path.display()
        )));
    }
    let scratch = scratch_dir(tmp_dir)?;
    let dir = scratch.path().join("archive");
    extract_file(path, &dir, &tarball::unprivileged_extract())?;
    Ok((scratch, dir))
}

/// Regular files `oci-layout` and `index.json` mark an OCI layout.
fn is_layout_dir(dir: &Path) -> bool {
    [OCI_LAYOUT_FILE, INDEX_FILE].iter().all(|name| {
        fs::symlink_metadata(dir.join(name))
            .map(|m| m.file_type().is_file())
            .unwrap_or(false)
    })
}

fn open_layout(dir: &Path, tag: Option<&str>, platform: &Platform, reference: &str, scratch: TempDir) -> Result<OciImage> {
    let layout = OciLayout::open(dir)?;
    let selector = match tag {
        Some(tag) => LayoutSelector::Tag(tag.to_string()),
        None => LayoutSelector::Only,
    };
    let resolved = layout.resolve(&selector, platform)?;
    OciImage::from_layout(reference, layout, resolved, Some(scratch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::{build_tar, gzip, Member};
    use crate::oci::layout::tests::write_test_image;
    use crate::oci::tarball::tests::docker_save_tar;

    fn oci_layout_tar(tmp: &Path) -> (Vec<u8>, apptainer_core::digest::Digest) {
        let layout = OciLayout::create(&tmp.join("staging")).unwrap();
        let digest = write_test_image(&layout, b"oci-layer", Some("v1"));
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", layout.root()).unwrap();
        (builder.into_inner().unwrap(), digest)
    }

    #[test]
    fn test_read_oci_archive_gzip() {
        let tmp = TempDir::new().unwrap();
        let (tar, digest) = oci_layout_tar(tmp.path());
        let path = tmp.path().join("img.oci.tar.gz");
        fs::write(&path, gzip(&tar)).unwrap();

        let image = read_oci_archive(&path, None, &Platform::host(), None).unwrap();
        assert_eq!(image.digest(), &digest);
        let tagged = read_oci_archive(&path, Some("v1"), &Platform::host(), None).unwrap();
        assert_eq!(tagged.digest(), &digest);
    }

    #[test]
    fn test_docker_archive_with_oci_layout() {
        let tmp = TempDir::new().unwrap();
        let (tar, digest) = oci_layout_tar(tmp.path());
        let path = tmp.path().join("img.tar");
        fs::write(&path, tar).unwrap();

        let image = read_docker_archive(&path, None, &Platform::host(), None).unwrap();
        assert_eq!(image.digest(), &digest);
    }

    #[test]
    fn test_docker_archive_docker_save() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("img.tar");
        fs::write(&path, docker_save_tar("busybox:1", b"bb")).unwrap();
        let image = read_docker_archive(&path, None, &Platform::host(), None).unwrap();
        assert_eq!(image.layers().len(), 1);
    }

    #[test]
    fn test_missing_and_unknown() {
        let tmp = TempDir::new().unwrap();
        let err = read_oci_archive(&tmp.path().join("none.tar"), None, &Platform::host(), None).unwrap_err();
        assert!(matches!(err, ApptainerError::SourceMissing(_)));

        let junk = tmp.path().join("junk.tar");
        fs::write(&junk, build_tar(&[Member::file("hello.txt", b"hi")])).unwrap();
        let err = read_docker_archive(&junk, None, &Platform::host(), None).unwrap_err();
        assert!(matches!(err, ApptainerError::ArchiveUnknown(_)));
        let err = read_oci_archive(&junk, None, &Platform::host(), None).unwrap_err();
        assert!(matches!(err, ApptainerError::ArchiveUnknown(_)));
    }

    #[test]
    fn test_symlinked_index_is_not_a_layout() {
        let tmp = TempDir::new().unwrap();
        let junk = tmp.path().join("links.tar");
        fs::write(
            &junk,
            build_tar(&[
                Member::file("oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#),
                Member::file("real.json", b"{}"),
                Member::symlink("index.json", "real.json"),
            ]),
        )
        .unwrap();
        let err = read_docker_archive(&junk, None, &Platform::host(), None).unwrap_err();
        assert!(matches!(err, ApptainerError::ArchiveUnknown(_)));
    }

    #[tokio::test]
    async fn test_write_oci_archive_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let (tar, digest) = oci_layout_tar(tmp.path());
        let src = tmp.path().join("src.tar");
        fs::write(&src, tar).unwrap();
        let image = read_oci_archive(&src, None, &Platform::host(), None).unwrap();

        let out = tmp.path().join("out.tar");
        write_oci_archive(&Context::background(), &image, &out, Some("saved")).await.unwrap();
        let back = read_oci_archive(&out, Some("saved"), &Platform::host(), None).unwrap();
        assert_eq!(back.digest(), &digest);
    }
}
