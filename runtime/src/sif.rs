//! SIF files are opaque here apart from the header magic.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use apptainer_core::error::{ApptainerError, Result};

/// Offset of the magic, after the launch script.
const MAGIC_OFFSET: usize = 32;
const MAGIC: &[u8] = b"SIF_MAGIC";

/// Whether `header` starts like a SIF image.
pub fn has_sif_magic(header: &[u8]) -> bool {
    header.get(MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()) == Some(MAGIC)
}

/// Fail unless `path` is a SIF image.
pub fn ensure_sif(path: &Path) -> Result<()> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            ApptainerError::SourceMissing(format!("{} does not exist", path.display()))
        }
        _ => ApptainerError::IoError(e),
    })?;
    let mut header = [0u8; MAGIC_OFFSET + 16];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    if !has_sif_magic(&header[..filled]) {
        return Err(ApptainerError::InvalidInput(format!(
            "{} is not a SIF image",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Bytes that pass the magic check followed by `payload`.
    pub(crate) fn fake_sif(payload: &[u8]) -> Vec<u8> {
        let mut data = b"#!/usr/bin/env run-singularity\n\0".to_vec();
        data.resize(MAGIC_OFFSET, 0);
        data.extend_from_slice(b"SIF_MAGIC\0");
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_magic() {
        assert!(has_sif_magic(&fake_sif(b"")));
        assert!(!has_sif_magic(b"SIF_MAGIC"));
        assert!(!has_sif_magic(&[0u8; 64]));
    }

    #[test]
    fn test_ensure_sif() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.sif");
        std::fs::write(&good, fake_sif(b"data")).unwrap();
        ensure_sif(&good).unwrap();

        let bad = tmp.path().join("bad.sif");
        std::fs::write(&bad, b"short").unwrap();
        assert!(matches!(ensure_sif(&bad), Err(ApptainerError::InvalidInput(_))));
        assert!(matches!(
            ensure_sif(&tmp.path().join("none")),
            Err(ApptainerError::SourceMissing(_))
        ));
    }
}
