//! Content digests.
//!
//! Digests are carried as `(algorithm, hex)` and rendered as `sha256:<hex>`.
//! Only sha256 is accepted.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::{ApptainerError, Result};

/// The only supported digest algorithm.
pub const SHA256: &str = "sha256";

const SHA256_HEX_LEN: usize = 64;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// A canonical content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse `algo:hex`.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| ApptainerError::MalformedDigest(format!("'{}': expected algorithm:hex", s)))?;

        if algorithm != SHA256 {
            return Err(ApptainerError::MalformedDigest(format!(
                "'{}': unsupported algorithm '{}'",
                s, algorithm
            )));
        }
        Self::from_hex(hex).map_err(|_| {
            ApptainerError::MalformedDigest(format!(
                "'{}': expected {} lowercase hex characters",
                s, SHA256_HEX_LEN
            ))
        })
    }

    /// Build a sha256 digest from its hex part.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let valid = hex.len() == SHA256_HEX_LEN
            && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(ApptainerError::MalformedDigest(hex.to_string()));
        }
        Ok(Self {
            algorithm: SHA256.to_string(),
            hex: hex.to_string(),
        })
    }

    /// Parse the library service form `sha256.<hex>`.
    pub fn from_library_hash(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((SHA256, hex)) => Self::from_hex(hex),
            _ => Err(ApptainerError::MalformedDigest(format!(
                "'{}': expected sha256.<hex>",
                s
            ))),
        }
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(Sha256::digest(bytes)),
        }
    }

    /// Digest of everything a reader yields.
    pub fn of_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(hasher.finalize()),
        })
    }

    /// Digest of a file, streamed.
    pub fn of_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            ApptainerError::IoError(std::io::Error::new(
                e.kind(),
                format!("failed to open {} for hashing: {}", path.display(), e),
            ))
        })?;
        Self::of_reader(file)
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Library service rendering, `sha256.<hex>`.
    pub fn to_library_hash(&self) -> String {
        format!("{}.{}", self.algorithm, self.hex)
    }

    /// Constant-time comparison of the hex part.
    pub fn ct_eq(&self, other: &Digest) -> bool {
        if self.algorithm != other.algorithm || self.hex.len() != other.hex.len() {
            return false;
        }
        self.hex
            .bytes()
            .zip(other.hex.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = ApptainerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_of_bytes_empty() {
        let d = Digest::of_bytes(b"");
        assert_eq!(d.to_string(), format!("sha256:{}", EMPTY));
        assert_eq!(d.algorithm(), "sha256");
    }

    #[test]
    fn test_of_path_matches_of_bytes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();

        let from_path = Digest::of_path(&path).unwrap();
        assert_eq!(from_path, Digest::of_bytes(&data));
        assert_eq!(Digest::parse(&from_path.to_string()).unwrap(), from_path);
    }

    #[test]
    fn test_of_path_missing_file() {
        let err = Digest::of_path(Path::new("/nonexistent/blob")).unwrap_err();
        assert!(matches!(err, ApptainerError::IoError(_)));
    }

    #[test]
    fn test_parse_rejects_missing_colon() {
        assert!(matches!(
            Digest::parse(EMPTY),
            Err(ApptainerError::MalformedDigest(_))
        ));
    }

    #[test]
    fn test_parse_rejects_short_hex() {
        assert!(Digest::parse("sha256:abc").is_err());
    }

    #[test]
    fn test_parse_rejects_uppercase_hex() {
        let upper = EMPTY.to_uppercase();
        assert!(Digest::parse(&format!("sha256:{}", upper)).is_err());
    }

    #[test]
    fn test_parse_rejects_other_algorithm() {
        assert!(Digest::parse(&format!("sha512:{}", EMPTY)).is_err());
    }

    #[test]
    fn test_from_str() {
        let d: Digest = format!("sha256:{}", EMPTY).parse().unwrap();
        assert_eq!(d.hex(), EMPTY);
    }

    #[test]
    fn test_library_hash_roundtrip() {
        let d = Digest::from_library_hash(&format!("sha256.{}", EMPTY)).unwrap();
        assert_eq!(d.to_library_hash(), format!("sha256.{}", EMPTY));
        assert!(Digest::from_library_hash("md5.abc").is_err());
    }

    #[test]
    fn test_ct_eq() {
        let a = Digest::of_bytes(b"a");
        let b = Digest::of_bytes(b"b");
        assert!(a.ct_eq(&a.clone()));
        assert!(!a.ct_eq(&b));
    }
}
