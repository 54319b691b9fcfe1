use thiserror::Error;

/// Coarse classification of every error the runtime can surface.
///
/// Callers that need to decide policy (retry, downgrade, report) match on
/// the kind instead of individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    PermissionDenied,
    Integrity,
    ScopeViolation,
    Io,
    Unsupported,
    Conflict,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::NotFound => "not-found",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::Integrity => "integrity",
            ErrorKind::ScopeViolation => "scope-violation",
            ErrorKind::Io => "io",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// Apptainer core error types
#[derive(Error, Debug)]
pub enum ApptainerError {
    /// Caller supplied something that cannot be interpreted
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A digest string is not `algorithm:hex` with the right length
    #[error("Malformed digest: {0}")]
    MalformedDigest(String),

    /// Image URI names a transport we do not handle
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Generic missing object (image, tag, user, cache entry)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Archive or layout path given on the command line does not exist
    #[error("Source missing: {0}")]
    SourceMissing(String),

    /// No manifest satisfies the requested platform
    #[error("Manifest not found for {reference} (platform {platform})")]
    ManifestNotFound { reference: String, platform: String },

    /// OCI layout holds several images and no digest was given
    #[error("Ambiguous OCI layout: {0}")]
    AmbiguousLayout(String),

    /// No subordinate id range satisfies the selection rules
    #[error("No valid subid mapping: {0}")]
    NoValidMapping(String),

    /// Access refused (auth, rootless gate, file permissions)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Content hash differs from the expected digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// ORAS artifact is not a single-layer SIF
    #[error("ORAS artifact is not a SIF image: {0}")]
    OrasNotASif(String),

    /// Archive content could not be classified as any known image format
    #[error("Unknown archive format: {0}")]
    ArchiveUnknown(String),

    /// Corrupt or malformed image data
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Archive entry would land outside the extraction directory
    #[error("Illegal path in archive: {0}")]
    IllegalPath(String),

    /// Link target resolves outside the extraction root
    #[error("Link escapes extraction root: {link} -> {target}")]
    LinkEscape { link: String, target: String },

    /// Unified cgroup keys requested on a v1 host
    #[error("Unified resources are not supported on cgroups v1")]
    UnifiedOnV1,

    /// Controller or resource name not known to the backend
    #[error("Unsupported cgroup resource: {0}")]
    UnsupportedResource(String),

    /// systemd cgroup manager requested but the bus cannot be reached
    #[error("systemd unavailable: {0}")]
    SystemdUnavailable(String),

    /// Generic cgroup failure
    #[error("Cgroup error: {0}")]
    CgroupError(String),

    /// No free slot left for a new subid range
    #[error("Subid range exhausted: {0}")]
    RangeExhausted(String),

    /// Object already exists or is busy
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Feature not compiled in or not applicable
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Library service error
    #[error("Library error: {0}")]
    LibraryError(String),

    /// Cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Operation cancelled or deadline exceeded
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ApptainerError {
    /// Map this error to its kind.
    pub fn kind(&self) -> ErrorKind {
        use ApptainerError::*;
        match self {
            InvalidInput(_) | MalformedDigest(_) | ConfigError(_) | SerializationError(_) => {
                ErrorKind::InvalidInput
            }
            NotFound(_) | SourceMissing(_) | ManifestNotFound { .. } | NoValidMapping(_) => {
                ErrorKind::NotFound
            }
            AmbiguousLayout(_) => ErrorKind::InvalidInput,
            PermissionDenied(_) => ErrorKind::PermissionDenied,
            DigestMismatch { .. } | OrasNotASif(_) | ArchiveUnknown(_) | OciImageError(_) => {
                ErrorKind::Integrity
            }
            IllegalPath(_) | LinkEscape { .. } => ErrorKind::ScopeViolation,
            UnifiedOnV1 | UnsupportedResource(_) | UnsupportedTransport(_) | Unsupported(_) => {
                ErrorKind::Unsupported
            }
            SystemdUnavailable(_) => ErrorKind::Unsupported,
            RangeExhausted(_) | Conflict(_) => ErrorKind::Conflict,
            IoError(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionDenied
            }
            IoError(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            CgroupError(_) | RegistryError { .. } | LibraryError(_) | CacheError(_)
            | TimeoutError(_) | IoError(_) | Other(_) => ErrorKind::Io,
        }
    }
}

impl From<serde_json::Error> for ApptainerError {
    fn from(err: serde_json::Error) -> Self {
        ApptainerError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for ApptainerError {
    fn from(err: toml::de::Error) -> Self {
        ApptainerError::SerializationError(err.to_string())
    }
}

/// Result type alias for Apptainer core operations
pub type Result<T> = std::result::Result<T, ApptainerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_mismatch_display() {
        let error = ApptainerError::DigestMismatch {
            expected: "sha256:aa".to_string(),
            actual: "sha256:bb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Digest mismatch: expected sha256:aa, got sha256:bb"
        );
        assert_eq!(error.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_manifest_not_found_display() {
        let error = ApptainerError::ManifestNotFound {
            reference: "docker.io/library/alpine:latest".to_string(),
            platform: "linux/s390x".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Manifest not found for docker.io/library/alpine:latest (platform linux/s390x)"
        );
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_link_escape_is_scope_violation() {
        let error = ApptainerError::LinkEscape {
            link: "bin/sh".to_string(),
            target: "../../etc/passwd".to_string(),
        };
        assert_eq!(error.kind(), ErrorKind::ScopeViolation);
        assert!(error.to_string().contains("bin/sh -> ../../etc/passwd"));
    }

    #[test]
    fn test_illegal_path_is_scope_violation() {
        let error = ApptainerError::IllegalPath("../../etc/passwd".to_string());
        assert_eq!(error.kind(), ErrorKind::ScopeViolation);
    }

    #[test]
    fn test_unified_on_v1_display() {
        let error = ApptainerError::UnifiedOnV1;
        assert_eq!(
            error.to_string(),
            "Unified resources are not supported on cgroups v1"
        );
        assert_eq!(error.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_conflict_kinds() {
        assert_eq!(
            ApptainerError::Conflict("user exists".to_string()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            ApptainerError::RangeExhausted("no slot".to_string()).kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ApptainerError = io_error.into();
        assert!(matches!(error, ApptainerError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_io_permission_error_kind() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let error: ApptainerError = io_error.into();
        assert_eq!(error.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: ApptainerError = err.into();
        assert!(matches!(error, ApptainerError::SerializationError(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let err = toml::from_str::<toml::Value>("= nope").unwrap_err();
        let error: ApptainerError = err.into();
        assert!(matches!(error, ApptainerError::SerializationError(_)));
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ScopeViolation.to_string(), "scope-violation");
        assert_eq!(ErrorKind::InvalidInput.to_string(), "invalid-input");
    }

    #[test]
    fn test_registry_error_display() {
        let error = ApptainerError::RegistryError {
            registry: "ghcr.io".to_string(),
            message: "unauthorized".to_string(),
        };
        assert_eq!(error.to_string(), "Registry error: ghcr.io - unauthorized");
        assert_eq!(error.kind(), ErrorKind::Io);
    }
}
