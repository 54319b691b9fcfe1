//! Registry image reference parsing.
//!
//! Parses references like `ghcr.io/apptainer/alpine:3.18` into structured
//! components, normalizing Docker Hub aliases and applying registry mirrors.

use std::collections::HashMap;

use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use oci_distribution::Reference;

/// Default registry when none is specified.
pub const DOCKER_HUB: &str = "docker.io";

/// Other names Docker Hub is reachable under.
const DOCKER_HUB_ALIASES: [&str; 2] = ["index.docker.io", "registry-1.docker.io"];

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed registry image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/alpine", "apptainer/lolcow")
    pub repository: String,
    /// Tag (e.g., "latest", "3.18")
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse a registry reference (without the `docker://` prefix).
    ///
    /// Supports formats:
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `alpine:3.18` → docker.io/library/alpine:3.18
    /// - `index.docker.io/alpine` → docker.io/library/alpine:latest
    /// - `localhost:5000/img` → localhost:5000/img:latest
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim().trim_start_matches("//");
        if reference.is_empty() {
            return Err(ApptainerError::InvalidInput("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (reference, None),
        };

        // A tag colon can only appear after the last slash; otherwise it is a port.
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon = last_segment_start + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if tag.as_deref() == Some("") {
            return Err(ApptainerError::InvalidInput(format!(
                "empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(name)?;
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ApptainerError::InvalidInput(format!(
                "repository name must be lowercase: '{}'",
                repository
            )));
        }

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        let (registry, repo) = match name.split_once('/') {
            // First component is a host when it has a dot, a port, or is localhost.
            Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (normalize_registry(first), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name.to_string()),
        };
        if repo.is_empty() || repo.split('/').any(str::is_empty) {
            return Err(ApptainerError::InvalidInput(format!(
                "invalid repository in reference '{}'",
                name
            )));
        }

        // Official Docker Hub images live under library/.
        let repo = if registry == DOCKER_HUB && !repo.contains('/') {
            format!("library/{}", repo)
        } else {
            repo
        };
        Ok((registry, repo))
    }

    /// Replace the registry host when it has a configured mirror.
    pub fn with_mirrors(mut self, mirrors: &HashMap<String, String>) -> Self {
        let mirror = mirrors
            .iter()
            .find(|(host, _)| normalize_registry(host) == self.registry)
            .map(|(_, mirror)| mirror.trim_end_matches('/').to_string());
        if let Some(mirror) = mirror {
            tracing::debug!(
                registry = %self.registry,
                mirror = %mirror,
                "Using registry mirror"
            );
            self.registry = mirror;
        }
        self
    }

    /// Convert to an oci-distribution reference.
    pub fn to_oci_reference(&self) -> Reference {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => {
                Reference::with_digest(self.registry.clone(), self.repository.clone(), digest.to_string())
            }
            (None, Some(tag)) => Reference::with_tag(self.registry.clone(), self.repository.clone(), tag.clone()),
            (None, None) => Reference::with_tag(
                self.registry.clone(),
                self.repository.clone(),
                DEFAULT_TAG.to_string(),
            ),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Canonical form of a registry host; Docker Hub aliases collapse to `docker.io`.
pub fn normalize_registry(host: &str) -> String {
    let host = host.trim_end_matches('/').to_ascii_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DOCKER_HUB.to_string()
    } else {
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("alpine:3.18").unwrap();
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, Some("3.18".to_string()));
    }

    #[test]
    fn test_parse_user_repo() {
        let r = ImageReference::parse("sylabsio/lolcow").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "sylabsio/lolcow");
    }

    #[test]
    fn test_docker_hub_aliases_normalized() {
        for host in ["index.docker.io", "registry-1.docker.io", "docker.io"] {
            let r = ImageReference::parse(&format!("{}/alpine", host)).unwrap();
            assert_eq!(r.registry, "docker.io");
            assert_eq!(r.repository, "library/alpine");
        }
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/test/img").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "test/img");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/image@sha256:{}", HEX)).unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.unwrap().hex(), HEX);
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        let err = ImageReference::parse("ghcr.io/org/image@sha256:xyz").unwrap_err();
        assert!(matches!(err, ApptainerError::MalformedDigest(_)));
    }

    #[test]
    fn test_parse_rejects_empty_and_uppercase() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("alpine:").is_err());
        assert!(ImageReference::parse("ghcr.io/Org/Image").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_mirror_rewrite() {
        let mut mirrors = HashMap::new();
        mirrors.insert("index.docker.io".to_string(), "mirror.example.org".to_string());
        let r = ImageReference::parse("alpine").unwrap().with_mirrors(&mirrors);
        assert_eq!(r.registry, "mirror.example.org");
        assert_eq!(r.repository, "library/alpine");

        let untouched = ImageReference::parse("quay.io/x/y").unwrap().with_mirrors(&mirrors);
        assert_eq!(untouched.registry, "quay.io");
    }

    #[test]
    fn test_to_oci_reference() {
        let r = ImageReference::parse("ghcr.io/apptainer/alpine:3.18").unwrap();
        assert_eq!(r.to_oci_reference().to_string(), "ghcr.io/apptainer/alpine:3.18");

        let r = ImageReference::parse(&format!("ghcr.io/apptainer/alpine@sha256:{}", HEX)).unwrap();
        assert!(r.to_oci_reference().to_string().ends_with(HEX));
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/alpine:latest");
    }
}
