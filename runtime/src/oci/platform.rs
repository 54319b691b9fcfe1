//! Target platform parsing, normalisation and manifest selection.

use std::fmt;

use apptainer_core::error::{ApptainerError, Result};
use oci_spec::image::Descriptor;

/// A target platform as `os/architecture[/variant]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// The platform of the running host.
    pub fn host() -> Self {
        let (architecture, variant) = normalize_arch(std::env::consts::ARCH, None);
        Self {
            os: "linux".to_string(),
            architecture,
            variant,
        }
    }

    /// Parse `os/arch[/variant]`. Only `linux` images can be run, so any
    /// other OS is rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let (os, arch, variant) = match parts.as_slice() {
            [os, arch] => (*os, *arch, None),
            [os, arch, variant] => (*os, *arch, Some(*variant)),
            _ => {
                return Err(ApptainerError::InvalidInput(format!(
                    "invalid platform '{}': expected os/arch[/variant]",
                    s
                )))
            }
        };
        if os.is_empty() || arch.is_empty() || variant.is_some_and(str::is_empty) {
            return Err(ApptainerError::InvalidInput(format!(
                "invalid platform '{}': empty component",
                s
            )));
        }
        if os != "linux" {
            return Err(ApptainerError::InvalidInput(format!(
                "unsupported platform OS '{}': only linux images can be run",
                os
            )));
        }
        let (architecture, variant) = normalize_arch(arch, variant);
        Ok(Self {
            os: os.to_string(),
            architecture,
            variant,
        })
    }

    /// Whether an index entry's platform satisfies this one.
    ///
    /// An unset requested variant accepts any variant.
    pub fn matches(&self, os: &str, arch: &str, variant: Option<&str>) -> bool {
        let (arch, variant) = normalize_arch(arch, variant);
        if self.os != os || self.architecture != arch {
            return false;
        }
        match self.variant {
            None => true,
            Some(ref want) => variant.as_deref() == Some(want.as_str()),
        }
    }

    pub fn matches_descriptor(&self, desc: &Descriptor) -> bool {
        desc.platform().as_ref().is_some_and(|p| {
            self.matches(
                &p.os().to_string(),
                &p.architecture().to_string(),
                p.variant().as_deref(),
            )
        })
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref v) = self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

/// Map architecture aliases onto their OCI names.
pub fn normalize_arch(arch: &str, variant: Option<&str>) -> (String, Option<String>) {
    let arch = arch.to_ascii_lowercase();
    let variant = variant.map(str::to_ascii_lowercase);
    match arch.as_str() {
        "x86_64" | "x86-64" | "amd64" => ("amd64".to_string(), None),
        "i386" | "i686" | "386" => ("386".to_string(), None),
        "aarch64" | "arm64" => match variant.as_deref() {
            None | Some("8") | Some("v8") => ("arm64".to_string(), None),
            Some(_) => ("arm64".to_string(), variant),
        },
        "armhf" => ("arm".to_string(), Some("v7".to_string())),
        "armel" => ("arm".to_string(), Some("v6".to_string())),
        "arm" => match variant.as_deref() {
            None | Some("7") | Some("v7") => ("arm".to_string(), Some("v7".to_string())),
            Some("5") | Some("v5") => ("arm".to_string(), Some("v5".to_string())),
            Some("6") | Some("v6") => ("arm".to_string(), Some("v6".to_string())),
            Some(_) => ("arm".to_string(), variant),
        },
        _ => (arch, variant),
    }
}

/// Attestation manifests are published with platform `unknown/unknown`.
pub fn is_attestation(desc: &Descriptor) -> bool {
    desc.platform().as_ref().is_some_and(|p| {
        p.os().to_string() == "unknown" && p.architecture().to_string() == "unknown"
    })
}

/// Pick the index entry for `platform`, skipping attestation entries.
///
/// An index whose only non-attestation entry carries no platform at all
/// yields that entry.
pub fn select_manifest<'a>(manifests: &'a [Descriptor], platform: &Platform) -> Option<&'a Descriptor> {
    let candidates: Vec<&Descriptor> = manifests.iter().filter(|d| !is_attestation(d)).collect();
    if let Some(found) = candidates.iter().find(|d| platform.matches_descriptor(d)) {
        return Some(found);
    }
    match candidates.as_slice() {
        [only] if only.platform().is_none() => Some(only),
        _ => None,
    }
}
