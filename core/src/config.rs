use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ApptainerError, Result};

/// Default library service endpoint.
pub const DEFAULT_LIBRARY_URL: &str = "https://library.sylabs.io";

/// Runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Image cache settings
    pub cache: CacheConfig,

    /// OCI registry settings
    pub registry: RegistryConfig,

    /// Library service settings
    pub library: LibraryConfig,

    /// Cgroups manager settings
    pub cgroups: CgroupsConfig,

    /// Subordinate id databases
    pub fakeroot: FakerootConfig,
}

impl RuntimeConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            tracing::debug!(path = %path.display(), "Loading runtime configuration");
            let data = std::fs::read_to_string(path).map_err(|e| {
                ApptainerError::ConfigError(format!("failed to read {}: {}", path.display(), e))
            })?;
            toml::from_str(&data).map_err(|e| {
                ApptainerError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
            })?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `APPTAINER_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("APPTAINER_CACHEDIR").filter(|s| !s.is_empty()) {
            tracing::debug!(cache_dir = %dir, "Cache root overridden by APPTAINER_CACHEDIR");
            self.cache.root = Some(PathBuf::from(dir));
        }
        if let Some(v) = lookup("APPTAINER_DISABLE_CACHE") {
            self.cache.disabled = parse_bool(&v);
            tracing::debug!(disabled = self.cache.disabled, "Cache state set by APPTAINER_DISABLE_CACHE");
        }
        if let Some(url) = lookup("APPTAINER_LIBRARY").filter(|s| !s.is_empty()) {
            tracing::debug!(url = %url, "Library endpoint overridden by APPTAINER_LIBRARY");
            self.library.base_url = url;
        }
        if let Some(token) = lookup("APPTAINER_LIBRARY_TOKEN").filter(|s| !s.is_empty()) {
            tracing::debug!("Library token taken from APPTAINER_LIBRARY_TOKEN");
            self.library.auth_token = Some(token);
        }
        if let Some(v) = lookup("APPTAINER_SYSTEMD_CGROUPS") {
            self.cgroups.systemd = parse_bool(&v);
            tracing::debug!(systemd = self.cgroups.systemd, "Cgroups manager set by APPTAINER_SYSTEMD_CGROUPS");
        }
    }
}

/// Image cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; resolved from XDG/home when unset
    pub root: Option<PathBuf>,

    /// Route every download through a temporary directory
    pub disabled: bool,
}

impl CacheConfig {
    /// Effective cache root.
    ///
    /// `$XDG_CACHE_HOME/apptainer`, else `~/.apptainer/cache`.
    pub fn resolve_root(&self) -> PathBuf {
        if let Some(ref root) = self.root {
            return root.clone();
        }
        if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(xdg).join("apptainer");
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".apptainer")
            .join("cache")
    }
}

/// Registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host rewrite table (e.g. "docker.io" -> "mirror.example.org")
    pub mirrors: HashMap<String, String>,

    /// Use plain HTTP and skip TLS verification
    pub insecure: bool,

    /// Docker-style auth file
    pub auth_file: Option<PathBuf>,
}

/// Library service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Base URL of the library service
    pub base_url: String,

    /// Bearer token
    pub auth_token: Option<String>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LIBRARY_URL.to_string(),
            auth_token: None,
        }
    }
}

/// Cgroups configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupsConfig {
    /// Use the systemd cgroup manager instead of cgroupfs
    pub systemd: bool,
}

/// Subordinate id database locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakerootConfig {
    pub subuid_path: PathBuf,
    pub subgid_path: PathBuf,
}

impl Default for FakerootConfig {
    fn default() -> Self {
        Self {
            subuid_path: PathBuf::from("/etc/subuid"),
            subgid_path: PathBuf::from("/etc/subgid"),
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
