//! Registry credentials.
//!
//! Credentials come from, in order: explicit transport options, a docker
//! `config.json` style auth file, the persistent credential store at
//! `~/.apptainer/docker-config.json`, and finally anonymous access.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use apptainer_core::error::{ApptainerError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::reference::normalize_registry;

/// Username docker uses to mark an identity token in place of a password.
const TOKEN_USERNAME: &str = "<token>";

/// Credentials for one registry.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    /// Identity or bearer token.
    Token(String),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }

    /// Convert to oci-distribution auth.
    pub fn to_oci_auth(&self) -> oci_distribution::secrets::RegistryAuth {
        use oci_distribution::secrets::RegistryAuth;
        match self {
            Credentials::Anonymous => RegistryAuth::Anonymous,
            Credentials::Basic { username, password } => RegistryAuth::Basic(username.clone(), password.clone()),
            Credentials::Token(token) => RegistryAuth::Basic(TOKEN_USERNAME.to_string(), token.clone()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            Credentials::Token(_) => f.write_str("Token(***)"),
        }
    }
}

/// One entry of the `auths` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, rename = "identitytoken", skip_serializing_if = "Option::is_none")]
    identity_token: Option<String>,
}

impl AuthEntry {
    fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = self.identity_token.as_ref().filter(|t| !t.is_empty()) {
            return Some(Credentials::Token(token.clone()));
        }
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            return Some(Credentials::basic(u.clone(), p.clone()));
        }
        let decoded = BASE64.decode(self.auth.as_ref()?.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Credentials::basic(username, password))
    }
}

/// Docker `config.json` layout; unknown keys are kept on rewrite.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

/// A docker-format auth file.
#[derive(Debug, Clone)]
pub struct AuthFile {
    path: PathBuf,
}

impl AuthFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Credentials recorded for `registry`, matching on normalized host.
    ///
    /// Keys may carry a scheme and path (`https://index.docker.io/v1/`).
    pub fn get(&self, registry: &str) -> Result<Option<Credentials>> {
        let config = self.load()?;
        let wanted = normalize_registry(registry);
        Ok(config
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(auth_key_host(key)) == wanted)
            .and_then(|(_, entry)| entry.credentials()))
    }

    /// Record credentials for `registry`, replacing existing ones.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut config = self.load()?;
        let host = normalize_registry(registry);
        config.auths.retain(|key, _| normalize_registry(auth_key_host(key)) != host);
        config.auths.insert(
            host,
            AuthEntry {
                auth: Some(BASE64.encode(format!("{}:{}", username, password))),
                ..Default::default()
            },
        );
        self.save(&config)
    }

    /// Remove credentials for `registry`. Returns whether any existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut config = self.load()?;
        let host = normalize_registry(registry);
        let before = config.auths.len();
        config.auths.retain(|key, _| normalize_registry(auth_key_host(key)) != host);
        let removed = config.auths.len() != before;
        if removed {
            self.save(&config)?;
        }
        Ok(removed)
    }

    /// Registries with stored credentials, sorted.
    pub fn registries(&self) -> Result<Vec<String>> {
        let config = self.load()?;
        let mut hosts: Vec<String> = config
            .auths
            .keys()
            .map(|k| normalize_registry(auth_key_host(k)))
            .collect();
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }

    fn load(&self) -> Result<AuthConfig> {
        if !self.path.exists() {
            return Ok(AuthConfig::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            ApptainerError::ConfigError(format!("failed to read auth file {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            ApptainerError::ConfigError(format!("failed to parse auth file {}: {}", self.path.display(), e))
        })
    }

    fn save(&self, config: &AuthConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::fs::ensure_dir(parent)?;
        }
        let staged = crate::fs::sibling_temp_path(&self.path, "tmp");
        let data = serde_json::to_string_pretty(config)?;
        let written = std::fs::write(&staged, data).and_then(|_| {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))?;
            std::fs::rename(&staged, &self.path)
        });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&staged);
            return Err(ApptainerError::ConfigError(format!(
                "failed to write auth file {}: {}",
                self.path.display(),
                e
            )));
        }
        Ok(())
    }
}

/// The persistent credential store written by `registry login`.
pub fn credential_store() -> Option<AuthFile> {
    dirs::home_dir().map(|home| AuthFile::new(home.join(".apptainer").join("docker-config.json")))
}

/// Auth file to consult: explicit path, `REGISTRY_AUTH_FILE`,
/// `$DOCKER_CONFIG/config.json`, then `~/.docker/config.json`.
pub fn auth_file_path<F>(explicit: Option<&Path>, lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = lookup("REGISTRY_AUTH_FILE").filter(|s| !s.is_empty()) {
        return Some(PathBuf::from(path));
    }
    if let Some(dir) = lookup("DOCKER_CONFIG").filter(|s| !s.is_empty()) {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
}

/// Resolve credentials for `registry`.
pub fn resolve_credentials<F>(
    registry: &str,
    explicit: Option<&Credentials>,
    auth_file: Option<&Path>,
    store: Option<&AuthFile>,
    lookup: F,
) -> Result<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(creds) = explicit.filter(|c| !c.is_anonymous()) {
        return Ok(creds.clone());
    }
    if let Some(path) = auth_file_path(auth_file, &lookup) {
        match AuthFile::new(&path).get(registry) {
            Ok(Some(creds)) => {
                tracing::debug!(registry, auth_file = %path.display(), "Using credentials from auth file");
                return Ok(creds);
            }
            Ok(None) => {}
            // An explicitly named file must be readable.
            Err(e) if auth_file.is_some() => return Err(e),
            Err(e) => tracing::warn!(auth_file = %path.display(), error = %e, "Ignoring unreadable auth file"),
        }
    }
    if let Some(store) = store {
        if let Some(creds) = store.get(registry)? {
            tracing::debug!(registry, "Using credentials from credential store");
            return Ok(creds);
        }
    }
    Ok(Credentials::Anonymous)
}

/// Host part of an `auths` key.
fn auth_key_host(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key)
}
