//! Container library service client.
//!
//! Resolves `library://` references to image metadata, downloads SIF
//! images, and answers identity / token queries for the logged-in user.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use apptainer_core::config::LibraryConfig;
use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::context::Context;
use crate::oci::progress::{ProgressFactory, ProgressWriter};

const DEFAULT_TAG: &str = "latest";

/// Hard limit on the user endpoint when the caller set no deadline.
pub const USER_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(5);

/// A `library://[host/]path[:tag1,tag2]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRef {
    pub host: Option<String>,
    pub path: String,
    pub tags: Vec<String>,
}

impl LibraryRef {
    /// Parse a reference with or without the `library://` prefix.
    ///
    /// Paths with more than two slashes carry a host as first component.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference
            .trim()
            .trim_start_matches("library://")
            .trim_start_matches('/');

        let (host, path_ref) = if reference.matches('/').count() > 2 {
            match reference.split_once('/') {
                Some((host, rest)) => (Some(host.to_string()), rest),
                None => (None, reference),
            }
        } else {
            (None, reference)
        };

        let (path, tags) = match path_ref.split_once(':') {
            Some((path, tags)) => (
                path,
                tags.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>(),
            ),
            None => (path_ref, vec![DEFAULT_TAG.to_string()]),
        };
        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(ApptainerError::InvalidInput(format!(
                "invalid library reference '{}'",
                reference
            )));
        }
        if tags.is_empty() {
            return Err(ApptainerError::InvalidInput(format!(
                "empty tag list in library reference '{}'",
                reference
            )));
        }

        Ok(Self {
            host: host.map(|h| h.to_string()),
            path: path.to_string(),
            tags,
        })
    }

    /// First tag, used for pulls.
    pub fn tag(&self) -> &str {
        self.tags.first().map(String::as_str).unwrap_or(DEFAULT_TAG)
    }
}

impl fmt::Display for LibraryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref host) = self.host {
            write!(f, "{}/", host)?;
        }
        write!(f, "{}:{}", self.path, self.tags.join(","))
    }
}

/// Image metadata returned by the library.
#[derive(Debug, Clone)]
pub struct LibraryImage {
    pub hash: Digest,
    pub size: u64,
    pub arch: Option<String>,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: ImageData,
}

#[derive(Deserialize)]
struct ImageData {
    hash: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    arch: Option<String>,
}

/// The authenticated library user.
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryUser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "realname")]
    pub real_name: String,
    #[serde(default, rename = "oidc_user_meta")]
    pub oidc: Option<OidcMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OidcMeta {
    #[serde(default)]
    pub secret: String,
}

#[derive(Deserialize)]
struct UserResponse {
    #[serde(rename = "userData")]
    user_data: LibraryUser,
}

/// HTTP client for the library service API.
#[derive(Clone)]
pub struct LibraryClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    progress: Option<Arc<dyn ProgressFactory>>,
}

impl LibraryClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("apptainer/{}", crate::VERSION))
            .build()
            .map_err(|e| ApptainerError::LibraryError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            progress: None,
        })
    }

    /// Client for `reference`, honouring an explicit host in it.
    pub fn for_ref(config: &LibraryConfig, reference: &LibraryRef) -> Result<Self> {
        let base = match reference.host {
            Some(ref host) => format!("https://{}", host),
            None => config.base_url.clone(),
        };
        Self::new(&base, config.auth_token.clone())
    }

    pub fn with_progress(mut self, progress: Option<Arc<dyn ProgressFactory>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        match self.token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Look up the image for `reference` and architecture.
    pub async fn get_image(&self, ctx: &Context, reference: &LibraryRef, arch: &str) -> Result<LibraryImage> {
        let url = format!(
            "{}/v1/images/{}:{}?arch={}",
            self.base_url,
            reference.path,
            reference.tag(),
            arch
        );
        tracing::debug!(url = %url, "Fetching library image metadata");

        ctx.run("library image lookup", async {
            let response = self
                .get(&url)
                .send()
                .await
                .map_err(|e| ApptainerError::LibraryError(format!("request to {} failed: {}", url, e)))?;
            let response = check_status(response, &format!("{}:{} ({})", reference.path, reference.tag(), arch))?;
            let body: ImageResponse = response
                .json()
                .await
                .map_err(|e| ApptainerError::LibraryError(format!("invalid image response: {}", e)))?;
            Ok::<_, ApptainerError>(LibraryImage {
                hash: Digest::from_library_hash(&body.data.hash)?,
                size: body.data.size,
                arch: body.data.arch,
            })
        })
        .await
    }

    /// Stream the image file for `reference` into `dst`.
    ///
    /// A partial `dst` is removed on failure or cancellation by the caller's
    /// cache reservation; when writing outside the cache it is removed here.
    pub async fn download_image(&self, ctx: &Context, reference: &LibraryRef, arch: &str, dst: &Path) -> Result<()> {
        let url = format!(
            "{}/v1/imagefile/{}:{}?arch={}",
            self.base_url,
            reference.path,
            reference.tag(),
            arch
        );
        tracing::info!(reference = %reference, arch, "Downloading library image");

        let result = ctx
            .run("library image download", async {
                let response = self
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| ApptainerError::LibraryError(format!("request to {} failed: {}", url, e)))?;
                let response = check_status(response, &reference.to_string())?;
                let total = response.content_length();
                stream_to_file(response, dst, self.progress.as_deref(), &reference.path, total).await
            })
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dst).await;
        }
        result
    }

    /// Fetch the current user from `/v1/rbac/users/current`.
    pub async fn current_user(&self, ctx: &Context) -> Result<LibraryUser> {
        if self.token.is_none() {
            return Err(ApptainerError::PermissionDenied(
                "no library token configured".to_string(),
            ));
        }
        let ctx = match ctx.deadline() {
            Some(_) => ctx.child(),
            None => ctx.with_timeout(USER_ENDPOINT_TIMEOUT),
        };
        let url = format!("{}/v1/rbac/users/current", self.base_url);

        ctx.run("library user lookup", async {
            let response = self
                .get(&url)
                .send()
                .await
                .map_err(|e| ApptainerError::LibraryError(format!("request to {} failed: {}", url, e)))?;
            let response = check_status(response, "current user")?;
            let body: UserResponse = response
                .json()
                .await
                .map_err(|e| ApptainerError::LibraryError(format!("invalid user response: {}", e)))?;
            Ok::<_, ApptainerError>(body.user_data)
        })
        .await
    }

    /// `Real Name <email>` of the current user, falling back to the username.
    pub async fn get_identity(&self, ctx: &Context) -> Result<String> {
        let user = self.current_user(ctx).await?;
        Ok(match (user.real_name.is_empty(), user.email.is_empty()) {
            (false, false) => format!("{} <{}>", user.real_name, user.email),
            (true, false) => user.email,
            _ => user.username,
        })
    }

    /// OIDC secret usable as a registry password for the library's OCI endpoint.
    pub async fn get_oci_token(&self, ctx: &Context) -> Result<String> {
        let user = self.current_user(ctx).await?;
        user.oidc
            .map(|o| o.secret)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApptainerError::NotFound("no OCI token for library user".to_string()))
    }
}

fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status.as_u16() {
        404 => ApptainerError::NotFound(format!("image does not exist in the library: {}", what)),
        401 | 403 => ApptainerError::PermissionDenied(format!("library refused access to {} ({})", what, status)),
        _ => ApptainerError::LibraryError(format!("library returned {} for {}", status, what)),
    })
}

/// Stream an HTTP body into a new file at `dst`, reporting progress.
pub(crate) async fn stream_to_file(
    response: reqwest::Response,
    dst: &Path,
    progress: Option<&dyn ProgressFactory>,
    label: &str,
    total: Option<u64>,
) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(dst)
        .await
        .map_err(|e| {
            ApptainerError::IoError(std::io::Error::new(
                e.kind(),
                format!("failed to open {} for writing: {}", dst.display(), e),
            ))
        })?;
    let mut writer = ProgressWriter::new(file, progress, label, total);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApptainerError::LibraryError(format!("download interrupted: {}", e)))?;
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;
    writer.get_mut().sync_all().await?;
    writer.complete();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fake_http, Route};
    use tempfile::TempDir;

    #[test]
    fn test_parse_short_forms() {
        let r = LibraryRef::parse("library://alpine").unwrap();
        assert_eq!(r.host, None);
        assert_eq!(r.path, "alpine");
        assert_eq!(r.tags, vec!["latest"]);

        let r = LibraryRef::parse("entity/collection/container:1.0,stable").unwrap();
        assert_eq!(r.host, None);
        assert_eq!(r.path, "entity/collection/container");
        assert_eq!(r.tags, vec!["1.0", "stable"]);
        assert_eq!(r.tag(), "1.0");
    }

    #[test]
    fn test_parse_with_host() {
        let r = LibraryRef::parse("library://library.example.org/entity/collection/container:v1").unwrap();
        assert_eq!(r.host.as_deref(), Some("library.example.org"));
        assert_eq!(r.path, "entity/collection/container");
        assert_eq!(r.to_string(), "library.example.org/entity/collection/container:v1");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(LibraryRef::parse("").is_err());
        assert!(LibraryRef::parse("a//b").is_err());
        assert!(LibraryRef::parse("alpine:,").is_err());
    }

    #[tokio::test]
    async fn test_get_image_and_download() {
        let body = b"SIF image bytes".to_vec();
        let digest = Digest::of_bytes(&body);
        let meta = format!(
            r#"{{"data":{{"hash":"{}","size":{},"arch":"amd64"}}}}"#,
            digest.to_library_hash(),
            body.len()
        );
        let server = fake_http(vec![
            Route::get("/v1/images/alpine:latest?arch=amd64", 200, meta),
            Route::get("/v1/imagefile/alpine:latest?arch=amd64", 200, body.clone()),
        ])
        .await;

        let client = LibraryClient::new(&server.base_url, Some("secret".to_string())).unwrap();
        let r = LibraryRef::parse("alpine").unwrap();
        let ctx = Context::background();

        let image = client.get_image(&ctx, &r, "amd64").await.unwrap();
        assert_eq!(image.hash, digest);
        assert_eq!(image.size, body.len() as u64);

        let tmp = TempDir::new().unwrap();
        let dst = tmp.path().join("alpine.sif");
        client.download_image(&ctx, &r, "amd64", &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), body);

        let seen = server.seen.lock();
        assert!(seen.iter().all(|s| s.header("authorization") == Some("Bearer secret")));
    }

    #[tokio::test]
    async fn test_get_image_not_found() {
        let server = fake_http(vec![]).await;
        let client = LibraryClient::new(&server.base_url, None).unwrap();
        let r = LibraryRef::parse("missing/image").unwrap();
        let err = client
            .get_image(&Context::background(), &r, "amd64")
            .await
            .unwrap_err();
        assert!(matches!(err, ApptainerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_identity_and_token() {
        let user = r#"{"userData":{"username":"jdoe","email":"jdoe@example.org","realname":"J Doe","oidc_user_meta":{"secret":"tok123"}}}"#;
        let server = fake_http(vec![Route::get("/v1/rbac/users/current", 200, user)]).await;
        let client = LibraryClient::new(&server.base_url, Some("t".to_string())).unwrap();
        let ctx = Context::background();

        assert_eq!(client.get_identity(&ctx).await.unwrap(), "J Doe <jdoe@example.org>");
        assert_eq!(client.get_oci_token(&ctx).await.unwrap(), "tok123");
    }

    #[tokio::test]
    async fn test_current_user_requires_token() {
        let client = LibraryClient::new("http://127.0.0.1:9", None).unwrap();
        let err = client.current_user(&Context::background()).await.unwrap_err();
        assert!(matches!(err, ApptainerError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_user_endpoint_times_out() {
        // Accept connections but never answer.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((s, _)) = listener.accept().await {
                held.push(s);
            }
        });
        let client = LibraryClient::new(&format!("http://{}", addr), Some("t".to_string())).unwrap();
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let err = client.current_user(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("deadline exceeded"));
    }
}
