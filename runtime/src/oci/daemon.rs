//! `docker-daemon:` transport.
//!
//! Talks plain HTTP/1.0 to the Docker Engine API over its unix socket;
//! images travel as `docker save` tarballs.

use std::path::{Path, PathBuf};

use apptainer_core::error::{ApptainerError, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::image::{scratch_dir, OciImage};
use super::tarball;
use crate::context::Context;

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Pick the daemon socket: explicit host, then `DOCKER_HOST`, then the default.
pub fn socket_path(explicit: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    let host = explicit
        .map(str::to_string)
        .or_else(|| lookup("DOCKER_HOST").filter(|h| !h.is_empty()));
    match host {
        None => Ok(PathBuf::from(DEFAULT_SOCKET)),
        Some(host) => match host.strip_prefix("unix://") {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Err(ApptainerError::UnsupportedTransport(format!(
                "docker host {} is not a unix socket",
                host
            ))),
        },
    }
}

pub struct DockerDaemon {
    socket: PathBuf,
}

impl DockerDaemon {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self { socket: socket.into() }
    }

    pub fn from_env(explicit: Option<&str>) -> Result<Self> {
        Ok(Self::new(socket_path(explicit, |k| std::env::var(k).ok())?))
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Export `name` from the daemon and open it as an image.
    pub async fn fetch(&self, ctx: &Context, name: &str, tmp_dir: Option<&Path>) -> Result<OciImage> {
        check_name(name)?;
        let scratch = scratch_dir(tmp_dir)?;
        let saved = scratch.path().join("image.tar");

        ctx.run("docker-daemon export", async {
            let mut stream = self.connect().await?;
            let request = format!("GET /images/{}/get HTTP/1.0\r\nHost: docker\r\n\r\n", name);
            stream.write_all(request.as_bytes()).await?;
            let mut reader = BufReader::new(stream);
            expect_ok(&mut reader, name).await?;
            let mut file = tokio::fs::File::create(&saved).await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            Ok::<_, ApptainerError>(())
        })
        .await?;

        tracing::debug!(name, socket = %self.socket.display(), "Exported image from docker daemon");
        let tmp_dir = tmp_dir.map(Path::to_path_buf);
        ctx.blocking("docker-daemon read", move || tarball::read_file(&saved, None, tmp_dir.as_deref()))
            .await
    }

    /// Load `image` into the daemon under `name`.
    pub async fn write(&self, ctx: &Context, image: &OciImage, name: &str, tmp_dir: Option<&Path>) -> Result<()> {
        check_name(name)?;
        let scratch = scratch_dir(tmp_dir)?;
        let staged = scratch.path().join("load.tar");
        tarball::write_file(ctx, image, &staged, Some(name)).await?;
        let size = tokio::fs::metadata(&staged).await?.len();

        ctx.run("docker-daemon load", async {
            let mut stream = self.connect().await?;
            let head = format!(
                "POST /images/load?quiet=1 HTTP/1.0\r\nHost: docker\r\nContent-Type: application/x-tar\r\nContent-Length: {}\r\n\r\n",
                size
            );
            stream.write_all(head.as_bytes()).await?;
            let mut file = tokio::fs::File::open(&staged).await?;
            tokio::io::copy(&mut file, &mut stream).await?;
            stream.flush().await?;
            let mut reader = BufReader::new(stream);
            expect_ok(&mut reader, name).await?;
            let mut body = String::new();
            reader.read_to_string(&mut body).await?;
            tracing::debug!(response = %body.trim(), "docker daemon load");
            Ok::<_, ApptainerError>(())
        })
        .await?;

        tracing::info!(name, digest = %image.digest(), "Loaded image into docker daemon");
        Ok(())
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ApptainerError::SourceMissing(format!(
                "docker daemon socket {} does not exist",
                self.socket.display()
            )),
            std::io::ErrorKind::PermissionDenied => ApptainerError::PermissionDenied(format!(
                "cannot connect to docker daemon at {}",
                self.socket.display()
            )),
            _ => ApptainerError::IoError(e),
        })
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
        return Err(ApptainerError::InvalidInput(format!(
            "invalid docker image name {:?}",
            name
        )));
    }
    Ok(())
}

/// Consume the status line and headers; anything but 2xx is an error.
async fn expect_ok<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R, name: &str) -> Result<()> {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ApptainerError::Other(format!("malformed docker daemon response: {:?}", status_line.trim()))
        })?;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    if (200..300).contains(&status) {
        return Ok(());
    }
    let mut body = String::new();
    let _ = reader.read_to_string(&mut body).await;
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    match status {
        404 => Err(ApptainerError::NotFound(format!("docker daemon: {}: {}", name, message))),
        _ => Err(ApptainerError::Other(format!(
            "docker daemon returned {} for {}: {}",
            status, name, message
        ))),
    }
}
