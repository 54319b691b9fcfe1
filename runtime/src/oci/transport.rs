//! Image URI → transport resolution.

use std::fmt;
use std::path::PathBuf;

use apptainer_core::digest::Digest;
use apptainer_core::error::{ApptainerError, Result};

use super::layout::LayoutSelector;
use super::reference::ImageReference;
use crate::library::LibraryRef;

/// Where an image comes from or goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Registry,
    OciLayout,
    OciArchive,
    DockerArchive,
    DockerDaemon,
    Tarball,
    Library,
    Oras,
    Http,
    Https,
}

impl Transport {
    /// Every supported transport, in URI-prefix form order.
    pub fn all() -> &'static [Transport] {
        &[
            Transport::Registry,
            Transport::OciLayout,
            Transport::OciArchive,
            Transport::DockerArchive,
            Transport::DockerDaemon,
            Transport::Tarball,
            Transport::Library,
            Transport::Oras,
            Transport::Http,
            Transport::Https,
        ]
    }

    /// Prefix as written in a URI.
    pub fn prefix(&self) -> &'static str {
        match self {
            Transport::Registry => "docker://",
            Transport::OciLayout => "oci:",
            Transport::OciArchive => "oci-archive:",
            Transport::DockerArchive => "docker-archive:",
            Transport::DockerDaemon => "docker-daemon:",
            Transport::Tarball => "tarball:",
            Transport::Library => "library://",
            Transport::Oras => "oras://",
            Transport::Http => "http://",
            Transport::Https => "https://",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Registry => "docker",
            Transport::OciLayout => "oci",
            Transport::OciArchive => "oci-archive",
            Transport::DockerArchive => "docker-archive",
            Transport::DockerDaemon => "docker-daemon",
            Transport::Tarball => "tarball",
            Transport::Library => "library",
            Transport::Oras => "oras",
            Transport::Http => "http",
            Transport::Https => "https",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|t| t.prefix().ends_with("://") && t.name() == scheme)
    }

    fn from_colon_prefix(prefix: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|t| !t.prefix().ends_with("://") && t.name() == prefix)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Split an image URI into its transport and the transport-specific reference.
///
/// `http(s)` keep the full URL as their reference.
pub fn parse_uri(uri: &str) -> Result<(Transport, String)> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(ApptainerError::InvalidInput("empty image URI".to_string()));
    }

    let (transport, rest) = if let Some((scheme, rest)) = uri.split_once("://") {
        let transport = Transport::from_scheme(scheme).ok_or_else(|| {
            ApptainerError::UnsupportedTransport(if scheme.is_empty() {
                format!("missing transport in '{}'", uri)
            } else {
                scheme.to_string()
            })
        })?;
        match transport {
            Transport::Http | Transport::Https => (transport, uri),
            _ => (transport, rest),
        }
    } else if let Some((prefix, rest)) = uri.split_once(':') {
        let transport = Transport::from_colon_prefix(prefix).ok_or_else(|| {
            ApptainerError::UnsupportedTransport(if prefix.is_empty() {
                format!("missing transport in '{}'", uri)
            } else {
                prefix.to_string()
            })
        })?;
        (transport, rest)
    } else {
        return Err(ApptainerError::UnsupportedTransport(format!(
            "missing transport in '{}'",
            uri
        )));
    };

    let empty = match transport {
        Transport::Http | Transport::Https => uri.len() <= transport.prefix().len(),
        _ => rest.is_empty(),
    };
    if empty {
        return Err(ApptainerError::InvalidInput(format!(
            "empty reference for transport {}",
            transport
        )));
    }
    Ok((transport, rest.to_string()))
}

/// A parsed image reference, one variant per transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Registry(ImageReference),
    OciLayout {
        dir: PathBuf,
        selector: LayoutSelector,
    },
    OciArchive {
        path: PathBuf,
        tag: Option<String>,
    },
    DockerArchive {
        path: PathBuf,
        tag: Option<String>,
    },
    /// Image name, `name:tag`, `name@digest` or id as known to the daemon.
    DockerDaemon {
        name: String,
    },
    Tarball {
        path: PathBuf,
    },
    Library(LibraryRef),
    Oras(ImageReference),
    Http {
        url: String,
    },
}

impl ImageRef {
    pub fn parse(uri: &str) -> Result<Self> {
        let (transport, rest) = parse_uri(uri)?;
        Self::from_parts(transport, &rest)
    }

    pub fn from_parts(transport: Transport, reference: &str) -> Result<Self> {
        Ok(match transport {
            Transport::Registry => ImageRef::Registry(ImageReference::parse(reference)?),
            Transport::Oras => ImageRef::Oras(ImageReference::parse(reference)?),
            Transport::OciLayout => {
                let (dir, selector) = match reference.rsplit_once('@') {
                    Some((dir, digest)) => (dir.to_string(), LayoutSelector::Digest(Digest::parse(digest)?)),
                    None => match split_path_tag(reference) {
                        (dir, Some(tag)) => (dir, LayoutSelector::Tag(tag)),
                        (dir, None) => (dir, LayoutSelector::Only),
                    },
                };
                ImageRef::OciLayout {
                    dir: PathBuf::from(non_empty(dir, transport)?),
                    selector,
                }
            }
            Transport::OciArchive => {
                let (path, tag) = split_path_tag(reference);
                ImageRef::OciArchive {
                    path: PathBuf::from(non_empty(path, transport)?),
                    tag,
                }
            }
            Transport::DockerArchive => {
                let (path, tag) = split_path_tag(reference);
                ImageRef::DockerArchive {
                    path: PathBuf::from(non_empty(path, transport)?),
                    tag,
                }
            }
            Transport::DockerDaemon => ImageRef::DockerDaemon {
                name: non_empty(reference.to_string(), transport)?,
            },
            Transport::Tarball => ImageRef::Tarball {
                path: PathBuf::from(non_empty(reference.to_string(), transport)?),
            },
            Transport::Library => ImageRef::Library(LibraryRef::parse(reference)?),
            Transport::Http | Transport::Https => ImageRef::Http {
                url: reference.to_string(),
            },
        })
    }

    pub fn transport(&self) -> Transport {
        match self {
            ImageRef::Registry(_) => Transport::Registry,
            ImageRef::OciLayout { .. } => Transport::OciLayout,
            ImageRef::OciArchive { .. } => Transport::OciArchive,
            ImageRef::DockerArchive { .. } => Transport::DockerArchive,
            ImageRef::DockerDaemon { .. } => Transport::DockerDaemon,
            ImageRef::Tarball { .. } => Transport::Tarball,
            ImageRef::Library(_) => Transport::Library,
            ImageRef::Oras(_) => Transport::Oras,
            ImageRef::Http { url } if url.starts_with("http://") => Transport::Http,
            ImageRef::Http { .. } => Transport::Https,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Registry(r) => write!(f, "docker://{}", r),
            ImageRef::Oras(r) => write!(f, "oras://{}", r),
            ImageRef::OciLayout { dir, selector } => {
                write!(f, "oci:{}", dir.display())?;
                match selector {
                    LayoutSelector::Only => Ok(()),
                    LayoutSelector::Digest(d) => write!(f, "@{}", d),
                    LayoutSelector::Tag(t) => write!(f, ":{}", t),
                }
            }
            ImageRef::OciArchive { path, tag } | ImageRef::DockerArchive { path, tag } => {
                write!(f, "{}{}", self.transport().prefix(), path.display())?;
                if let Some(tag) = tag {
                    write!(f, ":{}", tag)?;
                }
                Ok(())
            }
            ImageRef::DockerDaemon { name } => write!(f, "docker-daemon:{}", name),
            ImageRef::Tarball { path } => write!(f, "tarball:{}", path.display()),
            ImageRef::Library(r) => write!(f, "library://{}", r),
            ImageRef::Http { url } => f.write_str(url),
        }
    }
}

/// Split `path[:tag]`; a colon only marks a tag after the last slash.
fn split_path_tag(reference: &str) -> (String, Option<String>) {
    let last_segment = reference.rfind('/').map(|p| p + 1).unwrap_or(0);
    match reference[last_segment..].rfind(':') {
        Some(colon) if last_segment + colon + 1 < reference.len() => {
            let colon = last_segment + colon;
            (reference[..colon].to_string(), Some(reference[colon + 1..].to_string()))
        }
        Some(colon) => (reference[..last_segment + colon].to_string(), None),
        None => (reference.to_string(), None),
    }
}

fn non_empty(s: String, transport: Transport) -> Result<String> {
    if s.is_empty() {
        return Err(ApptainerError::InvalidInput(format!(
            "empty reference for transport {}",
            transport
        )));
    }
    Ok(s)
}
