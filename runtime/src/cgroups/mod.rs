//! Cgroups manager.
//!
//! One control plane over four backends:
//!
//! ```text
//!              cgroupfs                 systemd
//!   v1   /sys/fs/cgroup/<ctrl>/<rel>   transient scope + per-controller files
//!   v2   /sys/fs/cgroup/<rel>          transient scope + unified files
//! ```
//!
//! Limits arrive in the OCI `linux.resources` shape ([`ResourceSpec`]) and
//! are translated per backend.

pub mod gate;
pub mod manager;
pub mod procfs;
pub mod resources;
pub mod systemd;
pub mod v1;
pub mod v2;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use apptainer_core::error::{ApptainerError, Result};

pub use gate::{check_rootless, GateVerdict};
pub use manager::{CgroupDriver, CgroupManager};
pub use procfs::{CgroupVersion, Hierarchy};
pub use resources::ResourceSpec;
pub use systemd::{Busctl, SystemdBus};

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const STATE_POLL_ATTEMPTS: usize = 500;

/// One realized group in one hierarchy version.
pub trait CgroupBackend: Send + Sync {
    fn version(&self) -> CgroupVersion;

    /// Canonical directory of the group.
    fn path(&self) -> PathBuf;

    fn exists(&self) -> bool;

    /// Create the group; an existing group is reused.
    fn create(&self) -> Result<()>;

    fn apply(&self, spec: &ResourceSpec) -> Result<()>;

    fn add_proc(&self, pid: u32) -> Result<()>;

    fn freeze(&self) -> Result<()>;

    fn thaw(&self) -> Result<()>;

    fn procs(&self) -> Result<Vec<u32>>;

    /// Remove the group; an absent group is not an error.
    fn destroy(&self) -> Result<()>;
}

/// Write `value` into an existing control file.
///
/// Control files are never created: a missing file means the kernel does
/// not offer that knob.
pub(crate) fn write_control(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    tracing::trace!(path = %path.display(), value, "Writing cgroup control file");
    let mut handle = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| control_error(&path, value, e))?;
    handle
        .write_all(value.as_bytes())
        .map_err(|e| control_error(&path, value, e))
}

pub(crate) fn read_control(dir: &Path, file: &str) -> Result<String> {
    let path = dir.join(file);
    std::fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| control_error(&path, "", e))
}

fn control_error(path: &Path, value: &str, err: std::io::Error) -> ApptainerError {
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match err.raw_os_error() {
        Some(libc::ENOENT) => ApptainerError::UnsupportedResource(format!("{} is not available", file)),
        Some(libc::EBUSY) => ApptainerError::Conflict(format!("{}: {}", path.display(), err)),
        Some(libc::EACCES) | Some(libc::EPERM) => {
            ApptainerError::PermissionDenied(format!("{}: {}", path.display(), err))
        }
        Some(libc::EINVAL) | Some(libc::ERANGE) => {
            ApptainerError::InvalidInput(format!("invalid value {:?} for {}", value, file))
        }
        _ => ApptainerError::CgroupError(format!("{}: {}", path.display(), err)),
    }
}

/// `rmdir` a group. Live processes or child groups keep it busy.
pub(crate) fn remove_group_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => match e.raw_os_error() {
            Some(libc::EBUSY) | Some(libc::ENOTEMPTY) => Err(ApptainerError::Conflict(format!(
                "cgroup {} is not empty: {}",
                dir.display(),
                e
            ))),
            Some(libc::EACCES) | Some(libc::EPERM) => {
                Err(ApptainerError::PermissionDenied(format!("{}: {}", dir.display(), e)))
            }
            _ => Err(ApptainerError::CgroupError(format!("{}: {}", dir.display(), e))),
        },
    }
}

/// Poll `file` until `settled` holds.
pub(crate) fn wait_for_state<F>(dir: &Path, file: &str, settled: F) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    for _ in 0..STATE_POLL_ATTEMPTS {
        if settled(&read_control(dir, file)?) {
            return Ok(());
        }
        std::thread::sleep(STATE_POLL_INTERVAL);
    }
    Err(ApptainerError::CgroupError(format!(
        "{} did not settle in {}",
        file,
        dir.display()
    )))
}

pub(crate) fn parse_pids(content: &str) -> Vec<u32> {
    content.lines().filter_map(|l| l.trim().parse().ok()).collect()
}
