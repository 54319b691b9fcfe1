//! Host user-namespace support detection.
//!
//! Fakeroot and rootless operation need unprivileged user namespaces:
//! - `/proc/sys/user/max_user_namespaces` must be non-zero
//! - on kernels carrying the Debian knob, `kernel/unprivileged_userns_clone`
//!   must be enabled for non-root callers

use std::path::Path;

use apptainer_core::error::{ApptainerError, Result};

/// Information about user namespace support.
#[derive(Debug, Clone)]
pub struct UserNamespaceSupport {
    pub max_user_namespaces: u64,
    /// `None` when the kernel has no such knob.
    pub unprivileged_clone: Option<bool>,
    pub details: String,
}

/// Check if the current host lets this process create user namespaces.
pub fn check_user_namespace_support() -> Result<UserNamespaceSupport> {
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    check_at(Path::new("/proc"), euid)
}

fn check_at(proc_root: &Path, euid: u32) -> Result<UserNamespaceSupport> {
    let max_path = proc_root.join("sys/user/max_user_namespaces");
    let max_user_namespaces = match std::fs::read_to_string(&max_path) {
        Ok(content) => content.trim().parse::<u64>().map_err(|e| {
            ApptainerError::Other(format!("invalid value in {}: {}", max_path.display(), e))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApptainerError::Unsupported(
                "user namespaces are not available: kernel built without CONFIG_USER_NS".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    };
    if max_user_namespaces == 0 {
        return Err(ApptainerError::Unsupported(format!(
            "user namespaces are disabled: {} is 0",
            max_path.display()
        )));
    }

    let clone_path = proc_root.join("sys/kernel/unprivileged_userns_clone");
    let unprivileged_clone = std::fs::read_to_string(&clone_path)
        .ok()
        .map(|v| v.trim() != "0");
    if unprivileged_clone == Some(false) && euid != 0 {
        return Err(ApptainerError::Unsupported(format!(
            "unprivileged user namespaces are disabled: {} is 0",
            clone_path.display()
        )));
    }

    Ok(UserNamespaceSupport {
        max_user_namespaces,
        unprivileged_clone,
        details: format!("up to {} user namespaces per user", max_user_namespaces),
    })
}

/// Whether this process runs inside a user namespace whose uid map is not
/// the identity, e.g. under fakeroot.
pub fn is_userns_remapped() -> bool {
    match std::fs::read_to_string("/proc/self/uid_map") {
        Ok(content) => !uid_map_is_identity(&content),
        Err(_) => false,
    }
}

/// The initial namespace maps `0 0 4294967295`.
pub(crate) fn uid_map_is_identity(content: &str) -> bool {
    let lines: Vec<Vec<&str>> = content
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|f| !f.is_empty())
        .collect();
    matches!(lines.as_slice(), [only] if only.as_slice() == ["0", "0", "4294967295"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_proc(max: Option<&str>, clone: Option<&str>) -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sys/user")).unwrap();
        std::fs::create_dir_all(tmp.path().join("sys/kernel")).unwrap();
        if let Some(max) = max {
            std::fs::write(tmp.path().join("sys/user/max_user_namespaces"), max).unwrap();
        }
        if let Some(clone) = clone {
            std::fs::write(tmp.path().join("sys/kernel/unprivileged_userns_clone"), clone).unwrap();
        }
        tmp
    }

    #[test]
    fn test_supported() {
        let proc = fake_proc(Some("63229\n"), None);
        let support = check_at(proc.path(), 1000).unwrap();
        assert_eq!(support.max_user_namespaces, 63229);
        assert_eq!(support.unprivileged_clone, None);
    }

    #[test]
    fn test_disabled() {
        let proc = fake_proc(Some("0\n"), None);
        assert!(matches!(check_at(proc.path(), 0), Err(ApptainerError::Unsupported(_))));
        let proc = fake_proc(None, None);
        assert!(matches!(check_at(proc.path(), 0), Err(ApptainerError::Unsupported(_))));
    }

    #[test]
    fn test_debian_clone_knob() {
        let proc = fake_proc(Some("100\n"), Some("0\n"));
        assert!(check_at(proc.path(), 1000).is_err());
        assert!(check_at(proc.path(), 0).is_ok());
    }

    #[test]
    fn test_uid_map_identity() {
        assert!(uid_map_is_identity("         0          0 4294967295\n"));
        assert!(!uid_map_is_identity("         0       1000          1\n         1     100000      65536\n"));
        assert!(!uid_map_is_identity(""));
    }

    #[test]
    fn test_host_check_runs() {
        // Result depends on the host; it must not panic.
        let _ = check_user_namespace_support();
        let _ = is_userns_remapped();
    }
}
