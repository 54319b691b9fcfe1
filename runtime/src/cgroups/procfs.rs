//! Cgroup hierarchy detection and `/proc/<pid>/cgroup` parsing.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use apptainer_core::error::{ApptainerError, Result};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupVersion::V1 => f.write_str("v1"),
            CgroupVersion::V2 => f.write_str("v2"),
        }
    }
}

/// A mounted cgroup hierarchy.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    /// `/sys/fs/cgroup`; on v1 the directory holding one mount per controller.
    pub root: PathBuf,
    pub version: CgroupVersion,
    pub proc_root: PathBuf,
}

impl Hierarchy {
    /// Detect the host hierarchy: unified v2 preferred, v1 otherwise.
    ///
    /// Hybrid hosts (v1 controllers plus `unified/`) count as v1.
    pub fn host() -> Result<Self> {
        Self::detect(Path::new(DEFAULT_CGROUP_ROOT))
    }

    pub fn detect(root: &Path) -> Result<Self> {
        if root.join("cgroup.controllers").exists() {
            return Ok(Self::at(root, CgroupVersion::V2));
        }
        if root.join("devices").is_dir() {
            return Ok(Self::at(root, CgroupVersion::V1));
        }
        Err(ApptainerError::CgroupError(format!(
            "no cgroup hierarchy mounted at {}",
            root.display()
        )))
    }

    pub fn at(root: &Path, version: CgroupVersion) -> Self {
        Self {
            root: root.to_path_buf(),
            version,
            proc_root: PathBuf::from("/proc"),
        }
    }

    pub fn with_proc_root(mut self, proc_root: &Path) -> Self {
        self.proc_root = proc_root.to_path_buf();
        self
    }

    pub fn is_unified(&self) -> bool {
        self.version == CgroupVersion::V2
    }

    /// Controller → cgroup path for `pid`.
    pub fn pid_cgroups(&self, pid: u32) -> Result<HashMap<String, String>> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ApptainerError::NotFound(format!("process {}", pid))
            } else {
                ApptainerError::IoError(e)
            }
        })?;
        Ok(parse_cgroup_file(&content))
    }

    /// Canonical cgroup path of `pid`: the unified line on v2, the
    /// `devices` controller line on v1.
    pub fn pid_path(&self, pid: u32) -> Result<String> {
        let key = match self.version {
            CgroupVersion::V2 => "",
            CgroupVersion::V1 => "devices",
        };
        self.pid_cgroups(pid)?
            .remove(key)
            .ok_or_else(|| {
                ApptainerError::CgroupError(format!(
                    "process {} has no {} cgroup entry",
                    pid,
                    if key.is_empty() { "unified" } else { key }
                ))
            })
    }
}

/// Parse `hierarchy-id:controllers:path` lines.
///
/// The v2 line has an empty controller list and is stored under `""`;
/// v1 lines are stored once per listed controller.
pub fn parse_cgroup_file(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let (Some(_id), Some(controllers), Some(path)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if controllers.is_empty() {
            map.insert(String::new(), path.to_string());
            continue;
        }
        for controller in controllers.split(',') {
            map.insert(controller.to_string(), path.to_string());
        }
    }
    map
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a fake `/proc/<pid>/cgroup`.
    pub(crate) fn fake_proc_cgroup(proc_root: &Path, pid: u32, content: &str) {
        let dir = proc_root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cgroup"), content).unwrap();
    }

    const V1_CGROUP: &str = "12:pids:/user.slice/user-1000.slice\n\
        11:cpu,cpuacct:/user.slice\n\
        4:devices:/apptainer/42\n\
        1:name=systemd:/user.slice/user-1000.slice/session-2.scope\n\
        0::/user.slice/user-1000.slice/session-2.scope\n";

    #[test]
    fn test_parse_v1() {
        let map = parse_cgroup_file(V1_CGROUP);
        assert_eq!(map["devices"], "/apptainer/42");
        assert_eq!(map["cpu"], "/user.slice");
        assert_eq!(map["cpuacct"], "/user.slice");
        assert_eq!(map["name=systemd"], "/user.slice/user-1000.slice/session-2.scope");
        assert_eq!(map[""], "/user.slice/user-1000.slice/session-2.scope");
    }

    #[test]
    fn test_parse_skips_garbage() {
        let map = parse_cgroup_file("garbage\n0::/a:b\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map[""], "/a:b");
    }

    #[test]
    fn test_detect() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(Hierarchy::detect(tmp.path()), Err(ApptainerError::CgroupError(_))));
        std::fs::create_dir(tmp.path().join("devices")).unwrap();
        assert_eq!(Hierarchy::detect(tmp.path()).unwrap().version, CgroupVersion::V1);
        std::fs::write(tmp.path().join("cgroup.controllers"), "cpu memory pids\n").unwrap();
        assert!(Hierarchy::detect(tmp.path()).unwrap().is_unified());
    }

    #[test]
    fn test_pid_path_uses_canonical_line() {
        let tmp = TempDir::new().unwrap();
        fake_proc_cgroup(tmp.path(), 42, V1_CGROUP);

        let v1 = Hierarchy::at(Path::new("/sys/fs/cgroup"), CgroupVersion::V1).with_proc_root(tmp.path());
        assert_eq!(v1.pid_path(42).unwrap(), "/apptainer/42");
        let v2 = Hierarchy::at(Path::new("/sys/fs/cgroup"), CgroupVersion::V2).with_proc_root(tmp.path());
        assert_eq!(v2.pid_path(42).unwrap(), "/user.slice/user-1000.slice/session-2.scope");
        assert!(matches!(v2.pid_path(7), Err(ApptainerError::NotFound(_))));
    }
}
