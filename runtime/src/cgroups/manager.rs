//! `CgroupManager`: the handle on one group.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use apptainer_core::error::{ApptainerError, Result};

use super::procfs::{CgroupVersion, Hierarchy};
use super::resources::ResourceSpec;
use super::systemd::{Busctl, SystemdBus, SystemdGroup};
use super::v1::V1Group;
use super::v2::V2Group;
use super::CgroupBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupDriver {
    Cgroupfs,
    Systemd,
}

pub struct CgroupManager {
    group: String,
    pid: u32,
    hierarchy: Hierarchy,
    driver: CgroupDriver,
    rel: String,
    unit: Option<String>,
    bus: Option<Arc<dyn SystemdBus>>,
    backend: Box<dyn CgroupBackend>,
    destroyed: bool,
}

impl std::fmt::Debug for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupManager")
            .field("group", &self.group)
            .field("pid", &self.pid)
            .field("version", &self.hierarchy.version)
            .field("driver", &self.driver)
            .field("rel", &self.rel)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Group used when none is given.
pub fn default_group(pid: u32, systemd: bool) -> String {
    if !systemd {
        return format!("/apptainer/{}", pid);
    }
    // SAFETY: geteuid has no preconditions.
    let slice = if unsafe { libc::geteuid() } == 0 { "system.slice" } else { "user.slice" };
    format!("{}:apptainer:{}", slice, pid)
}

fn backend_for(hierarchy: &Hierarchy, rel: &str) -> Box<dyn CgroupBackend> {
    match hierarchy.version {
        CgroupVersion::V1 => Box::new(V1Group::new(&hierarchy.root, rel)),
        CgroupVersion::V2 => Box::new(V2Group::new(&hierarchy.root, rel)),
    }
}

/// Absolute cgroupfs group path without `..` components.
fn validate_group_path(group: &str) -> Result<()> {
    let valid = group.starts_with('/') && group.split('/').all(|c| c != ".." && c != ".") && group != "/";
    if valid {
        Ok(())
    } else {
        Err(ApptainerError::InvalidInput(format!(
            "cgroup path {:?} must be absolute and below the hierarchy root",
            group
        )))
    }
}

impl CgroupManager {
    /// Create (or reuse) a group on the host hierarchy, apply `spec` and
    /// place `pid` in it.
    pub fn new_from_spec(spec: &ResourceSpec, pid: u32, group: Option<&str>, systemd: bool) -> Result<Self> {
        let hierarchy = Hierarchy::host()?;
        let bus: Option<Arc<dyn SystemdBus>> = systemd.then(|| Arc::new(Busctl::for_current_user()) as _);
        let group = group.map(str::to_string).unwrap_or_else(|| default_group(pid, systemd));
        Self::new_from_spec_in(hierarchy, bus, spec, pid, &group)
    }

    /// Parse a TOML resource file, then [`Self::new_from_spec`].
    pub fn new_from_file(path: &Path, pid: u32, group: Option<&str>, systemd: bool) -> Result<Self> {
        let spec = ResourceSpec::from_toml_file(path)?;
        Self::new_from_spec(&spec, pid, group, systemd)
    }

    /// As [`Self::new_from_spec`] on an explicit hierarchy. `bus` selects
    /// the systemd driver.
    pub fn new_from_spec_in(
        hierarchy: Hierarchy,
        bus: Option<Arc<dyn SystemdBus>>,
        spec: &ResourceSpec,
        pid: u32,
        group: &str,
    ) -> Result<Self> {
        if pid == 0 {
            return Err(ApptainerError::InvalidInput("cannot create a cgroup for pid 0".to_string()));
        }

        let mut manager = match bus {
            Some(bus) => {
                let parsed = SystemdGroup::parse(group)?;
                bus.ping()?;
                let unit = parsed.unit();
                bus.start_scope(&unit, &parsed.slice, pid)?;
                let rel = bus.control_group(&unit).unwrap_or_else(|e| {
                    tracing::debug!(unit = %unit, error = %e, "Falling back to the expanded slice path");
                    parsed.path()
                });
                Self {
                    group: group.to_string(),
                    pid,
                    backend: backend_for(&hierarchy, &rel),
                    hierarchy,
                    driver: CgroupDriver::Systemd,
                    rel,
                    unit: Some(unit),
                    bus: Some(bus),
                    destroyed: false,
                }
            }
            None => {
                validate_group_path(group)?;
                let backend = backend_for(&hierarchy, group);
                backend.create()?;
                Self {
                    group: group.to_string(),
                    pid,
                    backend,
                    hierarchy,
                    driver: CgroupDriver::Cgroupfs,
                    rel: group.to_string(),
                    unit: None,
                    bus: None,
                    destroyed: false,
                }
            }
        };

        let applied = manager.backend.apply(spec).and_then(|_| match manager.driver {
            CgroupDriver::Cgroupfs => manager.backend.add_proc(pid),
            CgroupDriver::Systemd => Ok(()),
        });
        if let Err(e) = applied {
            if let Err(cleanup) = manager.destroy() {
                tracing::warn!(group = %manager.group, error = %cleanup, "Failed to remove partially created cgroup");
            }
            return Err(e);
        }

        tracing::info!(
            group = %manager.group,
            pid,
            version = %manager.hierarchy.version,
            driver = ?manager.driver,
            path = %manager.backend.path().display(),
            "Cgroup created"
        );
        Ok(manager)
    }

    /// Open an existing group by name on the host hierarchy.
    pub fn open(group: &str) -> Result<Self> {
        let bus: Option<Arc<dyn SystemdBus>> = group
            .contains(':')
            .then(|| Arc::new(Busctl::for_current_user()) as _);
        Self::open_in(Hierarchy::host()?, bus, group)
    }

    pub fn open_in(hierarchy: Hierarchy, bus: Option<Arc<dyn SystemdBus>>, group: &str) -> Result<Self> {
        let (driver, rel, unit) = if group.contains(':') {
            let parsed = SystemdGroup::parse(group)?;
            let unit = parsed.unit();
            let rel = bus
                .as_ref()
                .and_then(|b| b.control_group(&unit).ok())
                .unwrap_or_else(|| parsed.path());
            (CgroupDriver::Systemd, rel, Some(unit))
        } else {
            validate_group_path(group)?;
            (CgroupDriver::Cgroupfs, group.to_string(), None)
        };
        Self::existing(hierarchy, bus, group, 0, driver, rel, unit)
    }

    /// Open the group `pid` currently belongs to. The handle drives the
    /// group through cgroupfs even when systemd created it.
    pub fn open_by_pid(pid: u32) -> Result<Self> {
        Self::open_by_pid_in(Hierarchy::host()?, pid)
    }

    pub fn open_by_pid_in(hierarchy: Hierarchy, pid: u32) -> Result<Self> {
        if pid == 0 {
            return Err(ApptainerError::InvalidInput("cannot look up the cgroup of pid 0".to_string()));
        }
        let rel = hierarchy.pid_path(pid)?;
        let group = rel.clone();
        Self::existing(hierarchy, None, &group, pid, CgroupDriver::Cgroupfs, rel, None)
    }

    fn existing(
        hierarchy: Hierarchy,
        bus: Option<Arc<dyn SystemdBus>>,
        group: &str,
        pid: u32,
        driver: CgroupDriver,
        rel: String,
        unit: Option<String>,
    ) -> Result<Self> {
        let backend = backend_for(&hierarchy, &rel);
        if !backend.exists() {
            return Err(ApptainerError::NotFound(format!("cgroup {}", group)));
        }
        Ok(Self {
            group: group.to_string(),
            pid,
            hierarchy,
            driver,
            rel,
            unit,
            bus,
            backend,
            destroyed: false,
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return Err(ApptainerError::InvalidInput(format!(
                "cgroup {} has been destroyed",
                self.group
            )));
        }
        Ok(())
    }

    /// Write `spec` into the group's controller files.
    pub fn apply_spec(&self, spec: &ResourceSpec) -> Result<()> {
        self.ensure_live()?;
        self.backend.apply(spec)
    }

    pub fn update_from_spec(&self, spec: &ResourceSpec) -> Result<()> {
        tracing::debug!(group = %self.group, "Updating cgroup resources");
        self.apply_spec(spec)
    }

    pub fn update_from_file(&self, path: &Path) -> Result<()> {
        let spec = ResourceSpec::from_toml_file(path)?;
        self.update_from_spec(&spec)
    }

    pub fn add_proc(&self, pid: u32) -> Result<()> {
        self.ensure_live()?;
        if pid == 0 {
            return Err(ApptainerError::InvalidInput("cannot add pid 0 to a cgroup".to_string()));
        }
        self.backend.add_proc(pid)
    }

    pub fn freeze(&self) -> Result<()> {
        self.ensure_live()?;
        self.backend.freeze()?;
        tracing::debug!(group = %self.group, "Cgroup frozen");
        Ok(())
    }

    pub fn thaw(&self) -> Result<()> {
        self.ensure_live()?;
        self.backend.thaw()?;
        tracing::debug!(group = %self.group, "Cgroup thawed");
        Ok(())
    }

    /// Remove the group. Calling it again after success is a no-op.
    ///
    /// A group that still holds processes fails with `Conflict` and stays
    /// usable.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if let (Some(unit), Some(bus)) = (self.unit.as_deref(), self.bus.as_ref()) {
            bus.stop_unit(unit)?;
        }
        self.backend.destroy()?;
        self.destroyed = true;
        tracing::info!(group = %self.group, "Cgroup destroyed");
        Ok(())
    }

    /// Mount point of the hierarchy.
    pub fn root_path(&self) -> &Path {
        &self.hierarchy.root
    }

    /// Group path relative to [`Self::root_path`]; for systemd groups, the
    /// scope's real path.
    pub fn rel_path(&self) -> &str {
        &self.rel
    }

    /// Absolute directory of the group (the `devices` controller on v1).
    pub fn path(&self) -> PathBuf {
        self.backend.path()
    }

    pub fn procs(&self) -> Result<Vec<u32>> {
        self.ensure_live()?;
        self.backend.procs()
    }

    pub fn has_process(&self, pid: u32) -> Result<bool> {
        Ok(self.procs()?.contains(&pid))
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn version(&self) -> CgroupVersion {
        self.hierarchy.version
    }

    pub fn driver(&self) -> CgroupDriver {
        self.driver
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}
