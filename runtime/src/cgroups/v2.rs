//! Cgroups v2 backend: a single unified hierarchy.

use std::path::{Component, Path, PathBuf};

use apptainer_core::error::{ApptainerError, Result};

use super::procfs::CgroupVersion;
use super::resources::ResourceSpec;
use super::{parse_pids, read_control, remove_group_dir, wait_for_state, write_control, CgroupBackend};

const DEFAULT_CPU_PERIOD: u64 = 100_000;

pub struct V2Group {
    root: PathBuf,
    rel: String,
}

impl V2Group {
    pub fn new(root: &Path, rel: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            rel: rel.trim_start_matches('/').to_string(),
        }
    }

    fn dir(&self) -> PathBuf {
        self.root.join(&self.rel)
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        write_control(&self.dir(), file, value)
    }

    /// Controllers usable in this group, from `cgroup.controllers`.
    fn controllers(&self) -> Option<Vec<String>> {
        read_control(&self.dir(), "cgroup.controllers")
            .ok()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
    }

    /// Enable every available controller in the ancestors' subtree control
    /// so the new group sees them. Best effort: a delegated subtree may not
    /// allow every controller.
    fn enable_controllers(&self) {
        let mut dir = self.root.clone();
        let components: Vec<&str> = self.rel.split('/').filter(|c| !c.is_empty()).collect();
        for component in components {
            if let Ok(available) = read_control(&dir, "cgroup.controllers") {
                for controller in available.split_whitespace() {
                    if let Err(e) = write_control(&dir, "cgroup.subtree_control", &format!("+{}", controller)) {
                        tracing::debug!(dir = %dir.display(), controller, error = %e, "Could not enable controller");
                    }
                }
            }
            dir.push(component);
        }
    }

    fn apply_memory(&self, spec: &ResourceSpec) -> Result<()> {
        let Some(ref memory) = spec.memory else {
            return Ok(());
        };
        if let Some(limit) = memory.limit {
            self.write("memory.max", &max_or(limit))?;
        }
        if let Some(reservation) = memory.reservation {
            self.write("memory.low", &max_or(reservation))?;
        }
        if let Some(swap) = memory.swap {
            self.write("memory.swap.max", &swap_value(swap, memory.limit)?)?;
        }
        if memory.kernel.is_some() || memory.kernel_tcp.is_some() {
            tracing::warn!("Kernel memory limits have no cgroups v2 equivalent, ignoring");
        }
        if memory.swappiness.is_some() {
            tracing::warn!("Memory swappiness has no cgroups v2 equivalent, ignoring");
        }
        if memory.disable_oom_killer == Some(true) {
            tracing::warn!("Disabling the OOM killer is not possible on cgroups v2, ignoring");
        }
        Ok(())
    }

    fn apply_cpu(&self, spec: &ResourceSpec) -> Result<()> {
        let Some(ref cpu) = spec.cpu else {
            return Ok(());
        };
        if cpu.realtime_runtime.is_some() || cpu.realtime_period.is_some() {
            return Err(ApptainerError::UnsupportedResource(
                "realtime cpu scheduling is not supported on cgroups v2".to_string(),
            ));
        }
        if let Some(shares) = cpu.shares.filter(|s| *s != 0) {
            self.write("cpu.weight", &shares_to_weight(shares).to_string())?;
        }
        if cpu.quota.is_some() || cpu.period.is_some() {
            let period = cpu.period.filter(|p| *p != 0).unwrap_or(DEFAULT_CPU_PERIOD);
            let quota = match cpu.quota {
                Some(q) if q > 0 => q.to_string(),
                _ => "max".to_string(),
            };
            self.write("cpu.max", &format!("{} {}", quota, period))?;
        }
        if let Some(ref cpus) = cpu.cpus {
            self.write("cpuset.cpus", cpus)?;
        }
        if let Some(ref mems) = cpu.mems {
            self.write("cpuset.mems", mems)?;
        }
        Ok(())
    }

    fn apply_io(&self, spec: &ResourceSpec) -> Result<()> {
        let Some(ref bio) = spec.block_io else {
            return Ok(());
        };
        if let Some(weight) = bio.weight {
            self.write("io.weight", &format!("default {}", blkio_weight_to_io(weight)))?;
        }
        if bio.leaf_weight.is_some() {
            tracing::warn!("blkio leaf weight has no cgroups v2 equivalent, ignoring");
        }
        for dev in &bio.weight_device {
            if let Some(weight) = dev.weight {
                self.write(
                    "io.weight",
                    &format!("{}:{} {}", dev.major, dev.minor, blkio_weight_to_io(weight)),
                )?;
            }
        }
        let throttles = [
            ("rbps", &bio.throttle_read_bps_device),
            ("wbps", &bio.throttle_write_bps_device),
            ("riops", &bio.throttle_read_iops_device),
            ("wiops", &bio.throttle_write_iops_device),
        ];
        for (key, devices) in throttles {
            for dev in devices {
                self.write("io.max", &format!("{} {}={}", dev.device(), key, dev.rate))?;
            }
        }
        Ok(())
    }

    /// Raw `unified` entries, written last so they override mapped values.
    fn apply_unified(&self, spec: &ResourceSpec) -> Result<()> {
        if spec.unified.is_empty() {
            return Ok(());
        }
        let available = self.controllers();
        for (key, value) in &spec.unified {
            if !is_plain_file_name(key) {
                return Err(ApptainerError::InvalidInput(format!("invalid unified cgroup key {:?}", key)));
            }
            let controller = key.split('.').next().unwrap_or_default();
            let listed = controller == "cgroup"
                || available
                    .as_ref()
                    .map(|a| a.iter().any(|c| c == controller))
                    .unwrap_or(true);
            if !listed {
                return Err(ApptainerError::UnsupportedResource(format!(
                    "{}: controller {} is not enabled",
                    key, controller
                )));
            }
            self.write(key, value)?;
        }
        Ok(())
    }
}

impl CgroupBackend for V2Group {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V2
    }

    fn path(&self) -> PathBuf {
        self.dir()
    }

    fn exists(&self) -> bool {
        self.dir().is_dir()
    }

    fn create(&self) -> Result<()> {
        self.enable_controllers();
        std::fs::create_dir_all(self.dir())?;
        Ok(())
    }

    fn apply(&self, spec: &ResourceSpec) -> Result<()> {
        if spec.network.is_some() {
            tracing::warn!("Network class and priority limits have no cgroups v2 equivalent, ignoring");
        }
        if !spec.devices.is_empty() {
            tracing::warn!("Device rules require an eBPF program on cgroups v2, ignoring");
        }
        self.apply_memory(spec)?;
        self.apply_cpu(spec)?;
        if let Some(ref pids) = spec.pids {
            self.write("pids.max", &max_or(pids.limit))?;
        }
        self.apply_io(spec)?;
        for hp in &spec.hugepage_limits {
            self.write(&format!("hugetlb.{}.max", hp.page_size), &hp.limit.to_string())?;
        }
        for (device, limit) in &spec.rdma {
            if let Some(line) = limit.to_line(device) {
                self.write("rdma.max", &line)?;
            }
        }
        self.apply_unified(spec)
    }

    fn add_proc(&self, pid: u32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    fn freeze(&self) -> Result<()> {
        self.write("cgroup.freeze", "1")?;
        self.wait_frozen(true)
    }

    fn thaw(&self) -> Result<()> {
        self.write("cgroup.freeze", "0")?;
        self.wait_frozen(false)
    }

    fn procs(&self) -> Result<Vec<u32>> {
        Ok(parse_pids(&read_control(&self.dir(), "cgroup.procs")?))
    }

    fn destroy(&self) -> Result<()> {
        remove_group_dir(&self.dir())
    }
}

impl V2Group {
    /// `cgroup.events` reports the settled state; older kernels lack it.
    fn wait_frozen(&self, frozen: bool) -> Result<()> {
        if !self.dir().join("cgroup.events").exists() {
            return Ok(());
        }
        let want = if frozen { "frozen 1" } else { "frozen 0" };
        wait_for_state(&self.dir(), "cgroup.events", |s| s.lines().any(|l| l.trim() == want))
    }
}

/// Non-positive limits mean unlimited.
fn max_or(value: i64) -> String {
    if value > 0 {
        value.to_string()
    } else {
        "max".to_string()
    }
}

/// OCI swap is memory+swap; v2 `memory.swap.max` is swap alone.
fn swap_value(swap: i64, limit: Option<i64>) -> Result<String> {
    if swap < 0 {
        return Ok("max".to_string());
    }
    match limit {
        Some(limit) if limit > 0 => {
            if swap < limit {
                return Err(ApptainerError::InvalidInput(format!(
                    "memory+swap limit ({}) must not be lower than the memory limit ({})",
                    swap, limit
                )));
            }
            Ok((swap - limit).to_string())
        }
        _ => Err(ApptainerError::InvalidInput(
            "a swap limit requires a memory limit on cgroups v2".to_string(),
        )),
    }
}

/// Map cpu shares `[2, 262144]` onto cpu.weight `[1, 10000]`.
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262_144);
    1 + ((shares - 2) * 9999) / 262_142
}

/// Map blkio weight `[10, 1000]` onto io.weight `[1, 10000]`.
pub fn blkio_weight_to_io(weight: u16) -> u64 {
    let weight = u64::from(weight.clamp(10, 1000));
    1 + ((weight - 10) * 9999) / 990
}

fn is_plain_file_name(key: &str) -> bool {
    let mut components = Path::new(key).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) && !key.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::resources::{CpuLimits, MemoryLimits, PidsLimit};
    use crate::cgroups::tests::{fake_v2_root, populate};
    use tempfile::TempDir;

    fn created(root: &Path, rel: &str) -> V2Group {
        let group = V2Group::new(root, rel);
        group.create().unwrap();
        populate(
            &group.dir(),
            &[
                "cgroup.procs",
                "cgroup.freeze",
                "memory.max",
                "memory.low",
                "memory.swap.max",
                "memory.high",
                "cpu.weight",
                "cpu.max",
                "pids.max",
            ],
        );
        std::fs::write(group.dir().join("cgroup.controllers"), "cpu memory pids\n").unwrap();
        group
    }

    #[test]
    fn test_create_enables_controllers_in_ancestors() {
        let tmp = TempDir::new().unwrap();
        fake_v2_root(tmp.path());
        let group = V2Group::new(tmp.path(), "/apptainer/5");
        group.create().unwrap();
        assert!(group.exists());
        // Last enabled controller wins in a plain file.
        assert_eq!(read_control(tmp.path(), "cgroup.subtree_control").unwrap(), "+pids");
    }

    #[test]
    fn test_apply_maps_oci_values() {
        let tmp = TempDir::new().unwrap();
        fake_v2_root(tmp.path());
        let group = created(tmp.path(), "/apptainer/5");
        let spec = ResourceSpec {
            memory: Some(MemoryLimits {
                limit: Some(1 << 30),
                reservation: Some(0),
                swap: Some(3 << 29),
                ..Default::default()
            }),
            cpu: Some(CpuLimits {
                shares: Some(1024),
                quota: Some(50_000),
                ..Default::default()
            }),
            pids: Some(PidsLimit { limit: 32 }),
            ..Default::default()
        };
        group.apply(&spec).unwrap();

        let dir = group.dir();
        assert_eq!(read_control(&dir, "memory.max").unwrap(), "1073741824");
        assert_eq!(read_control(&dir, "memory.low").unwrap(), "max");
        assert_eq!(read_control(&dir, "memory.swap.max").unwrap(), "536870912");
        assert_eq!(read_control(&dir, "cpu.weight").unwrap(), "39");
        assert_eq!(read_control(&dir, "cpu.max").unwrap(), "50000 100000");
        assert_eq!(read_control(&dir, "pids.max").unwrap(), "32");
    }

    #[test]
    fn test_unified_keys() {
        let tmp = TempDir::new().unwrap();
        fake_v2_root(tmp.path());
        let group = created(tmp.path(), "/apptainer/6");

        let mut spec = ResourceSpec::default();
        spec.unified.insert("memory.high".to_string(), "400M".to_string());
        group.apply(&spec).unwrap();
        assert_eq!(read_control(&group.dir(), "memory.high").unwrap(), "400M");

        let mut spec = ResourceSpec::default();
        spec.unified.insert("io.weight".to_string(), "100".to_string());
        assert!(matches!(group.apply(&spec), Err(ApptainerError::UnsupportedResource(_))));

        let mut spec = ResourceSpec::default();
        spec.unified.insert("../memory.max".to_string(), "1".to_string());
        assert!(matches!(group.apply(&spec), Err(ApptainerError::InvalidInput(_))));
    }

    #[test]
    fn test_realtime_unsupported() {
        let tmp = TempDir::new().unwrap();
        fake_v2_root(tmp.path());
        let group = created(tmp.path(), "/apptainer/7");
        let spec = ResourceSpec {
            cpu: Some(CpuLimits {
                realtime_runtime: Some(1000),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(group.apply(&spec), Err(ApptainerError::UnsupportedResource(_))));
    }

    #[test]
    fn test_freeze_waits_for_events() {
        let tmp = TempDir::new().unwrap();
        fake_v2_root(tmp.path());
        let group = created(tmp.path(), "/apptainer/8");
        group.freeze().unwrap();
        assert_eq!(read_control(&group.dir(), "cgroup.freeze").unwrap(), "1");

        std::fs::write(group.dir().join("cgroup.events"), "populated 1\nfrozen 0\n").unwrap();
        group.thaw().unwrap();
        assert_eq!(read_control(&group.dir(), "cgroup.freeze").unwrap(), "0");
    }

    #[test]
    fn test_procs() {
        let tmp = TempDir::new().unwrap();
        fake_v2_root(tmp.path());
        let group = created(tmp.path(), "/apptainer/9");
        group.add_proc(4242).unwrap();
        assert_eq!(group.procs().unwrap(), vec![4242]);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(1024), 39);
        assert_eq!(blkio_weight_to_io(10), 1);
        assert_eq!(blkio_weight_to_io(1000), 10_000);
        assert_eq!(swap_value(-1, Some(100)).unwrap(), "max");
        assert!(swap_value(50, Some(100)).is_err());
        assert!(swap_value(50, None).is_err());
    }
}
