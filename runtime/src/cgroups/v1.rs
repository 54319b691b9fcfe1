//! Cgroups v1 backend: one directory per controller mount.

use std::path::{Path, PathBuf};

use apptainer_core::error::{ApptainerError, Result};

use super::procfs::CgroupVersion;
use super::resources::ResourceSpec;
use super::{parse_pids, read_control, remove_group_dir, wait_for_state, write_control, CgroupBackend};

/// Controllers a group is created in, when mounted.
const CONTROLLERS: &[&str] = &[
    "devices", "memory", "cpu", "cpuacct", "cpuset", "pids", "blkio", "freezer", "hugetlb", "net_cls",
    "net_prio", "rdma",
];

pub struct V1Group {
    root: PathBuf,
    rel: String,
}

impl V1Group {
    pub fn new(root: &Path, rel: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            rel: rel.trim_start_matches('/').to_string(),
        }
    }

    fn dir(&self, controller: &str) -> PathBuf {
        self.root.join(controller).join(&self.rel)
    }

    fn mounted(&self) -> impl Iterator<Item = &'static str> + '_ {
        CONTROLLERS
            .iter()
            .copied()
            .filter(move |c| self.root.join(c).is_dir())
    }

    fn write(&self, controller: &str, file: &str, value: &str) -> Result<()> {
        if !self.root.join(controller).is_dir() {
            return Err(ApptainerError::UnsupportedResource(format!(
                "{} controller is not mounted",
                controller
            )));
        }
        write_control(&self.dir(controller), file, value)
    }

    /// New cpuset groups start empty; each level inherits its parent's
    /// cpus and mems.
    fn init_cpuset(&self) -> Result<()> {
        let mut parent = self.root.join("cpuset");
        for component in self.rel.split('/').filter(|c| !c.is_empty()) {
            let dir = parent.join(component);
            for file in ["cpuset.cpus", "cpuset.mems"] {
                let empty = read_control(&dir, file).map(|c| c.is_empty()).unwrap_or(false);
                if !empty {
                    continue;
                }
                if let Ok(inherited) = read_control(&parent, file) {
                    if !inherited.is_empty() {
                        write_control(&dir, file, &inherited)?;
                    }
                }
            }
            parent = dir;
        }
        Ok(())
    }

    fn apply_memory(&self, spec: &ResourceSpec) -> Result<()> {
        let Some(ref memory) = spec.memory else {
            return Ok(());
        };
        if let Some(limit) = memory.limit {
            self.write("memory", "memory.limit_in_bytes", &limit.to_string())?;
        }
        if let Some(reservation) = memory.reservation {
            self.write("memory", "memory.soft_limit_in_bytes", &reservation.to_string())?;
        }
        if let Some(swap) = memory.swap {
            self.write("memory", "memory.memsw.limit_in_bytes", &swap.to_string())?;
        }
        if let Some(kernel) = memory.kernel {
            self.write("memory", "memory.kmem.limit_in_bytes", &kernel.to_string())?;
        }
        if let Some(tcp) = memory.kernel_tcp {
            self.write("memory", "memory.kmem.tcp.limit_in_bytes", &tcp.to_string())?;
        }
        if let Some(swappiness) = memory.swappiness {
            self.write("memory", "memory.swappiness", &swappiness.to_string())?;
        }
        if memory.disable_oom_killer == Some(true) {
            self.write("memory", "memory.oom_control", "1")?;
        }
        Ok(())
    }

    fn apply_cpu(&self, spec: &ResourceSpec) -> Result<()> {
        let Some(ref cpu) = spec.cpu else {
            return Ok(());
        };
        if let Some(shares) = cpu.shares.filter(|s| *s != 0) {
            self.write("cpu", "cpu.shares", &shares.to_string())?;
        }
        if let Some(period) = cpu.period.filter(|p| *p != 0) {
            self.write("cpu", "cpu.cfs_period_us", &period.to_string())?;
        }
        if let Some(quota) = cpu.quota.filter(|q| *q != 0) {
            self.write("cpu", "cpu.cfs_quota_us", &quota.to_string())?;
        }
        if let Some(period) = cpu.realtime_period.filter(|p| *p != 0) {
            self.write("cpu", "cpu.rt_period_us", &period.to_string())?;
        }
        if let Some(runtime) = cpu.realtime_runtime.filter(|r| *r != 0) {
            self.write("cpu", "cpu.rt_runtime_us", &runtime.to_string())?;
        }
        if let Some(ref cpus) = cpu.cpus {
            self.write("cpuset", "cpuset.cpus", cpus)?;
        }
        if let Some(ref mems) = cpu.mems {
            self.write("cpuset", "cpuset.mems", mems)?;
        }
        Ok(())
    }

    fn apply_block_io(&self, spec: &ResourceSpec) -> Result<()> {
        let Some(ref bio) = spec.block_io else {
            return Ok(());
        };
        if let Some(weight) = bio.weight {
            self.write("blkio", "blkio.weight", &weight.to_string())?;
        }
        if let Some(weight) = bio.leaf_weight {
            self.write("blkio", "blkio.leaf_weight", &weight.to_string())?;
        }
        for dev in &bio.weight_device {
            if let Some(weight) = dev.weight {
                self.write("blkio", "blkio.weight_device", &format!("{}:{} {}", dev.major, dev.minor, weight))?;
            }
            if let Some(weight) = dev.leaf_weight {
                self.write(
                    "blkio",
                    "blkio.leaf_weight_device",
                    &format!("{}:{} {}", dev.major, dev.minor, weight),
                )?;
            }
        }
        let throttles = [
            ("blkio.throttle.read_bps_device", &bio.throttle_read_bps_device),
            ("blkio.throttle.write_bps_device", &bio.throttle_write_bps_device),
            ("blkio.throttle.read_iops_device", &bio.throttle_read_iops_device),
            ("blkio.throttle.write_iops_device", &bio.throttle_write_iops_device),
        ];
        for (file, devices) in throttles {
            for dev in devices {
                self.write("blkio", file, &format!("{} {}", dev.device(), dev.rate))?;
            }
        }
        Ok(())
    }
}

impl CgroupBackend for V1Group {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V1
    }

    fn path(&self) -> PathBuf {
        self.dir("devices")
    }

    fn exists(&self) -> bool {
        self.dir("devices").is_dir()
    }

    fn create(&self) -> Result<()> {
        let mut created = 0;
        for controller in self.mounted() {
            std::fs::create_dir_all(self.dir(controller))?;
            created += 1;
        }
        if created == 0 {
            return Err(ApptainerError::CgroupError(format!(
                "no cgroup v1 controllers mounted under {}",
                self.root.display()
            )));
        }
        if self.root.join("cpuset").is_dir() {
            self.init_cpuset()?;
        }
        Ok(())
    }

    fn apply(&self, spec: &ResourceSpec) -> Result<()> {
        if !spec.unified.is_empty() {
            return Err(ApptainerError::UnifiedOnV1);
        }
        for rule in &spec.devices {
            let file = if rule.allow { "devices.allow" } else { "devices.deny" };
            self.write("devices", file, &rule.to_v1_line())?;
        }
        self.apply_memory(spec)?;
        self.apply_cpu(spec)?;
        if let Some(ref pids) = spec.pids {
            let value = if pids.limit > 0 { pids.limit.to_string() } else { "max".to_string() };
            self.write("pids", "pids.max", &value)?;
        }
        self.apply_block_io(spec)?;
        for hp in &spec.hugepage_limits {
            self.write(
                "hugetlb",
                &format!("hugetlb.{}.limit_in_bytes", hp.page_size),
                &hp.limit.to_string(),
            )?;
        }
        if let Some(ref network) = spec.network {
            if let Some(class_id) = network.class_id {
                self.write("net_cls", "net_cls.classid", &class_id.to_string())?;
            }
            for prio in &network.priorities {
                self.write("net_prio", "net_prio.ifpriomap", &format!("{} {}", prio.name, prio.priority))?;
            }
        }
        for (device, limit) in &spec.rdma {
            if let Some(line) = limit.to_line(device) {
                self.write("rdma", "rdma.max", &line)?;
            }
        }
        Ok(())
    }

    fn add_proc(&self, pid: u32) -> Result<()> {
        for controller in self.mounted() {
            write_control(&self.dir(controller), "cgroup.procs", &pid.to_string())?;
        }
        Ok(())
    }

    fn freeze(&self) -> Result<()> {
        self.write("freezer", "freezer.state", "FROZEN")?;
        wait_for_state(&self.dir("freezer"), "freezer.state", |s| s.trim() == "FROZEN")
    }

    fn thaw(&self) -> Result<()> {
        self.write("freezer", "freezer.state", "THAWED")?;
        wait_for_state(&self.dir("freezer"), "freezer.state", |s| s.trim() == "THAWED")
    }

    fn procs(&self) -> Result<Vec<u32>> {
        let content = read_control(&self.dir("devices"), "cgroup.procs")?;
        Ok(parse_pids(&content))
    }

    fn destroy(&self) -> Result<()> {
        for controller in self.mounted() {
            remove_group_dir(&self.dir(controller))?;
        }
        Ok(())
    }
}
