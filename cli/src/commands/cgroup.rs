//! `apptainer-core cgroup` commands.

use std::path::PathBuf;

use apptainer_core::RuntimeConfig;
use apptainer_runtime::{check_rootless, CgroupManager};
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct CgroupArgs {
    #[command(subcommand)]
    pub command: CgroupCommand,
}

#[derive(Subcommand)]
pub enum CgroupCommand {
    /// Create a cgroup for a process and apply limits from a TOML file
    Apply(ApplyArgs),
    /// Update the limits of an existing cgroup
    Update(UpdateArgs),
    /// Freeze every process in a cgroup
    Freeze(TargetArgs),
    /// Resume a frozen cgroup
    Thaw(TargetArgs),
    /// Remove a cgroup
    Destroy(TargetArgs),
    /// List the processes in a cgroup
    Procs(TargetArgs),
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Process to place in the new cgroup
    #[arg(long)]
    pub pid: u32,

    /// Resource limits (TOML)
    #[arg(short, long)]
    pub file: PathBuf,

    /// Group path, or "slice:prefix:name" with systemd
    #[arg(long)]
    pub group: Option<String>,

    /// Use the systemd cgroup manager
    #[arg(long)]
    pub systemd: bool,
}

#[derive(Args)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Resource limits (TOML)
    #[arg(short, long)]
    pub file: PathBuf,
}

/// Which cgroup to act on.
#[derive(Args)]
pub struct TargetArgs {
    /// Group path, or "slice:prefix:name" for systemd scopes
    #[arg(long, required_unless_present = "pid", conflicts_with = "pid")]
    pub group: Option<String>,

    /// A process whose cgroup to use
    #[arg(long)]
    pub pid: Option<u32>,
}

impl TargetArgs {
    fn open(&self) -> Result<CgroupManager, Box<dyn std::error::Error>> {
        match (&self.group, self.pid) {
            (Some(group), _) => Ok(CgroupManager::open(group)?),
            (None, Some(pid)) => Ok(CgroupManager::open_by_pid(pid)?),
            (None, None) => Err("either --group or --pid is required".into()),
        }
    }
}

/// Refuse early, with every reason, when the caller cannot manage cgroups.
fn require_gate(systemd: bool) -> Result<(), Box<dyn std::error::Error>> {
    let verdict = check_rootless(systemd, |key| std::env::var(key).ok());
    if verdict.allowed {
        tracing::debug!(reasons = ?verdict.reasons, "Cgroup management permitted");
        return Ok(());
    }
    Err(format!("cgroup management is not available: {}", verdict.reasons.join("; ")).into())
}

pub async fn execute(args: CgroupArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        CgroupCommand::Apply(args) => {
            let systemd = args.systemd || config.cgroups.systemd;
            require_gate(systemd)?;
            let manager = CgroupManager::new_from_file(&args.file, args.pid, args.group.as_deref(), systemd)?;
            println!(
                "Created cgroup {} for pid {} ({}, {})",
                manager.group(),
                manager.pid(),
                manager.version(),
                manager.path().display()
            );
        }
        CgroupCommand::Update(args) => {
            let manager = args.target.open()?;
            manager.update_from_file(&args.file)?;
            println!("Updated cgroup {}", manager.group());
        }
        CgroupCommand::Freeze(target) => {
            let manager = target.open()?;
            manager.freeze()?;
            println!("Froze cgroup {}", manager.group());
        }
        CgroupCommand::Thaw(target) => {
            let manager = target.open()?;
            manager.thaw()?;
            println!("Thawed cgroup {}", manager.group());
        }
        CgroupCommand::Destroy(target) => {
            let mut manager = target.open()?;
            manager.destroy()?;
            println!("Removed cgroup {}", manager.group());
        }
        CgroupCommand::Procs(target) => {
            let manager = target.open()?;
            for pid in manager.procs()? {
                println!("{}", pid);
            }
        }
    }
    Ok(())
}
