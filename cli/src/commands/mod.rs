//! CLI command definitions and dispatch.

mod cache;
mod cgroup;
mod check;
mod fakeroot;
mod pull;
mod push;
mod registry;
mod version;

use std::path::{Path, PathBuf};

use apptainer_core::RuntimeConfig;
use apptainer_runtime::Context;
use clap::{Parser, Subcommand};

/// Apptainer core - image acquisition, cgroups and fakeroot mapping.
#[derive(Parser)]
#[command(name = "apptainer-core", version, about)]
pub struct Cli {
    /// Print debugging information
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Runtime configuration file (default: ~/.apptainer/runtime.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Pull an image from a URI into the cache or a destination
    Pull(pull::PullArgs),
    /// Push a SIF image to an OCI registry as an ORAS artifact
    Push(push::PushArgs),
    /// Manage the local image cache
    Cache(cache::CacheArgs),
    /// Create and control cgroups
    Cgroup(cgroup::CgroupArgs),
    /// Manage subordinate id mappings for fakeroot
    Fakeroot(fakeroot::FakerootArgs),
    /// Manage registry credentials
    Registry(registry::RegistryArgs),
    /// Check host support for rootless cgroups and user namespaces
    Check(check::CheckArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// The per-user configuration file.
pub(crate) fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".apptainer"))
        .unwrap_or_else(|| PathBuf::from(".apptainer"))
        .join("runtime.toml")
}

/// Load the configuration file, then apply environment overrides.
pub(crate) fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    Ok(RuntimeConfig::load(&path)?)
}

/// A context cancelled by Ctrl-C.
pub(crate) fn interruptible_context() -> Context {
    let ctx = Context::background();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
    ctx
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.config.as_deref();
    match cli.command {
        Command::Pull(args) => pull::execute(args, &load_config(config)?).await,
        Command::Push(args) => push::execute(args, &load_config(config)?).await,
        Command::Cache(args) => cache::execute(args, &load_config(config)?).await,
        Command::Cgroup(args) => cgroup::execute(args, &load_config(config)?).await,
        Command::Fakeroot(args) => fakeroot::execute(args, &load_config(config)?).await,
        Command::Registry(args) => registry::execute(args).await,
        Command::Check(args) => check::execute(args, &load_config(config)?).await,
        Command::Version(args) => version::execute(args).await,
    }
}
