//! `apptainer-core version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("apptainer-core version {}", apptainer_core::VERSION);
    println!("runtime {}", apptainer_runtime::VERSION);
    println!("libsubid {}", if cfg!(feature = "libsubid") { "enabled" } else { "disabled" });
    Ok(())
}
