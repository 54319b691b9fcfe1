//! `apptainer-core push` command - push a SIF to a registry over ORAS.

use std::path::PathBuf;

use apptainer_core::RuntimeConfig;
use apptainer_runtime::oci::TransportOptions;
use apptainer_runtime::{ImageRef, ImageReference, OrasClient};
use clap::Args;

#[derive(Args)]
pub struct PushArgs {
    /// SIF image to push
    pub file: PathBuf,

    /// Destination (e.g. "oras://ghcr.io/org/image:tag")
    pub uri: String,

    /// Use plain HTTP and skip TLS verification
    #[arg(long)]
    pub no_https: bool,

    /// Registry credentials file
    #[arg(long)]
    pub authfile: Option<PathBuf>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

/// The registry reference behind an `oras://` URI.
fn oras_target(uri: &str) -> Result<ImageReference, Box<dyn std::error::Error>> {
    match ImageRef::parse(uri)? {
        ImageRef::Oras(reference) => Ok(reference),
        other => Err(format!("cannot push to {} URIs: only oras:// is supported", other.transport()).into()),
    }
}

pub async fn execute(args: PushArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let reference = oras_target(&args.uri)?;

    let mut opts = TransportOptions::from_config(config);
    opts.insecure |= args.no_https;
    if args.authfile.is_some() {
        opts.auth_file = args.authfile.clone();
    }

    if !args.quiet {
        eprintln!("Pushing {}...", args.file.display());
    }
    let ctx = super::interruptible_context();
    let client = OrasClient::new(&reference, &opts)?;
    let result = client.push(&ctx, &args.file, &reference).await?;

    if args.quiet {
        println!("{}", result.manifest_url);
    } else {
        println!("Pushed: {} ({})", args.uri, result.manifest_url);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oras_target() {
        let reference = oras_target("oras://ghcr.io/org/alpine:3.19").unwrap();
        assert_eq!(reference.registry, "ghcr.io");
    }

    #[test]
    fn test_other_transports_rejected() {
        let err = oras_target("docker://alpine").unwrap_err();
        assert!(err.to_string().contains("oras://"));
    }
}
