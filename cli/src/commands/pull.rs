//! `apptainer-core pull` command.

use std::path::PathBuf;

use apptainer_core::RuntimeConfig;
use apptainer_runtime::oci::{IndicatifProgress, TransportOptions};
use apptainer_runtime::{CacheHandle, ImagePuller, Platform, PullFlags, PullOutcome};
use clap::Args;

#[derive(Args)]
pub struct PullArgs {
    /// Destination path, or the image URI when given alone
    pub first: String,

    /// Image URI (e.g. "docker://alpine:3.19", "oras://ghcr.io/org/img:tag", "library://user/col/img")
    pub second: Option<String>,

    /// Overwrite an existing destination
    #[arg(short = 'F', long)]
    pub force: bool,

    /// Target platform (e.g. "linux/amd64", "linux/arm64/v8")
    #[arg(long, conflicts_with = "arch")]
    pub platform: Option<String>,

    /// Target architecture on linux
    #[arg(long)]
    pub arch: Option<String>,

    /// Do not use or populate the image cache
    #[arg(long)]
    pub disable_cache: bool,

    /// Use plain HTTP and skip TLS verification for registries
    #[arg(long)]
    pub no_https: bool,

    /// Registry credentials file
    #[arg(long)]
    pub authfile: Option<PathBuf>,

    /// Docker daemon socket (unix://...)
    #[arg(long)]
    pub docker_host: Option<String>,

    /// Library service URL
    #[arg(long)]
    pub library: Option<String>,

    /// Directory for temporary files
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

impl PullArgs {
    /// `(destination, uri)` from the positional arguments.
    fn target(&self) -> (Option<PathBuf>, &str) {
        match self.second {
            Some(ref uri) => (Some(PathBuf::from(&self.first)), uri.as_str()),
            None => (None, self.first.as_str()),
        }
    }

    fn transport_options(&self, config: &RuntimeConfig) -> Result<TransportOptions, Box<dyn std::error::Error>> {
        let mut opts = TransportOptions::from_config(config);
        if let Some(ref platform) = self.platform {
            opts.platform = Platform::parse(platform)?;
        } else if let Some(ref arch) = self.arch {
            opts.platform = Platform::parse(&format!("linux/{}", arch))?;
        }
        opts.insecure |= self.no_https;
        if self.authfile.is_some() {
            opts.auth_file = self.authfile.clone();
        }
        opts.docker_host = self.docker_host.clone();
        opts.tmp_dir = self.tmpdir.clone();
        if !self.quiet {
            opts.progress = Some(IndicatifProgress::shared());
        }
        Ok(opts)
    }
}

pub async fn execute(args: PullArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (dest, uri) = args.target();
    let opts = args.transport_options(config)?;

    let cache = if args.disable_cache || config.cache.disabled {
        if dest.is_none() {
            return Err("a destination path is required when the cache is disabled".into());
        }
        CacheHandle::disabled(opts.tmp_dir.as_deref())?
    } else {
        CacheHandle::new(&config.cache)?
    };

    let mut library = config.library.clone();
    if let Some(ref url) = args.library {
        library.base_url = url.clone();
    }

    let puller = ImagePuller::new(cache, library);
    let flags = PullFlags {
        force: args.force,
        ..Default::default()
    };
    let ctx = super::interruptible_context();

    if !args.quiet {
        eprintln!("Pulling {}...", uri);
    }
    let outcome = puller.pull(&ctx, uri, dest.as_deref(), &opts, &flags).await?;

    if args.quiet {
        println!("{}", outcome.path().display());
    } else {
        if let PullOutcome::Unsigned(_) = outcome {
            eprintln!("Warning: {} is not signed", uri);
        }
        println!("Pulled: {} ({})", uri, outcome.path().display());
    }
    Ok(())
}
