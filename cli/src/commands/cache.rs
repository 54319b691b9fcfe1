//! `apptainer-core cache` commands.

use apptainer_core::RuntimeConfig;
use apptainer_runtime::{CacheHandle, CleanOptions, Namespace};
use clap::{Args, Subcommand};

use crate::output::{format_ago, format_bytes, new_table};

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// List cached images
    List(ListArgs),
    /// Remove cached images
    Clean(CleanArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Cache types: library, oras, oci-sif, oci-blob, net, all
    #[arg(short = 'T', long = "type", value_delimiter = ',')]
    pub types: Vec<String>,

    /// Show every entry
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args)]
pub struct CleanArgs {
    /// Cache types: library, oras, oci-sif, oci-blob, net, all
    #[arg(short = 'T', long = "type", value_delimiter = ',')]
    pub types: Vec<String>,

    /// Only show what would be removed
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Only remove entries not modified for this many days
    #[arg(short = 'D', long)]
    pub days: Option<u64>,
}

/// Namespaces named by `--type`; everything when none are given.
fn namespaces(types: &[String]) -> Result<Vec<Namespace>, Box<dyn std::error::Error>> {
    if types.is_empty() || types.iter().any(|t| t == "all") {
        return Ok(Namespace::ALL.to_vec());
    }
    let mut out = Vec::new();
    for t in types {
        let ns = Namespace::parse(t.trim())?;
        if !out.contains(&ns) {
            out.push(ns);
        }
    }
    Ok(out)
}

fn open_cache(config: &RuntimeConfig) -> Result<CacheHandle, Box<dyn std::error::Error>> {
    if config.cache.disabled {
        return Err("the image cache is disabled".into());
    }
    Ok(CacheHandle::new(&config.cache)?)
}

pub async fn execute(args: CacheArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        CacheCommand::List(args) => list(args, config),
        CacheCommand::Clean(args) => clean(args, config),
    }
}

fn list(args: ListArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open_cache(config)?;
    let mut table = new_table(&["NAME", "TYPE", "SIZE", "MODIFIED"]);
    let mut summary = Vec::new();
    let mut total = 0u64;

    for ns in namespaces(&args.types)? {
        let items = cache.list(ns)?;
        let bytes: u64 = items.iter().map(|i| i.size).sum();
        total += bytes;
        summary.push(format!("{} {} file(s) using {}", items.len(), ns, format_bytes(bytes)));
        for item in items {
            table.add_row(vec![
                item.name,
                ns.to_string(),
                format_bytes(item.size),
                format_ago(&item.modified),
            ]);
        }
    }

    if args.verbose {
        println!("{table}");
        println!();
    }
    println!("There are {}.", summary.join(", "));
    println!("Total space used: {}", format_bytes(total));
    Ok(())
}

fn clean(args: CleanArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open_cache(config)?;
    let opts = CleanOptions {
        dry_run: args.dry_run,
        days: args.days,
    };
    let report = cache.clean(&namespaces(&args.types)?, &opts)?;

    let verb = if args.dry_run { "Would remove" } else { "Removed" };
    for item in &report.removed {
        println!("{} {} {}", verb, item.namespace, item.name);
    }
    if report.skipped_busy > 0 {
        eprintln!("Skipped {} entr(ies) in use by another process", report.skipped_busy);
    }
    println!(
        "{} {} entr(ies), {}",
        verb,
        report.removed.len(),
        format_bytes(report.bytes)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_default_all() {
        assert_eq!(namespaces(&[]).unwrap(), Namespace::ALL.to_vec());
        assert_eq!(namespaces(&["all".to_string()]).unwrap(), Namespace::ALL.to_vec());
    }

    #[test]
    fn test_namespaces_selected() {
        let types = vec!["library".to_string(), "oci-blob".to_string(), "library".to_string()];
        assert_eq!(namespaces(&types).unwrap(), vec![Namespace::Library, Namespace::OciBlob]);
        assert!(namespaces(&["shub".to_string()]).is_err());
    }

    #[test]
    fn test_disabled_cache_refused() {
        let mut config = RuntimeConfig::default();
        config.cache.disabled = true;
        assert!(open_cache(&config).is_err());
    }

    #[test]
    fn test_list_and_clean_empty_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = RuntimeConfig::default();
        config.cache.root = Some(tmp.path().to_path_buf());

        list(
            ListArgs {
                types: Vec::new(),
                verbose: true,
            },
            &config,
        )
        .unwrap();
        clean(
            CleanArgs {
                types: vec!["net".to_string()],
                dry_run: true,
                days: Some(3),
            },
            &config,
        )
        .unwrap();
    }
}
