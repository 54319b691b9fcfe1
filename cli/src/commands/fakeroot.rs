//! `apptainer-core fakeroot` commands - edit `/etc/subuid` and `/etc/subgid`.

use std::path::Path;

use apptainer_core::error::ApptainerError;
use apptainer_core::RuntimeConfig;
use apptainer_runtime::SubidConfig;
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct FakerootArgs {
    #[command(subcommand)]
    pub command: FakerootCommand,
}

#[derive(Subcommand)]
pub enum FakerootCommand {
    /// Allocate subordinate uid and gid ranges for a user
    Add(UserArg),
    /// Remove a user's ranges
    Remove(UserArg),
    /// Re-enable a user's ranges
    Enable(UserArg),
    /// Disable a user's ranges without removing them
    Disable(UserArg),
    /// Show a user's ranges
    Show(UserArg),
}

#[derive(Args)]
pub struct UserArg {
    /// User name
    pub user: String,
}

/// The uid and gid databases, in that order.
fn databases(config: &RuntimeConfig) -> [(&'static str, &Path); 2] {
    [
        ("subuid", config.fakeroot.subuid_path.as_path()),
        ("subgid", config.fakeroot.subgid_path.as_path()),
    ]
}

fn edit<F>(config: &RuntimeConfig, user: &str, action: &str, f: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: Fn(&mut SubidConfig, &str) -> Result<(), ApptainerError>,
{
    for (name, path) in databases(config) {
        let mut db = SubidConfig::open(path)?;
        f(&mut db, user)?;
        tracing::info!(user, database = name, path = %path.display(), action, "Updated subid database");
    }
    Ok(())
}

pub async fn execute(args: FakerootArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        FakerootCommand::Add(arg) => {
            edit(config, &arg.user, "add", |db, user| db.add_user(user).map(|_| ()))?;
            println!("Added fakeroot mapping for {}", arg.user);
        }
        FakerootCommand::Remove(arg) => {
            edit(config, &arg.user, "remove", |db, user| db.remove_user(user))?;
            println!("Removed fakeroot mapping for {}", arg.user);
        }
        FakerootCommand::Enable(arg) => {
            edit(config, &arg.user, "enable", |db, user| db.enable_user(user))?;
            println!("Enabled fakeroot mapping for {}", arg.user);
        }
        FakerootCommand::Disable(arg) => {
            edit(config, &arg.user, "disable", |db, user| db.disable_user(user))?;
            println!("Disabled fakeroot mapping for {}", arg.user);
        }
        FakerootCommand::Show(arg) => {
            for line in show(config, &arg.user)? {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

fn show(config: &RuntimeConfig, user: &str) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let mut lines = Vec::new();
    for (name, path) in databases(config) {
        let db = SubidConfig::load(path)?;
        let line = match db.user_entry(user) {
            Ok(entry) => format!(
                "{}: {}:{} ({})",
                name,
                entry.start,
                entry.count,
                if entry.disabled { "disabled" } else { "enabled" }
            ),
            Err(ApptainerError::NotFound(_)) => format!("{}: no mapping", name),
            Err(e) => return Err(e.into()),
        };
        lines.push(line);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.fakeroot.subuid_path = tmp.path().join("subuid");
        config.fakeroot.subgid_path = tmp.path().join("subgid");
        config
    }

    #[test]
    fn test_add_edits_both_databases() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        std::fs::write(&config.fakeroot.subuid_path, "# uids\n").unwrap();

        edit(&config, "root", "add", |db, user| db.add_user(user).map(|_| ())).unwrap();

        let uids = std::fs::read_to_string(&config.fakeroot.subuid_path).unwrap();
        let gids = std::fs::read_to_string(&config.fakeroot.subgid_path).unwrap();
        assert!(uids.starts_with("# uids\n"));
        assert!(uids.contains("root:2147418112:65536"));
        assert!(gids.contains("root:2147418112:65536"));
    }

    #[test]
    fn test_show_reports_state() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        std::fs::write(&config.fakeroot.subuid_path, "!root:100000:65536\n").unwrap();
        std::fs::write(&config.fakeroot.subgid_path, "").unwrap();

        let lines = show(&config, "root").unwrap();
        assert_eq!(lines, vec!["subuid: 100000:65536 (disabled)", "subgid: no mapping"]);
    }

    #[test]
    fn test_remove_unknown_user_fails() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        assert!(edit(&config, "root", "remove", |db, user| db.remove_user(user)).is_err());
    }
}
