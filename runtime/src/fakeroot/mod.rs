//! Fakeroot identity mapping.
//!
//! Resolves a user to the contiguous subordinate uid/gid range its user
//! namespace maps container id 1 onto, and edits the `/etc/subuid` and
//! `/etc/subgid` databases on behalf of an administrator.

#[cfg(feature = "libsubid")]
pub mod libsubid;
pub mod subid;
pub mod user;

use apptainer_core::config::FakerootConfig;
use apptainer_core::error::Result;

#[cfg(feature = "libsubid")]
pub use libsubid::LibSubid;
pub use subid::{select_range, FileSubidSource, IdMapping, SubidConfig, SubidEntry, SubidSource, MIN_RANGE, START_MAX};
pub use user::{SystemUserDb, UserDb, UserInfo};

/// The range source the build was configured for: libsubid when the
/// `libsubid` feature is on, the configured file otherwise.
pub fn default_source(config: &FakerootConfig, group: bool) -> Box<dyn SubidSource> {
    #[cfg(feature = "libsubid")]
    {
        let _ = config;
        if group {
            Box::new(LibSubid::gids())
        } else {
            Box::new(LibSubid::uids())
        }
    }
    #[cfg(not(feature = "libsubid"))]
    {
        let path = if group { &config.subgid_path } else { &config.subuid_path };
        Box::new(FileSubidSource::new(path))
    }
}

/// Subordinate uid mapping for `uid`.
pub fn uid_range(config: &FakerootConfig, uid: u32) -> Result<IdMapping> {
    resolve(&SystemUserDb, default_source(config, false).as_ref(), uid)
}

/// Subordinate gid mapping for the user owning `uid`.
pub fn gid_range(config: &FakerootConfig, uid: u32) -> Result<IdMapping> {
    resolve(&SystemUserDb, default_source(config, true).as_ref(), uid)
}

/// Look `uid` up in `users` and select its range from `source`.
pub fn resolve(users: &dyn UserDb, source: &dyn SubidSource, uid: u32) -> Result<IdMapping> {
    let user = users.by_uid(uid)?;
    let entries = source.entries_for(&user)?;
    let entry = select_range(&entries, &user)?;
    tracing::debug!(user = %user.name, uid, start = entry.start, count = entry.count, "Selected subid range");
    Ok(entry.mapping())
}

#[cfg(test)]
mod tests {
    use super::user::tests::FakeUsers;
    use super::*;
    use apptainer_core::error::ApptainerError;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("subuid");
        std::fs::write(&path, "alice:100000:65536\n1000:300000:131072\n!alice:500000:262144\n").unwrap();
        let users = FakeUsers::new(&[("alice", 1000)]);

        let mapping = resolve(&users, &FileSubidSource::new(&path), 1000).unwrap();
        assert_eq!(
            mapping,
            IdMapping {
                container_id: 1,
                host_id: 300000,
                size: 131072,
            }
        );
    }

    #[test]
    fn test_resolve_unknown_uid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("subuid");
        std::fs::write(&path, "").unwrap();
        let users = FakeUsers::new(&[("alice", 1000)]);
        assert!(matches!(
            resolve(&users, &FileSubidSource::new(&path), 2000),
            Err(ApptainerError::NotFound(_))
        ));
        assert!(matches!(
            resolve(&users, &FileSubidSource::new(&path), 1000),
            Err(ApptainerError::NoValidMapping(_))
        ));
    }

    #[cfg(not(feature = "libsubid"))]
    #[test]
    fn test_default_source_reads_configured_file() {
        let tmp = TempDir::new().unwrap();
        let config = FakerootConfig {
            subuid_path: tmp.path().join("subuid"),
            subgid_path: tmp.path().join("subgid"),
        };
        std::fs::write(&config.subuid_path, "bob:200000:65536\n").unwrap();
        std::fs::write(&config.subgid_path, "bob:400000:65536\n").unwrap();
        let users = FakeUsers::new(&[("bob", 1001)]);

        let uids = resolve(&users, default_source(&config, false).as_ref(), 1001).unwrap();
        let gids = resolve(&users, default_source(&config, true).as_ref(), 1001).unwrap();
        assert_eq!(uids.host_id, 200000);
        assert_eq!(gids.host_id, 400000);
    }
}
