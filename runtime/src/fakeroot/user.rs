//! Passwd database lookups.

use std::ffi::{CStr, CString};

use apptainer_core::error::{ApptainerError, Result};

/// The fields of a passwd entry the mapper uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
}

/// Name and uid resolution, swappable for tests.
pub trait UserDb: Send + Sync {
    fn by_name(&self, name: &str) -> Result<UserInfo>;
    fn by_uid(&self, uid: u32) -> Result<UserInfo>;
}

/// The host passwd database through NSS (`getpwnam_r` / `getpwuid_r`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUserDb;

const INITIAL_BUFFER: usize = 1024;
const MAX_BUFFER: usize = 1 << 20;

enum Key<'a> {
    Name(&'a CStr),
    Uid(u32),
}

fn getpw(key: Key<'_>) -> std::io::Result<Option<UserInfo>> {
    let mut size = INITIAL_BUFFER;
    loop {
        let mut buf: Vec<libc::c_char> = vec![0; size];
        // SAFETY: zeroed passwd is a valid out-parameter; only read when result is non-null.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: every pointer refers to storage that outlives the call.
        let rc = unsafe {
            match key {
                Key::Name(name) => libc::getpwnam_r(name.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result),
                Key::Uid(uid) => libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result),
            }
        };
        if rc == libc::ERANGE && size < MAX_BUFFER {
            size *= 2;
            continue;
        }
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc));
        }
        if result.is_null() {
            return Ok(None);
        }
        // SAFETY: on success pw_name points into buf, which is still alive.
        let name = unsafe { CStr::from_ptr(pwd.pw_name) }.to_string_lossy().into_owned();
        return Ok(Some(UserInfo { name, uid: pwd.pw_uid }));
    }
}

impl UserDb for SystemUserDb {
    fn by_name(&self, name: &str) -> Result<UserInfo> {
        let cname = CString::new(name).map_err(|_| ApptainerError::InvalidInput(format!("invalid user name {:?}", name)))?;
        getpw(Key::Name(&cname))?.ok_or_else(|| ApptainerError::NotFound(format!("user {}", name)))
    }

    fn by_uid(&self, uid: u32) -> Result<UserInfo> {
        getpw(Key::Uid(uid))?.ok_or_else(|| ApptainerError::NotFound(format!("user with uid {}", uid)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A fixed user table.
    pub(crate) struct FakeUsers(pub HashMap<String, u32>);

    impl FakeUsers {
        pub(crate) fn new(users: &[(&str, u32)]) -> Self {
            Self(users.iter().map(|(n, u)| (n.to_string(), *u)).collect())
        }
    }

    impl UserDb for FakeUsers {
        fn by_name(&self, name: &str) -> Result<UserInfo> {
            self.0
                .get(name)
                .map(|uid| UserInfo {
                    name: name.to_string(),
                    uid: *uid,
                })
                .ok_or_else(|| ApptainerError::NotFound(format!("user {}", name)))
        }

        fn by_uid(&self, uid: u32) -> Result<UserInfo> {
            self.0
                .iter()
                .find(|(_, u)| **u == uid)
                .map(|(name, uid)| UserInfo {
                    name: name.clone(),
                    uid: *uid,
                })
                .ok_or_else(|| ApptainerError::NotFound(format!("user with uid {}", uid)))
        }
    }

    #[test]
    fn test_root_lookup() {
        let root = SystemUserDb.by_uid(0).unwrap();
        assert_eq!(root.uid, 0);
        assert_eq!(SystemUserDb.by_name(&root.name).unwrap(), root);
    }

    #[test]
    fn test_unknown_user() {
        assert!(matches!(
            SystemUserDb.by_name("no-such-user-for-apptainer-tests"),
            Err(ApptainerError::NotFound(_))
        ));
        assert!(SystemUserDb.by_name("bad\0name").is_err());
    }
}
