//! Subid ranges through the host's shadow-utils `libsubid`.

use std::ffi::CString;

use apptainer_core::error::{ApptainerError, Result};
use parking_lot::Mutex;

use super::subid::{SubidEntry, SubidSource};
use super::user::UserInfo;

#[repr(C)]
struct SubidRange {
    start: libc::c_ulong,
    count: libc::c_ulong,
}

#[link(name = "subid")]
extern "C" {
    fn subid_get_uid_ranges(owner: *const libc::c_char, ranges: *mut *mut SubidRange) -> libc::c_int;
    fn subid_get_gid_ranges(owner: *const libc::c_char, ranges: *mut *mut SubidRange) -> libc::c_int;
}

/// libsubid keeps global state and is not thread safe.
static LIBSUBID: Mutex<()> = parking_lot::const_mutex(());

/// [`SubidSource`] backed by libsubid, which follows the host's
/// `/etc/nsswitch.conf` `subid:` configuration.
#[derive(Debug, Clone, Copy)]
pub struct LibSubid {
    group: bool,
}

impl LibSubid {
    pub fn uids() -> Self {
        Self { group: false }
    }

    pub fn gids() -> Self {
        Self { group: true }
    }

    /// Ranges owned by `owner`, or `None` when it has none.
    fn query(&self, owner: &str) -> Result<Option<Vec<(u64, u64)>>> {
        let c_owner =
            CString::new(owner).map_err(|_| ApptainerError::InvalidInput(format!("invalid user name {:?}", owner)))?;
        let mut ranges: *mut SubidRange = std::ptr::null_mut();
        let _guard = LIBSUBID.lock();
        // SAFETY: c_owner is NUL-terminated and ranges is a valid out-pointer.
        let n = unsafe {
            if self.group {
                subid_get_gid_ranges(c_owner.as_ptr(), &mut ranges)
            } else {
                subid_get_uid_ranges(c_owner.as_ptr(), &mut ranges)
            }
        };
        if n < 0 {
            return Err(ApptainerError::Other(format!(
                "error fetching subid ranges for {} with libsubid: {}",
                owner, n
            )));
        }
        if n == 0 || ranges.is_null() {
            return Ok(None);
        }
        // SAFETY: libsubid returned n contiguous ranges allocated with malloc.
        let found = unsafe {
            let slice = std::slice::from_raw_parts(ranges, n as usize);
            let out = slice.iter().map(|r| (r.start as u64, r.count as u64)).collect();
            libc::free(ranges.cast());
            out
        };
        Ok(Some(found))
    }
}

impl SubidSource for LibSubid {
    fn entries_for(&self, user: &UserInfo) -> Result<Vec<SubidEntry>> {
        if user.name == "ALL" {
            return Err(ApptainerError::InvalidInput("user name ALL is not supported".to_string()));
        }
        let ranges = match self.query(&user.name)? {
            Some(r) => r,
            None => self.query(&user.uid.to_string())?.unwrap_or_default(),
        };
        Ok(ranges
            .into_iter()
            .filter_map(|(start, count)| {
                Some(SubidEntry {
                    owner: user.uid.to_string(),
                    start: u32::try_from(start).ok()?,
                    count: u32::try_from(count).ok()?,
                    disabled: false,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_all() {
        let all = UserInfo {
            name: "ALL".to_string(),
            uid: 4242,
        };
        assert!(matches!(LibSubid::uids().entries_for(&all), Err(ApptainerError::InvalidInput(_))));
    }

    #[test]
    fn test_unknown_user_has_no_ranges() {
        let ghost = UserInfo {
            name: "no-such-user-for-apptainer-tests".to_string(),
            uid: 4_000_000_000,
        };
        assert!(LibSubid::gids().entries_for(&ghost).unwrap().is_empty());
    }
}
