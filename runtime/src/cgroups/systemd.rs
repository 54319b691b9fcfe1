//! systemd cgroup driver: transient scopes started over D-Bus.
//!
//! Groups are named `slice:prefix:name`; the scope unit is
//! `prefix-name.scope` placed in `slice`. Resource files are still written
//! through the cgroupfs backends since scopes are started with
//! `Delegate=yes`.

use std::process::Command;

use apptainer_core::error::{ApptainerError, Result};

/// The calls the manager makes on the systemd bus.
pub trait SystemdBus: Send + Sync {
    /// Fail with `SystemdUnavailable` if the bus cannot be reached.
    fn ping(&self) -> Result<()>;

    /// Start `unit` as a transient, delegated scope holding `pid`.
    fn start_scope(&self, unit: &str, slice: &str, pid: u32) -> Result<()>;

    /// Stop `unit`; a unit that is already gone is not an error.
    fn stop_unit(&self, unit: &str) -> Result<()>;

    /// The unit's cgroup path relative to the hierarchy root.
    fn control_group(&self, unit: &str) -> Result<String>;
}

/// A `slice:prefix:name` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemdGroup {
    pub slice: String,
    pub prefix: String,
    pub name: String,
}

impl SystemdGroup {
    pub fn parse(group: &str) -> Result<Self> {
        let parts: Vec<&str> = group.split(':').collect();
        match parts.as_slice() {
            [slice, prefix, name] if !name.is_empty() => {
                let slice: &str = if slice.is_empty() { "system.slice" } else { slice };
                if !slice.ends_with(".slice") {
                    return Err(ApptainerError::InvalidInput(format!(
                        "systemd cgroup {}: {} is not a slice",
                        group, slice
                    )));
                }
                Ok(Self {
                    slice: slice.to_string(),
                    prefix: prefix.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(ApptainerError::InvalidInput(format!(
                "systemd cgroup {} is not of the form slice:prefix:name",
                group
            ))),
        }
    }

    pub fn unit(&self) -> String {
        if self.prefix.is_empty() {
            format!("{}.scope", self.name)
        } else {
            format!("{}-{}.scope", self.prefix, self.name)
        }
    }

    /// `/a.slice/a-b.slice/prefix-name.scope` for slice `a-b.slice`.
    pub fn path(&self) -> String {
        format!("{}/{}", expand_slice(&self.slice), self.unit())
    }
}

/// Path of a slice unit: every dash-separated ancestor is its own slice.
pub fn expand_slice(slice: &str) -> String {
    let stem = slice.trim_end_matches(".slice");
    if stem.is_empty() || stem == "-" {
        return String::new();
    }
    let mut path = String::new();
    let mut prefix = String::new();
    for (i, part) in stem.split('-').enumerate() {
        if i > 0 {
            prefix.push('-');
        }
        prefix.push_str(part);
        path.push('/');
        path.push_str(&prefix);
        path.push_str(".slice");
    }
    path
}

/// Talks to systemd through `busctl`.
#[derive(Debug, Clone)]
pub struct Busctl {
    user: bool,
}

impl Busctl {
    /// The system bus for root, the user's session bus otherwise.
    pub fn for_current_user() -> Self {
        // SAFETY: geteuid has no preconditions.
        let euid = unsafe { libc::geteuid() };
        Self { user: euid != 0 }
    }

    pub fn new(user: bool) -> Self {
        Self { user }
    }

    fn busctl(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("busctl");
        if self.user {
            cmd.arg("--user");
        }
        cmd.args(args);
        tracing::trace!(?args, user = self.user, "busctl");
        let output = cmd
            .output()
            .map_err(|e| ApptainerError::SystemdUnavailable(format!("failed to run busctl: {}", e)))?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(classify_busctl_error(&String::from_utf8_lossy(&output.stderr)))
    }

    fn manager_call(&self, method: &str, signature: &str, args: &[&str]) -> Result<String> {
        let mut full = vec![
            "call",
            "org.freedesktop.systemd1",
            "/org/freedesktop/systemd1",
            "org.freedesktop.systemd1.Manager",
            method,
            signature,
        ];
        full.extend_from_slice(args);
        self.busctl(&full)
    }
}

impl SystemdBus for Busctl {
    fn ping(&self) -> Result<()> {
        self.busctl(&["call", "org.freedesktop.DBus", "/org/freedesktop/DBus", "org.freedesktop.DBus", "GetId"])
            .map(|_| ())
            .map_err(|e| match e {
                ApptainerError::SystemdUnavailable(_) => e,
                other => ApptainerError::SystemdUnavailable(other.to_string()),
            })
    }

    fn start_scope(&self, unit: &str, slice: &str, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        self.manager_call(
            "StartTransientUnit",
            "ssa(sv)a(sa(sv))",
            &[
                unit, "replace", "3", "Slice", "s", slice, "Delegate", "b", "true", "PIDs", "au", "1", pid.as_str(), "0",
            ],
        )?;
        tracing::debug!(unit, slice, pid = %pid, "Started transient scope");
        Ok(())
    }

    fn stop_unit(&self, unit: &str) -> Result<()> {
        match self.manager_call("StopUnit", "ss", &[unit, "replace"]) {
            Ok(_) => Ok(()),
            Err(ApptainerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn control_group(&self, unit: &str) -> Result<String> {
        let object = self.manager_call("GetUnit", "s", &[unit])?;
        let object = parse_busctl_value(&object)
            .ok_or_else(|| ApptainerError::CgroupError(format!("unexpected GetUnit reply: {}", object.trim())))?;
        let property = self.busctl(&[
            "get-property",
            "org.freedesktop.systemd1",
            &object,
            "org.freedesktop.systemd1.Scope",
            "ControlGroup",
        ])?;
        parse_busctl_value(&property)
            .ok_or_else(|| ApptainerError::CgroupError(format!("unexpected ControlGroup reply: {}", property.trim())))
    }
}

/// Value of a single-field busctl reply such as `o "/org/..."` or `s "/x"`.
fn parse_busctl_value(reply: &str) -> Option<String> {
    let (_, value) = reply.trim().split_once(' ')?;
    let value = value.trim().trim_matches('"');
    (!value.is_empty()).then(|| value.to_string())
}

fn classify_busctl_error(stderr: &str) -> ApptainerError {
    let msg = stderr.trim().to_string();
    let lower = msg.to_lowercase();
    if lower.contains("not loaded") || lower.contains("no such unit") {
        ApptainerError::NotFound(msg)
    } else if lower.contains("access denied") || lower.contains("interactive authentication required") {
        ApptainerError::PermissionDenied(msg)
    } else if lower.contains("failed to connect to bus") || lower.contains("no medium found") {
        ApptainerError::SystemdUnavailable(msg)
    } else if lower.contains("already exists") {
        ApptainerError::Conflict(msg)
    } else {
        ApptainerError::CgroupError(msg)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records calls; `unreachable` makes every call fail.
    #[derive(Default)]
    pub(crate) struct FakeBus {
        pub unreachable: bool,
        pub calls: Mutex<Vec<String>>,
    }

    impl SystemdBus for FakeBus {
        fn ping(&self) -> Result<()> {
            if self.unreachable {
                return Err(ApptainerError::SystemdUnavailable("no bus".to_string()));
            }
            Ok(())
        }

        fn start_scope(&self, unit: &str, slice: &str, pid: u32) -> Result<()> {
            self.ping()?;
            self.calls.lock().push(format!("start {} {} {}", unit, slice, pid));
            Ok(())
        }

        fn stop_unit(&self, unit: &str) -> Result<()> {
            self.ping()?;
            self.calls.lock().push(format!("stop {}", unit));
            Ok(())
        }

        fn control_group(&self, unit: &str) -> Result<String> {
            Err(ApptainerError::NotFound(unit.to_string()))
        }
    }

    #[test]
    fn test_group_parsing() {
        let group = SystemdGroup::parse("system.slice:apptainer:42").unwrap();
        assert_eq!(group.unit(), "apptainer-42.scope");
        assert_eq!(group.path(), "/system.slice/apptainer-42.scope");

        let nested = SystemdGroup::parse("user-1000.slice:app:x").unwrap();
        assert_eq!(nested.path(), "/user.slice/user-1000.slice/app-x.scope");

        assert_eq!(SystemdGroup::parse(":apptainer:1").unwrap().slice, "system.slice");
        assert!(SystemdGroup::parse("/apptainer/1").is_err());
        assert!(SystemdGroup::parse("system:apptainer:1").is_err());
    }

    #[test]
    fn test_expand_slice() {
        assert_eq!(expand_slice("-.slice"), "");
        assert_eq!(expand_slice("a-b-c.slice"), "/a.slice/a-b.slice/a-b-c.slice");
    }

    #[test]
    fn test_busctl_replies() {
        assert_eq!(
            parse_busctl_value("o \"/org/freedesktop/systemd1/unit/apptainer_2d1_2escope\"\n").as_deref(),
            Some("/org/freedesktop/systemd1/unit/apptainer_2d1_2escope")
        );
        assert_eq!(parse_busctl_value("s \"\"").as_deref(), None);
        assert!(matches!(
            classify_busctl_error("Call failed: Unit apptainer-1.scope not loaded."),
            ApptainerError::NotFound(_)
        ));
        assert!(matches!(
            classify_busctl_error("Failed to connect to bus: No medium found"),
            ApptainerError::SystemdUnavailable(_)
        ));
    }
}
