//! Whether the calling user may manage cgroups.
//!
//! Root outside a fakeroot namespace always may. Everyone else needs a
//! unified hierarchy, the systemd driver, a session bus and a writable
//! `XDG_RUNTIME_DIR`, so that systemd can delegate a scope to them.

use std::path::Path;

use super::procfs::Hierarchy;
use crate::fs::is_writable;
use crate::host_check::is_userns_remapped;

/// Outcome of [`check_rootless`]; `reasons` explains the decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub allowed: bool,
    pub reasons: Vec<String>,
}

/// Host properties the gate depends on.
#[derive(Debug, Clone, Copy)]
pub struct HostFacts {
    pub euid: u32,
    pub userns_remapped: bool,
    pub unified: bool,
}

impl HostFacts {
    pub fn detect() -> Self {
        Self {
            // SAFETY: geteuid has no preconditions.
            euid: unsafe { libc::geteuid() },
            userns_remapped: is_userns_remapped(),
            unified: Hierarchy::host().map(|h| h.is_unified()).unwrap_or(false),
        }
    }
}

/// Decide for the current process, reading variables through `env`.
pub fn check_rootless<F>(systemd: bool, env: F) -> GateVerdict
where
    F: Fn(&str) -> Option<String>,
{
    evaluate(&HostFacts::detect(), systemd, env, |p| p.is_dir() && is_writable(p))
}

/// The gate as a pure function of its inputs.
pub fn evaluate<F, W>(facts: &HostFacts, systemd: bool, env: F, writable_dir: W) -> GateVerdict
where
    F: Fn(&str) -> Option<String>,
    W: Fn(&Path) -> bool,
{
    if facts.euid == 0 && !facts.userns_remapped {
        return GateVerdict {
            allowed: true,
            reasons: vec!["running as root".to_string()],
        };
    }

    let mut reasons = Vec::new();
    if !facts.unified {
        reasons.push("rootless cgroups require the unified cgroups v2 hierarchy".to_string());
    }
    if !systemd {
        reasons.push("rootless cgroups require the systemd cgroup manager".to_string());
    }
    match env("DBUS_SESSION_BUS_ADDRESS").filter(|v| !v.is_empty()) {
        None => reasons.push("DBUS_SESSION_BUS_ADDRESS is not set".to_string()),
        Some(addr) if !addr.starts_with("unix:") => {
            reasons.push(format!("DBUS_SESSION_BUS_ADDRESS ({}) is not a unix: socket", addr))
        }
        Some(_) => {}
    }
    match env("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        None => reasons.push("XDG_RUNTIME_DIR is not set".to_string()),
        Some(dir) if !writable_dir(Path::new(&dir)) => {
            reasons.push(format!("XDG_RUNTIME_DIR ({}) is not a writable directory", dir))
        }
        Some(_) => {}
    }

    if reasons.is_empty() {
        GateVerdict {
            allowed: true,
            reasons: vec!["rootless cgroups requirements are met".to_string()],
        }
    } else {
        GateVerdict {
            allowed: false,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    const USER: HostFacts = HostFacts {
        euid: 1000,
        userns_remapped: false,
        unified: true,
    };

    const SESSION: &[(&str, &str)] = &[
        ("DBUS_SESSION_BUS_ADDRESS", "unix:path=/run/user/1000/bus"),
        ("XDG_RUNTIME_DIR", "/run/user/1000"),
    ];

    #[test]
    fn test_root_allowed() {
        let facts = HostFacts {
            euid: 0,
            userns_remapped: false,
            unified: false,
        };
        let verdict = evaluate(&facts, false, env(&[]), |_| false);
        assert!(verdict.allowed);
        assert_eq!(verdict.reasons.len(), 1);
    }

    #[test]
    fn test_fakeroot_is_not_root() {
        let facts = HostFacts {
            euid: 0,
            userns_remapped: true,
            unified: true,
        };
        let verdict = evaluate(&facts, false, env(SESSION), |_| true);
        assert!(!verdict.allowed);
        assert_eq!(verdict.reasons.len(), 1);
        assert!(verdict.reasons[0].contains("systemd"));
    }

    #[test]
    fn test_rootless_requirements_met() {
        let verdict = evaluate(&USER, true, env(SESSION), |_| true);
        assert!(verdict.allowed);
        assert!(!verdict.reasons.is_empty());
    }

    #[test]
    fn test_each_failure_has_its_own_reason() {
        let facts = HostFacts { unified: false, ..USER };
        let verdict = evaluate(
            &facts,
            false,
            env(&[("DBUS_SESSION_BUS_ADDRESS", "tcp:host=localhost"), ("XDG_RUNTIME_DIR", "/nope")]),
            |_| false,
        );
        assert!(!verdict.allowed);
        assert_eq!(verdict.reasons.len(), 4);
        let unique: std::collections::HashSet<_> = verdict.reasons.iter().collect();
        assert_eq!(unique.len(), 4);

        let verdict = evaluate(&USER, true, env(&[]), |_| true);
        assert_eq!(verdict.reasons.len(), 2);
        assert!(verdict.reasons.iter().any(|r| r.contains("DBUS_SESSION_BUS_ADDRESS")));
        assert!(verdict.reasons.iter().any(|r| r.contains("XDG_RUNTIME_DIR")));
    }

    #[test]
    fn test_real_directory_check() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().to_string_lossy().into_owned();
        let vars = [("DBUS_SESSION_BUS_ADDRESS", "unix:path=/tmp/bus"), ("XDG_RUNTIME_DIR", dir.as_str())];
        let verdict = evaluate(&USER, true, env(&vars), |p| p.is_dir() && is_writable(p));
        assert!(verdict.allowed, "{:?}", verdict.reasons);
    }
}
