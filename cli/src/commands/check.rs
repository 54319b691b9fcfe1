//! `apptainer-core check` command - host readiness for unprivileged use.

use apptainer_core::RuntimeConfig;
use apptainer_runtime::{check_rootless, check_user_namespace_support, uid_range, GateVerdict};
use clap::Args;

#[derive(Args)]
pub struct CheckArgs {
    /// Evaluate cgroup support for the systemd cgroup manager
    #[arg(long)]
    pub systemd: bool,
}

fn report_gate(verdict: &GateVerdict) -> Vec<String> {
    let mut lines = vec![format!(
        "Cgroups:         {}",
        if verdict.allowed { "ok" } else { "unavailable" }
    )];
    lines.extend(verdict.reasons.iter().map(|r| format!("  - {}", r)));
    lines
}

pub async fn execute(args: CheckArgs, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut ok = true;

    let verdict = check_rootless(args.systemd || config.cgroups.systemd, |key| std::env::var(key).ok());
    ok &= verdict.allowed;
    for line in report_gate(&verdict) {
        println!("{}", line);
    }

    match check_user_namespace_support() {
        Ok(support) => println!("User namespaces: ok (max {})", support.max_user_namespaces),
        Err(e) => {
            ok = false;
            println!("User namespaces: unavailable");
            println!("  - {}", e);
        }
    }

    // SAFETY: getuid has no preconditions.
    let uid = unsafe { libc::getuid() };
    match uid_range(&config.fakeroot, uid) {
        Ok(mapping) => println!(
            "Fakeroot:        ok (uid {} maps {} ids from {})",
            uid, mapping.size, mapping.host_id
        ),
        Err(e) => {
            ok = false;
            println!("Fakeroot:        unavailable");
            println!("  - {}", e);
        }
    }

    if ok {
        Ok(())
    } else {
        Err("some host checks failed".into())
    }
}
