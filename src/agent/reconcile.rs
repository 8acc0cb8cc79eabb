//! Restart sweep.
//!
//! After an agent crash nothing on the host is owned by a live run, so
//! start-up reclaims leftovers: tap devices matching the agent's tap
//! prefix are deleted, and VMM processes carrying the deployment marker
//! on their command line are killed. Both steps log and continue on
//! per-item errors.

use std::path::Path;
use std::process::Stdio;

use sysinfo::System;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Tap devices created for sandboxes start with this.
    pub tap_prefix: String,
    /// File name of the VMM binary.
    pub vmm_bin_name: String,
    /// Marker baked into VMM command lines at launch.
    pub deployment_marker: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub taps_deleted: usize,
    pub processes_killed: usize,
}

/// Host links whose name starts with the tap prefix.
pub fn find_orphan_taps(net_class_dir: &Path, tap_prefix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(net_class_dir) else {
        return Vec::new();
    };
    let mut taps: Vec<String> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.starts_with(tap_prefix).then_some(name)
        })
        .collect();
    taps.sort();
    taps
}

/// A process is ours iff the binary name matches and the command line
/// carries the deployment marker.
pub fn is_deployment_vmm(
    name: &str,
    cmdline: &[String],
    vmm_bin_name: &str,
    marker: &str,
) -> bool {
    name == vmm_bin_name && cmdline.iter().any(|arg| arg.contains(marker))
}

pub async fn reconcile_host(config: &ReconcileConfig) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for tap in find_orphan_taps(Path::new("/sys/class/net"), &config.tap_prefix) {
        tracing::info!(tap = %tap, "reclaiming orphan tap");
        let status = tokio::process::Command::new("ip")
            .args(["link", "del", &tap])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => report.taps_deleted += 1,
            Ok(status) => {
                tracing::warn!(tap = %tap, code = ?status.code(), "tap delete failed");
            }
            Err(e) => {
                tracing::warn!(tap = %tap, error = %e, "tap delete failed");
            }
        }
    }

    let mut system = System::new();
    system.refresh_processes();
    for (pid, process) in system.processes() {
        if is_deployment_vmm(
            process.name(),
            process.cmd(),
            &config.vmm_bin_name,
            &config.deployment_marker,
        ) {
            tracing::info!(pid = %pid, "killing orphan vmm process");
            if process.kill() {
                report.processes_killed += 1;
            } else {
                tracing::warn!(pid = %pid, "kill signal not delivered");
            }
        }
    }

    tracing::info!(
        taps = report.taps_deleted,
        processes = report.processes_killed,
        "reconcile sweep finished"
    );
    report
}
