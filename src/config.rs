use std::path::PathBuf;
use std::time::Duration;

use crate::domain::RuntimeKind;
use crate::scheduler::Strategy;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub node_address: String,
    /// Fleet scheduling strategy.
    pub strategy: Strategy,
    /// Root for all on-host state (vm dirs, bundles, overlays, hypnos).
    pub state_dir: PathBuf,
    pub vmm_bin: PathBuf,
    pub gvisor_bin: PathBuf,
    /// Container backend is enabled only when the daemon URL is set.
    pub container_daemon_url: Option<String>,
    /// Marks this deployment's VMM processes for the reconcile sweep.
    pub deployment_marker: String,
    pub tap_prefix: String,
    pub default_runtime: RuntimeKind,
    pub auto_select: bool,
    pub heartbeat_period: Duration,
    pub watchdog_interval: Duration,
    pub capacity_cpu_milli: u64,
    pub capacity_mem_mb: u64,
    pub capacity_gpu: u32,
    pub hypnos_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from a key lookup (as env vars would provide).
    /// Used directly in tests to avoid mutating process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let state_dir: PathBuf = get("TARTARUS_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| "/var/lib/tartarus".into());

        Config {
            node_id: get("TARTARUS_NODE_ID").unwrap_or_else(|| {
                hostname().unwrap_or_else(|| "node-local".to_string())
            }),
            node_address: get("TARTARUS_NODE_ADDRESS")
                .unwrap_or_else(|| "127.0.0.1:7000".to_string()),
            strategy: get("TARTARUS_SCHEDULER_STRATEGY")
                .as_deref()
                .and_then(Strategy::parse)
                .unwrap_or(Strategy::LeastLoaded),
            vmm_bin: get("TARTARUS_VMM_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| "/usr/bin/firecracker".into()),
            gvisor_bin: get("TARTARUS_GVISOR_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| "/usr/bin/runsc".into()),
            container_daemon_url: get("TARTARUS_CONTAINER_DAEMON_URL"),
            deployment_marker: get("TARTARUS_DEPLOYMENT_MARKER")
                .unwrap_or_else(|| "tartarus".to_string()),
            tap_prefix: get("TARTARUS_TAP_PREFIX").unwrap_or_else(|| "trt-tap".to_string()),
            default_runtime: get("TARTARUS_DEFAULT_RUNTIME")
                .as_deref()
                .and_then(RuntimeKind::parse)
                .unwrap_or(RuntimeKind::Microvm),
            auto_select: get("TARTARUS_AUTO_SELECT")
                .map(|v| v != "false")
                .unwrap_or(true),
            heartbeat_period: secs(get("TARTARUS_HEARTBEAT_SECS"), 3),
            watchdog_interval: millis(get("TARTARUS_WATCHDOG_MILLIS"), 250),
            capacity_cpu_milli: parse_or(get("TARTARUS_CAPACITY_CPU_MILLI"), 8000),
            capacity_mem_mb: parse_or(get("TARTARUS_CAPACITY_MEM_MB"), 16384),
            capacity_gpu: parse_or(get("TARTARUS_CAPACITY_GPU"), 0),
            hypnos_enabled: get("TARTARUS_HYPNOS")
                .map(|v| v != "false")
                .unwrap_or(true),
            state_dir,
        }
    }
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn secs(raw: Option<String>, default: u64) -> Duration {
    Duration::from_secs(raw.and_then(|v| v.parse().ok()).unwrap_or(default))
}

fn millis(raw: Option<String>, default: u64) -> Duration {
    Duration::from_millis(raw.and_then(|v| v.parse().ok()).unwrap_or(default))
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}
