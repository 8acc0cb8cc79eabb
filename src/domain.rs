use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ─────────────────────────────────────────────────────

pub type SandboxId = String;
pub type TemplateId = String;
pub type NodeId = String;
pub type SnapshotId = String;
pub type PolicyId = String;

// ── Metadata keys ───────────────────────────────────────────────────

/// Recognised request-metadata keys. Scheduler prefixes other than the two
/// below are ignored for forward compatibility.
pub mod meta {
    pub const ISOLATION_TYPE: &str = "isolation_type";
    pub const PREFERRED_RUNTIME: &str = "preferred_runtime";
    pub const QUARANTINE: &str = "quarantine";
    pub const WARM: &str = "warm";
    pub const KERNEL_MODULES: &str = "kernel_modules";
    pub const DEVICES: &str = "devices";
    pub const AFFINITY_PREFIX: &str = "scheduler.affinity.";
    pub const ANTI_AFFINITY_PREFIX: &str = "scheduler.antiaffinity.";
}

/// Node label that pins a node to a heat pool.
pub const POOL_LABEL: &str = "phlegethon.tartarus.io/pool";

/// Node label marking a quarantine node.
pub const QUARANTINE_LABEL: &str = "quarantine";

// ── Run status ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

// ── Resources ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    pub count: u32,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU in milli-cores.
    pub cpu_milli: u32,
    /// Memory in megabytes.
    pub mem_mb: u32,
    #[serde(default)]
    pub gpu: GpuSpec,
    /// Wall-clock budget. Zero means unlimited.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    #[serde(default)]
    pub profile: String,
}

/// Capacity totals per node or per backend. Same units as `ResourceSpec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_milli: u64,
    pub mem_mb: u64,
    pub gpu: u32,
}

impl Capacity {
    pub fn add(&mut self, r: &ResourceSpec) {
        self.cpu_milli += u64::from(r.cpu_milli);
        self.mem_mb += u64::from(r.mem_mb);
        self.gpu += r.gpu.count;
    }

    /// Free memory in megabytes given this capacity and an allocation.
    pub fn free_mem_mb(&self, allocated: &Capacity) -> u64 {
        self.mem_mb.saturating_sub(allocated.mem_mb)
    }
}

// ── Requests ────────────────────────────────────────────────────────

/// Retention behaviour for a run's writable state after exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Discard,
    Retain,
}

/// Immutable once enqueued. The scheduler stamps `node_id`; everything
/// else is set by the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub id: SandboxId,
    pub template: TemplateId,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub heat_level: Option<String>,
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    /// Reference into the network policy store (`req.network.id` on the wire).
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl SandboxRequest {
    /// Full argv: command followed by extra args.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn meta_is(&self, key: &str, value: &str) -> bool {
        self.metadata.get(key).map(String::as_str) == Some(value)
    }
}

// ── Runs ────────────────────────────────────────────────────────────

/// Which backend owns a run. Tagged on the run at launch so later
/// operations can be delegated without probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Microvm,
    Container,
    Gvisor,
    Wasm,
}

impl RuntimeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "microvm" => Some(RuntimeKind::Microvm),
            "container" => Some(RuntimeKind::Container),
            "gvisor" => Some(RuntimeKind::Gvisor),
            "wasm" => Some(RuntimeKind::Wasm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Microvm => "microvm",
            RuntimeKind::Container => "container",
            RuntimeKind::Gvisor => "gvisor",
            RuntimeKind::Wasm => "wasm",
        }
    }
}

/// Mutable run state. `id` equals the request id. Terminal transition is
/// monotonic; `exit_code` is present exactly for SUCCEEDED/FAILED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRun {
    pub id: SandboxId,
    pub request_id: SandboxId,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub template: TemplateId,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "runtime_type")]
    pub runtime: Option<RuntimeKind>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last observed memory usage in megabytes.
    #[serde(default)]
    pub memory_mb: u64,
}

impl SandboxRun {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ── Nodes ───────────────────────────────────────────────────────────

/// A node is considered healthy while its heartbeat is at most this old.
pub const HEARTBEAT_FRESHNESS: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub capacity: Capacity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub info: NodeInfo,
    pub allocated: Capacity,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub active_runs: Vec<SandboxId>,
}

impl NodeStatus {
    /// Strictly-greater-than-10s heartbeats are stale.
    pub fn healthy(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age <= chrono::Duration::from_std(HEARTBEAT_FRESHNESS).unwrap_or_default()
    }

    pub fn free_mem_mb(&self) -> u64 {
        self.info.capacity.free_mem_mb(&self.allocated)
    }

    pub fn label_is(&self, key: &str, value: &str) -> bool {
        self.info.labels.get(key).map(String::as_str) == Some(value)
    }
}

// ── Policies ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub id: PolicyId,
    pub template_id: TemplateId,
    pub resources: ResourceSpec,
    pub network: String,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Monotonic counter for optimistic concurrency in the policy store.
    pub version: u64,
}

impl SandboxPolicy {
    /// Lockdown defaults applied when a template has no stored policy.
    pub fn default_lockdown(template_id: &str) -> Self {
        Self {
            id: format!("policy-{template_id}"),
            template_id: template_id.to_string(),
            resources: ResourceSpec {
                cpu_milli: 1000,
                mem_mb: 128,
                gpu: GpuSpec::default(),
                ttl: Duration::ZERO,
                profile: String::new(),
            },
            network: "no-internet".into(),
            retention: RetentionPolicy::Discard,
            tags: vec![],
            version: 0,
        }
    }
}

/// Immutable limit set attached to a run at arm time. Zero disables the
/// corresponding check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub max_runtime: Duration,
    pub max_cpu_milli: u32,
    pub max_memory_mb: u64,
    pub max_egress_bytes: u64,
    pub max_ingress_bytes: u64,
    pub max_banned_ip_attempts: u64,
    pub kill_on_breach: bool,
}

// ── Launch descriptor ───────────────────────────────────────────────

/// Immutable base image set for a template. A present memory file means
/// the microVM backend resumes instead of booting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: SnapshotId,
    pub disk_image: PathBuf,
    #[serde(default)]
    pub mem_file: Option<PathBuf>,
    #[serde(default)]
    pub kernel_image: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAssignment {
    pub ip: String,
    pub gateway: String,
    pub cidr: String,
}

/// What a backend needs to start a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub snapshot: SnapshotRef,
    pub overlay_path: PathBuf,
    #[serde(default)]
    pub tap_device: Option<String>,
    #[serde(default)]
    pub ip: Option<IpAssignment>,
    pub vcpu: u32,
    pub memory_mb: u32,
}

// ── Heat classes ────────────────────────────────────────────────────

/// Coarse resource class a heat level resolves to. Nodes carrying the
/// pool label route only workloads of the matching class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeatClass {
    pub name: String,
    pub gpu_count: u32,
}

/// Built-in class table. Deployments may extend it via config.
pub fn default_heat_classes() -> BTreeMap<String, HeatClass> {
    let mut classes = BTreeMap::new();
    for (name, gpu_count) in [("cocytus", 0), ("styx", 0), ("phlegethon", 1), ("pyriphlegethon", 4)]
    {
        classes.insert(
            name.to_string(),
            HeatClass {
                name: name.to_string(),
                gpu_count,
            },
        );
    }
    classes
}

// ── Serde helpers ───────────────────────────────────────────────────

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, mem_cap: u64, mem_alloc: u64, hb_age_secs: i64) -> NodeStatus {
        NodeStatus {
            info: NodeInfo {
                id: id.into(),
                address: format!("{id}.nodes.internal:7000"),
                labels: BTreeMap::new(),
                capacity: Capacity {
                    cpu_milli: 8000,
                    mem_mb: mem_cap,
                    gpu: 0,
                },
            },
            allocated: Capacity {
                cpu_milli: 0,
                mem_mb: mem_alloc,
                gpu: 0,
            },
            last_heartbeat: Utc::now() - chrono::Duration::seconds(hb_age_secs),
            active_runs: vec![],
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Scheduled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn heartbeat_at_exactly_ten_seconds_is_healthy() {
        let now = Utc::now();
        let mut n = node("n1", 8192, 0, 0);
        n.last_heartbeat = now - chrono::Duration::seconds(10);
        assert!(n.healthy(now));

        n.last_heartbeat = now - chrono::Duration::milliseconds(10_001);
        assert!(!n.healthy(now));
    }

    #[test]
    fn free_memory_saturates() {
        let n = node("n1", 4096, 8192, 0);
        assert_eq!(n.free_mem_mb(), 0);
    }

    #[test]
    fn capacity_accumulates_specs() {
        let mut cap = Capacity::default();
        cap.add(&ResourceSpec {
            cpu_milli: 500,
            mem_mb: 256,
            gpu: GpuSpec {
                count: 1,
                kind: "a100".into(),
            },
            ttl: Duration::ZERO,
            profile: String::new(),
        });
        cap.add(&ResourceSpec {
            cpu_milli: 250,
            mem_mb: 128,
            ..Default::default()
        });
        assert_eq!(cap.cpu_milli, 750);
        assert_eq!(cap.mem_mb, 384);
        assert_eq!(cap.gpu, 1);
    }

    #[test]
    fn runtime_kind_round_trips() {
        for kind in [
            RuntimeKind::Microvm,
            RuntimeKind::Container,
            RuntimeKind::Gvisor,
            RuntimeKind::Wasm,
        ] {
            assert_eq!(RuntimeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RuntimeKind::parse("jail"), None);
    }

    #[test]
    fn run_status_serializes_screaming() {
        let json = serde_json::to_string(&RunStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }

    #[test]
    fn default_lockdown_policy_values() {
        let p = SandboxPolicy::default_lockdown("py312");
        assert_eq!(p.resources.cpu_milli, 1000);
        assert_eq!(p.resources.mem_mb, 128);
        assert_eq!(p.network, "no-internet");
        assert_eq!(p.version, 0);
    }

    #[test]
    fn request_argv_appends_extra_args() {
        let req = SandboxRequest {
            id: "sb-1".into(),
            template: "py312".into(),
            node_id: None,
            heat_level: None,
            command: vec!["python".into(), "-u".into()],
            args: vec!["main.py".into()],
            env: BTreeMap::new(),
            resources: ResourceSpec::default(),
            network: None,
            retention: RetentionPolicy::Discard,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        };
        assert_eq!(req.argv(), vec!["python", "-u", "main.py"]);
    }
}
