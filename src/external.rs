//! External collaborators, specified by their interfaces.
//!
//! The queue, registry, policy store, template catalogue, snapshot
//! store, overlay pool, and network gateway are deployment-provided.
//! The in-memory implementations here back single-host deployments and
//! every component test; they keep the same keying and semantics the
//! production stores use (`node:<id>`, `policy:<template_id>`,
//! `run:<sandbox_id>`).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Capacity, NodeId, NodeInfo, NodeStatus, SandboxId, SandboxPolicy, SandboxRequest,
    SandboxRun, SnapshotRef, TemplateId,
};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,

    #[error("queue: {0}")]
    Internal(String),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict: expected {expected}, got {got}")]
    VersionConflict { expected: u64, got: u64 },

    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("store: {0}")]
    Internal(String),
}

// ── Queue ───────────────────────────────────────────────────────────

pub type Receipt = String;

/// Durable work queue. Deliveries are at-least-once; acks are durable.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, req: SandboxRequest) -> Result<(), QueueError>;

    /// Blocks until a request is available.
    async fn dequeue(&self) -> Result<(SandboxRequest, Receipt), QueueError>;

    /// Idempotent; a second ack of the same receipt is a no-op.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;

    /// Return the delivery to the queue for redelivery.
    async fn nack(&self, receipt: &str, reason: &str) -> Result<(), QueueError>;

    async fn len(&self) -> usize;
}

pub struct InMemoryQueue {
    ready: Mutex<VecDeque<SandboxRequest>>,
    in_flight: Mutex<HashMap<Receipt, SandboxRequest>>,
    notify: tokio::sync::Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, req: SandboxRequest) -> Result<(), QueueError> {
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(req);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<(SandboxRequest, Receipt), QueueError> {
        loop {
            let notified = self.notify.notified();
            if let Some(req) = self
                .ready
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                let receipt = uuid::Uuid::new_v4().to_string();
                let _ = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(receipt.clone(), req.clone());
                return Ok((req, receipt));
            }
            notified.await;
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        let _ = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(receipt);
        Ok(())
    }

    async fn nack(&self, receipt: &str, reason: &str) -> Result<(), QueueError> {
        let req = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(receipt);
        if let Some(req) = req {
            tracing::debug!(sandbox = %req.id, reason = %reason, "nacked, redelivering");
            self.ready
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(req);
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn len(&self) -> usize {
        self.ready.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// One heartbeat publication from a node agent.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub node: NodeInfo,
    pub load: Capacity,
    pub active_runs: Vec<SandboxId>,
    pub time: DateTime<Utc>,
}

/// Shared fleet state. Node entries carry a TTL of 3x the heartbeat
/// period; expired entries are not listed.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeStatus>, StoreError>;
    async fn get_node(&self, id: &str) -> Result<NodeStatus, StoreError>;
    async fn update_heartbeat(&self, hb: Heartbeat) -> Result<(), StoreError>;
    async fn mark_draining(&self, node_id: &str) -> Result<(), StoreError>;

    async fn update_run(&self, run: SandboxRun) -> Result<(), StoreError>;
    async fn get_run(&self, id: &str) -> Result<SandboxRun, StoreError>;
    async fn list_runs(&self) -> Result<Vec<SandboxRun>, StoreError>;
}

struct NodeEntry {
    status: NodeStatus,
    draining: bool,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryRegistry {
    heartbeat_period: Duration,
    nodes: Mutex<HashMap<NodeId, NodeEntry>>,
    runs: Mutex<HashMap<SandboxId, SandboxRun>>,
}

impl InMemoryRegistry {
    pub fn new(heartbeat_period: Duration) -> Self {
        Self {
            heartbeat_period,
            nodes: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Lock-free-of-async peek used by polling assertions in tests.
    pub fn peek_run(&self, id: &str) -> Option<SandboxRun> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Seed a node entry directly (tests and static fleets).
    pub fn put_node(&self, status: NodeStatus) {
        let expires_at = status.last_heartbeat
            + chrono::Duration::from_std(self.heartbeat_period * 3).unwrap_or_default();
        let _ = self
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                status.info.id.clone(),
                NodeEntry {
                    status,
                    draining: false,
                    expires_at,
                },
            );
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn list_nodes(&self) -> Result<Vec<NodeStatus>, StoreError> {
        let now = Utc::now();
        Ok(self
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| !entry.draining && entry.expires_at > now)
            .map(|entry| entry.status.clone())
            .collect())
    }

    async fn get_node(&self, id: &str) -> Result<NodeStatus, StoreError> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.status.clone())
            .ok_or_else(|| StoreError::NotFound(format!("node:{id}")))
    }

    async fn update_heartbeat(&self, hb: Heartbeat) -> Result<(), StoreError> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let expires_at = hb.time
            + chrono::Duration::from_std(self.heartbeat_period * 3).unwrap_or_default();
        let draining = nodes
            .get(&hb.node.id)
            .map(|entry| entry.draining)
            .unwrap_or(false);
        let _ = nodes.insert(
            hb.node.id.clone(),
            NodeEntry {
                status: NodeStatus {
                    info: hb.node,
                    allocated: hb.load,
                    last_heartbeat: hb.time,
                    active_runs: hb.active_runs,
                },
                draining,
                expires_at,
            },
        );
        Ok(())
    }

    async fn mark_draining(&self, node_id: &str) -> Result<(), StoreError> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        match nodes.get_mut(node_id) {
            Some(entry) => {
                entry.draining = true;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("node:{node_id}"))),
        }
    }

    async fn update_run(&self, run: SandboxRun) -> Result<(), StoreError> {
        let _ = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<SandboxRun, StoreError> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run:{id}")))
    }

    async fn list_runs(&self) -> Result<Vec<SandboxRun>, StoreError> {
        Ok(self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }
}

// ── Policy store ────────────────────────────────────────────────────

/// Per-template sandbox policies with optimistic concurrency: an upsert
/// must carry the stored version (0 when absent) and the store bumps it.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Returns the default lockdown policy when the template has none.
    async fn get_policy(&self, template_id: &str) -> Result<SandboxPolicy, StoreError>;
    async fn upsert_policy(&self, policy: SandboxPolicy) -> Result<SandboxPolicy, StoreError>;
}

pub struct InMemoryPolicyStore {
    policies: Mutex<HashMap<TemplateId, SandboxPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self {
            policies: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_policy(&self, template_id: &str) -> Result<SandboxPolicy, StoreError> {
        Ok(self
            .policies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(template_id)
            .cloned()
            .unwrap_or_else(|| SandboxPolicy::default_lockdown(template_id)))
    }

    async fn upsert_policy(
        &self,
        mut policy: SandboxPolicy,
    ) -> Result<SandboxPolicy, StoreError> {
        let mut policies = self.policies.lock().unwrap_or_else(|e| e.into_inner());
        let current = policies
            .get(&policy.template_id)
            .map(|p| p.version)
            .unwrap_or(0);
        if policy.version != current {
            return Err(StoreError::VersionConflict {
                expected: current,
                got: policy.version,
            });
        }
        policy.version += 1;
        let _ = policies.insert(policy.template_id.clone(), policy.clone());
        Ok(policy)
    }
}

// ── Template catalogue ──────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub display_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn get_template(&self, id: &str) -> Result<Template, StoreError>;
    async fn list_templates(&self) -> Result<Vec<Template>, StoreError>;
    async fn register_template(&self, template: Template) -> Result<(), StoreError>;
}

pub struct InMemoryTemplateCatalog {
    templates: Mutex<BTreeMap<TemplateId, Template>>,
}

impl InMemoryTemplateCatalog {
    pub fn new() -> Self {
        Self {
            templates: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl TemplateCatalog for InMemoryTemplateCatalog {
    async fn get_template(&self, id: &str) -> Result<Template, StoreError> {
        self.templates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("template:{id}")))
    }

    async fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        Ok(self
            .templates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn register_template(&self, template: Template) -> Result<(), StoreError> {
        let _ = self
            .templates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template.id.clone(), template);
        Ok(())
    }
}

// ── Snapshot store ──────────────────────────────────────────────────

/// Resolves a template to its immutable base image set.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn resolve(&self, template: &str) -> Result<SnapshotRef, StoreError>;
}

pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<TemplateId, SnapshotRef>>,
    fail_next: AtomicBool,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn register(&self, template: &str, snapshot: SnapshotRef) {
        let _ = self
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template.to_string(), snapshot);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn resolve(&self, template: &str) -> Result<SnapshotRef, StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Internal("snapshot store unavailable".into()));
        }
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(template)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("snapshot for template:{template}")))
    }
}

// ── Overlay pool ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    pub id: String,
    pub path: PathBuf,
}

/// Per-run writable filesystems layered over a read-only snapshot.
#[async_trait]
pub trait OverlayPool: Send + Sync {
    async fn create(&self, snapshot: &SnapshotRef) -> Result<Overlay, StoreError>;

    /// Idempotent; destroying an unknown overlay is a no-op.
    async fn destroy(&self, overlay_id: &str) -> Result<(), StoreError>;
}

pub struct InMemoryOverlayPool {
    base_dir: PathBuf,
    seq: AtomicU16,
    live: Mutex<HashMap<String, Overlay>>,
    destroyed: Mutex<Vec<String>>,
    fail_next: AtomicBool,
}

impl InMemoryOverlayPool {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            seq: AtomicU16::new(0),
            live: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn destroyed_ids(&self) -> Vec<String> {
        self.destroyed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl OverlayPool for InMemoryOverlayPool {
    async fn create(&self, snapshot: &SnapshotRef) -> Result<Overlay, StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Exhausted("overlay pool exhausted".into()));
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("ov-{}-{seq}", snapshot.id);
        let overlay = Overlay {
            id: id.clone(),
            path: self.base_dir.join(&id),
        };
        let _ = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, overlay.clone());
        Ok(overlay)
    }

    async fn destroy(&self, overlay_id: &str) -> Result<(), StoreError> {
        let removed = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(overlay_id);
        if removed.is_some() {
            self.destroyed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(overlay_id.to_string());
        }
        Ok(())
    }
}

// ── Network gateway ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapAttachment {
    pub tap: String,
    pub ip: String,
    pub gateway: String,
    pub cidr: String,
}

/// Host networking: tap devices, addressing, and the firewall's
/// per-tap counters.
#[async_trait]
pub trait NetworkGateway: Send + Sync {
    async fn attach(
        &self,
        sandbox_id: &str,
        network_ref: Option<&str>,
    ) -> Result<TapAttachment, StoreError>;

    /// Idempotent; detaching an unknown sandbox is a no-op.
    async fn detach(&self, sandbox_id: &str) -> Result<(), StoreError>;

    /// Interface byte counters as (host_rx, host_tx). Host-RX is VM
    /// egress; host-TX is VM ingress.
    async fn interface_counters(&self, tap: &str) -> Result<(u64, u64), StoreError>;

    /// Firewall drop counter for the tap.
    async fn drop_count(&self, tap: &str) -> Result<u64, StoreError>;
}

/// Allocates /30 pairs out of 172.16.0.0/16, one per sandbox.
pub struct InMemoryGateway {
    tap_prefix: String,
    seq: AtomicU16,
    attached: Mutex<HashMap<SandboxId, TapAttachment>>,
    detached: Mutex<Vec<SandboxId>>,
    counters: Mutex<HashMap<String, (u64, u64)>>,
    drops: Mutex<HashMap<String, u64>>,
    fail_next: AtomicBool,
}

impl InMemoryGateway {
    pub fn new(tap_prefix: &str) -> Self {
        Self {
            tap_prefix: tap_prefix.to_string(),
            seq: AtomicU16::new(0),
            attached: Mutex::new(HashMap::new()),
            detached: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            drops: Mutex::new(HashMap::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn detached_ids(&self) -> Vec<SandboxId> {
        self.detached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_counters(&self, tap: &str, rx: u64, tx: u64) {
        let _ = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tap.to_string(), (rx, tx));
    }

    pub fn set_drops(&self, tap: &str, drops: u64) {
        let _ = self
            .drops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tap.to_string(), drops);
    }
}

#[async_trait]
impl NetworkGateway for InMemoryGateway {
    async fn attach(
        &self,
        sandbox_id: &str,
        network_ref: Option<&str>,
    ) -> Result<TapAttachment, StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Exhausted("no free taps".into()));
        }
        let idx = self.seq.fetch_add(1, Ordering::SeqCst);
        // Four addresses per /30: network, gateway, guest, broadcast.
        let octet3 = (idx / 64) as u8;
        let base = ((idx % 64) * 4) as u8;
        let attachment = TapAttachment {
            tap: format!("{}{idx}", self.tap_prefix),
            ip: format!("172.16.{octet3}.{}", base + 2),
            gateway: format!("172.16.{octet3}.{}", base + 1),
            cidr: "/30".into(),
        };
        tracing::debug!(
            sandbox = %sandbox_id,
            tap = %attachment.tap,
            network = network_ref.unwrap_or("default"),
            "tap attached"
        );
        let _ = self
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sandbox_id.to_string(), attachment.clone());
        Ok(attachment)
    }

    async fn detach(&self, sandbox_id: &str) -> Result<(), StoreError> {
        let removed = self
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sandbox_id);
        if removed.is_some() {
            self.detached
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(sandbox_id.to_string());
        }
        Ok(())
    }

    async fn interface_counters(&self, tap: &str) -> Result<(u64, u64), StoreError> {
        Ok(self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tap)
            .copied()
            .unwrap_or((0, 0)))
    }

    async fn drop_count(&self, tap: &str) -> Result<u64, StoreError> {
        Ok(self
            .drops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tap)
            .copied()
            .unwrap_or(0))
    }
}
