//! Node agent.
//!
//! One agent runs per node. It drains the queue, acquires snapshot,
//! overlay, and tap in that order, launches through the unified
//! runtime, arms the watchdog, and spawns a completion task per run
//! that releases everything in strict reverse order and acks the
//! delivery. A control loop services out-of-band commands in parallel,
//! and a reconcile sweep reclaims host leftovers on start-up.

pub mod control;
pub mod hypnos;
pub mod reconcile;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::control::ControlBus;
use crate::deadletter::{self, DeadLetterRecord, DeadLetterSink};
use crate::domain::{
    IpAssignment, NodeInfo, PolicySnapshot, RunStatus, SandboxRequest, SandboxRun, VmConfig,
};
use crate::external::{
    Heartbeat, NetworkGateway, OverlayPool, Queue, Receipt, Registry, SnapshotStore,
};
use crate::runtime::error::RuntimeError;
use crate::runtime::traits::SandboxRuntime;
use crate::watchdog::{ArmSpec, Watchdog};

use self::hypnos::Hypnos;
use self::reconcile::ReconcileConfig;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    pub heartbeat_period: Duration,
    /// Backoff after a dequeue error.
    pub dequeue_backoff: Duration,
    /// Where SNAPSHOT control commands write their images.
    pub snapshot_out_dir: PathBuf,
    /// Grace applied to TERMINATE without an explicit one.
    pub terminate_grace: Duration,
    pub reconcile: ReconcileConfig,
}

impl AgentConfig {
    pub fn new(node_id: &str, snapshot_out_dir: PathBuf, reconcile: ReconcileConfig) -> Self {
        Self {
            node_id: node_id.to_string(),
            heartbeat_period: Duration::from_secs(3),
            dequeue_backoff: Duration::from_secs(1),
            snapshot_out_dir,
            terminate_grace: Duration::from_secs(5),
            reconcile,
        }
    }
}

pub struct NodeAgent {
    pub(crate) config: AgentConfig,
    pub(crate) node_info: NodeInfo,
    pub(crate) runtime: Arc<dyn SandboxRuntime>,
    pub(crate) queue: Arc<dyn Queue>,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) overlays: Arc<dyn OverlayPool>,
    pub(crate) gateway: Arc<dyn NetworkGateway>,
    pub(crate) bus: Arc<dyn ControlBus>,
    pub(crate) deadletter: Arc<dyn DeadLetterSink>,
    pub(crate) watchdog: Watchdog,
    pub(crate) hypnos: Option<Hypnos>,
}

impl NodeAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        node_info: NodeInfo,
        runtime: Arc<dyn SandboxRuntime>,
        queue: Arc<dyn Queue>,
        registry: Arc<dyn Registry>,
        snapshots: Arc<dyn SnapshotStore>,
        overlays: Arc<dyn OverlayPool>,
        gateway: Arc<dyn NetworkGateway>,
        bus: Arc<dyn ControlBus>,
        deadletter: Arc<dyn DeadLetterSink>,
        watchdog: Watchdog,
        hypnos: Option<Hypnos>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            node_info,
            runtime,
            queue,
            registry,
            snapshots,
            overlays,
            gateway,
            bus,
            deadletter,
            watchdog,
            hypnos,
        })
    }

    /// Run until the shutdown signal flips. The in-flight iteration
    /// commits before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let _ = reconcile::reconcile_host(&self.config.reconcile).await;

        let control_handle = tokio::spawn(control::run_control_loop(
            self.clone(),
            shutdown.clone(),
        ));
        let heartbeat_handle = tokio::spawn(heartbeat_loop(self.clone(), shutdown.clone()));

        tracing::info!(node = %self.config.node_id, "agent main loop started");
        loop {
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                delivery = self.queue.dequeue() => delivery,
            };
            match delivery {
                Ok((req, receipt)) => self.process(req, receipt).await,
                Err(e) => {
                    tracing::error!(error = %e, "dequeue failed");
                    tokio::time::sleep(self.config.dequeue_backoff).await;
                }
            }
        }

        tracing::info!(node = %self.config.node_id, "agent main loop stopped");
        control_handle.abort();
        heartbeat_handle.abort();
    }

    /// One main-loop iteration: acquire in order, launch, arm, hand off
    /// to the completion task. Failures release in reverse order and
    /// nack the delivery.
    async fn process(self: &Arc<Self>, req: SandboxRequest, receipt: Receipt) {
        let id = req.id.clone();

        // Acquire 1/3: snapshot.
        let snapshot = match self.snapshots.resolve(&req.template).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(sandbox = %id, error = %e, "snapshot resolve failed");
                metrics::counter!("tartarus_jobs_failed_total", "reason" => "snapshot_fetch_failed")
                    .increment(1);
                let _ = self.queue.nack(&receipt, "snapshot").await;
                return;
            }
        };

        // Acquire 2/3: overlay.
        let overlay = match self.overlays.create(&snapshot).await {
            Ok(overlay) => overlay,
            Err(e) => {
                tracing::warn!(sandbox = %id, error = %e, "overlay creation failed");
                metrics::counter!("tartarus_jobs_failed_total", "reason" => "overlay_creation_failed")
                    .increment(1);
                let _ = self.queue.nack(&receipt, "overlay").await;
                return;
            }
        };

        // Acquire 3/3: network.
        let net = match self.gateway.attach(&id, req.network.as_deref()).await {
            Ok(net) => net,
            Err(e) => {
                tracing::warn!(sandbox = %id, error = %e, "network attach failed");
                metrics::counter!("tartarus_jobs_failed_total", "reason" => "network_attach_failed")
                    .increment(1);
                let _ = self.overlays.destroy(&overlay.id).await;
                let _ = self.queue.nack(&receipt, "network").await;
                return;
            }
        };

        let cfg = VmConfig {
            snapshot,
            overlay_path: overlay.path.clone(),
            tap_device: Some(net.tap.clone()),
            ip: Some(IpAssignment {
                ip: net.ip,
                gateway: net.gateway,
                cidr: net.cidr,
            }),
            vcpu: vcpus_for(req.resources.cpu_milli),
            memory_mb: req.resources.mem_mb,
        };

        let run = match self.runtime.launch(req.clone(), cfg).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(sandbox = %id, error = %e, "launch failed");
                // Release in reverse order, then dead-letter off-path.
                let _ = self.gateway.detach(&id).await;
                let _ = self.overlays.destroy(&overlay.id).await;

                let reason = match &e {
                    RuntimeError::LaunchFailed(message) => message.clone(),
                    other => other.to_string(),
                };
                let payload = serde_json::to_vec(&req).unwrap_or_default();
                deadletter::write_detached(
                    self.deadletter.clone(),
                    DeadLetterRecord::new(&id, &req.id, &reason, &payload),
                );

                metrics::counter!("tartarus_jobs_failed_total", "reason" => "launch_failed")
                    .increment(1);
                let _ = self.queue.nack(&receipt, "launch").await;
                return;
            }
        };

        if let Err(e) = self.registry.update_run(run.clone()).await {
            tracing::error!(sandbox = %id, error = %e, "run persist failed");
        }

        self.watchdog.arm(ArmSpec {
            run_id: id.clone(),
            tap: Some(net.tap.clone()),
            started_at: run.started_at.unwrap_or_else(Utc::now),
            policy: PolicySnapshot {
                max_runtime: req.resources.ttl,
                kill_on_breach: true,
                ..Default::default()
            },
        });

        metrics::counter!("tartarus_jobs_launched_total").increment(1);
        if req.created_at.timestamp() > 0 {
            let latency = Utc::now()
                .signed_duration_since(req.created_at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            metrics::histogram!("tartarus_launch_latency_seconds").record(latency);
        }

        tracing::info!(sandbox = %id, tap = %net.tap, "sandbox launched");

        let agent = self.clone();
        let overlay_id = overlay.id;
        let _ = tokio::spawn(async move {
            agent.completion(run, overlay_id, receipt).await;
        });
    }

    /// Waits the run out, then tears down in reverse acquisition order.
    /// Sole owner of the delivery ack.
    async fn completion(self: &Arc<Self>, running: SandboxRun, overlay_id: String, receipt: Receipt) {
        let id = running.id.clone();

        let _ = self.runtime.wait(&id).await;
        self.watchdog.disarm(&id);

        let final_run = match self.runtime.inspect(&id).await {
            Ok(run) => run,
            Err(e) => {
                // Killed runs are released by the backend before we get
                // here; persist a terminal record regardless.
                tracing::debug!(sandbox = %id, error = %e, "post-wait inspect failed");
                let mut run = running;
                run.status = RunStatus::Failed;
                run.exit_code = run.exit_code.or(Some(137));
                run.error = Some(e.to_string());
                run.finished_at = Some(Utc::now());
                run.updated_at = Utc::now();
                run
            }
        };
        if let Err(e) = self.registry.update_run(final_run.clone()).await {
            tracing::error!(sandbox = %id, error = %e, "terminal run persist failed");
        }

        // Release in reverse order: network, then overlay.
        let _ = self.gateway.detach(&id).await;
        let _ = self.overlays.destroy(&overlay_id).await;
        let _ = self.queue.ack(&receipt).await;

        tracing::info!(
            sandbox = %id,
            status = ?final_run.status,
            exit_code = ?final_run.exit_code,
            "sandbox finished"
        );
    }
}

fn vcpus_for(cpu_milli: u32) -> u32 {
    cpu_milli.div_ceil(1000).max(1)
}

async fn heartbeat_loop(agent: Arc<NodeAgent>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(agent.config.heartbeat_period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        let load = agent.runtime.allocation().await;
        let active_runs = match agent.runtime.list().await {
            Ok(runs) => runs
                .into_iter()
                .filter(|r| !r.is_terminal())
                .map(|r| r.id)
                .collect(),
            Err(_) => Vec::new(),
        };
        if let Err(e) = agent
            .registry
            .update_heartbeat(Heartbeat {
                node: agent.node_info.clone(),
                load,
                active_runs,
                time: Utc::now(),
            })
            .await
        {
            tracing::warn!(error = %e, "heartbeat publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::InMemoryControlBus;
    use crate::deadletter::InMemoryDeadLetterSink;
    use crate::domain::{Capacity, ResourceSpec, RuntimeKind, SnapshotRef};
    use crate::external::{
        InMemoryGateway, InMemoryOverlayPool, InMemoryQueue, InMemoryRegistry,
        InMemorySnapshotStore,
    };
    use crate::runtime::fake::FakeBackend;
    use std::collections::BTreeMap;

    pub(crate) struct Harness {
        pub agent: Arc<NodeAgent>,
        pub backend: Arc<FakeBackend>,
        pub queue: Arc<InMemoryQueue>,
        pub registry: Arc<InMemoryRegistry>,
        pub snapshots: Arc<InMemorySnapshotStore>,
        pub overlays: Arc<InMemoryOverlayPool>,
        pub gateway: Arc<InMemoryGateway>,
        pub bus: Arc<InMemoryControlBus>,
        pub deadletter: Arc<InMemoryDeadLetterSink>,
        pub shutdown: watch::Sender<bool>,
    }

    impl Harness {
        pub fn start(tmp: &std::path::Path) -> Self {
            let backend = FakeBackend::new(RuntimeKind::Microvm);
            let queue = Arc::new(InMemoryQueue::new());
            let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(3)));
            let snapshots = Arc::new(InMemorySnapshotStore::new());
            let overlays = Arc::new(InMemoryOverlayPool::new(tmp.join("overlays")));
            let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
            let bus = Arc::new(InMemoryControlBus::new());
            let deadletter = InMemoryDeadLetterSink::new();

            snapshots.register(
                "py312",
                SnapshotRef {
                    id: "snap-py312".into(),
                    disk_image: tmp.join("snap/disk.img"),
                    mem_file: None,
                    kernel_image: Some(tmp.join("snap/vmlinux")),
                },
            );

            let watchdog = Watchdog::new(
                backend.clone(),
                gateway.clone(),
                Duration::from_millis(10),
            );
            let config = AgentConfig::new(
                "node-a",
                tmp.join("snapshots-out"),
                ReconcileConfig {
                    tap_prefix: "trt-tap".into(),
                    vmm_bin_name: "vmm-test-none".into(),
                    deployment_marker: "tartarus-test-none".into(),
                },
            );
            let node_info = NodeInfo {
                id: "node-a".into(),
                address: "node-a:7000".into(),
                labels: BTreeMap::new(),
                capacity: Capacity {
                    cpu_milli: 8000,
                    mem_mb: 8192,
                    gpu: 0,
                },
            };
            let hypnos = Hypnos::new(tmp.join("hypnos")).unwrap();
            let agent = NodeAgent::new(
                config,
                node_info,
                backend.clone(),
                queue.clone(),
                registry.clone(),
                snapshots.clone(),
                overlays.clone(),
                gateway.clone(),
                bus.clone(),
                deadletter.clone(),
                watchdog,
                Some(hypnos),
            );

            let (shutdown, shutdown_rx) = watch::channel(false);
            let _ = tokio::spawn(agent.clone().run(shutdown_rx));

            Self {
                agent,
                backend,
                queue,
                registry,
                snapshots,
                overlays,
                gateway,
                bus,
                deadletter,
                shutdown,
            }
        }

        pub fn request(&self, id: &str) -> SandboxRequest {
            SandboxRequest {
                id: id.into(),
                template: "py312".into(),
                node_id: Some("node-a".into()),
                heat_level: None,
                command: vec!["python".into(), "main.py".into()],
                args: vec![],
                env: BTreeMap::new(),
                resources: ResourceSpec {
                    cpu_milli: 500,
                    mem_mb: 256,
                    ttl: Duration::ZERO,
                    ..Default::default()
                },
                network: None,
                retention: Default::default(),
                metadata: BTreeMap::new(),
                created_at: Utc::now(),
            }
        }

        pub async fn eventually<F: Fn() -> bool>(&self, what: &str, check: F) {
            for _ in 0..200 {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("condition never held: {what}");
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = self.shutdown.send(true);
        }
    }

    #[tokio::test]
    async fn happy_path_acquires_launches_and_releases_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let h = Harness::start(tmp.path());

        h.queue.enqueue(h.request("sb-1")).await.unwrap();
        h.eventually("run launched", || {
            h.overlays.live_count() == 1 && h.gateway.attached_count() == 1
        })
        .await;

        // Registry has the RUNNING run.
        h.eventually("running persisted", || {
            h.registry
                .peek_run("sb-1")
                .map(|r| r.status == RunStatus::Running)
                .unwrap_or(false)
        })
        .await;

        // Workload exits cleanly; completion releases in reverse order.
        h.backend.complete("sb-1", 0);
        h.eventually("terminal persisted", || {
            h.registry
                .peek_run("sb-1")
                .map(|r| r.status == RunStatus::Succeeded && r.exit_code == Some(0))
                .unwrap_or(false)
        })
        .await;
        h.eventually("overlay destroyed", || h.overlays.live_count() == 0).await;
        h.eventually("tap detached", || h.gateway.detached_ids() == vec!["sb-1".to_string()])
            .await;
        h.eventually("delivery acked", || h.queue.in_flight_len() == 0).await;
    }

    #[tokio::test]
    async fn launch_failure_triggers_reverse_cleanup_and_dead_letter() {
        let tmp = tempfile::tempdir().unwrap();
        let h = Harness::start(tmp.path());
        h.backend.fail_next_launches("launch failed");

        h.queue.enqueue(h.request("req-fail")).await.unwrap();

        h.eventually("dead letter written", || h.deadletter.records().len() >= 1)
            .await;
        let record = &h.deadletter.records()[0];
        assert_eq!(record.request_id, "req-fail");
        assert_eq!(record.reason, "launch failed");
        // The payload is the full request, re-submittable.
        let payload: SandboxRequest =
            serde_json::from_slice(&record.payload_bytes().unwrap()).unwrap();
        assert_eq!(payload.id, "req-fail");

        h.eventually("overlay destroyed", || h.overlays.live_count() == 0).await;
        h.eventually("tap detached", || {
            h.gateway.detached_ids().contains(&"req-fail".to_string())
        })
        .await;
    }

    #[tokio::test]
    async fn transient_snapshot_failure_is_redelivered() {
        let tmp = tempfile::tempdir().unwrap();
        let h = Harness::start(tmp.path());
        h.snapshots.fail_next();

        h.queue.enqueue(h.request("sb-retry")).await.unwrap();

        // The nacked delivery comes back and the second attempt works.
        h.eventually("second attempt launched", || {
            h.registry
                .peek_run("sb-retry")
                .map(|r| r.status == RunStatus::Running)
                .unwrap_or(false)
        })
        .await;
        h.backend.complete("sb-retry", 0);
        h.eventually("acked", || h.queue.in_flight_len() == 0).await;
    }

    #[tokio::test]
    async fn network_failure_destroys_the_overlay() {
        let tmp = tempfile::tempdir().unwrap();
        let h = Harness::start(tmp.path());
        h.gateway.fail_next();

        h.queue.enqueue(h.request("sb-net")).await.unwrap();

        // First overlay was destroyed during the failed attempt; the
        // retry eventually runs.
        h.eventually("first overlay destroyed", || {
            !h.overlays.destroyed_ids().is_empty()
        })
        .await;
        h.eventually("retry launched", || {
            h.registry
                .peek_run("sb-net")
                .map(|r| r.status == RunStatus::Running)
                .unwrap_or(false)
        })
        .await;
        h.backend.complete("sb-net", 0);
        h.eventually("acked", || h.queue.in_flight_len() == 0).await;
    }

    #[tokio::test]
    async fn ttl_breach_is_killed_and_still_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let h = Harness::start(tmp.path());

        let mut req = h.request("sb-ttl");
        req.resources.ttl = Duration::from_millis(30);
        h.queue.enqueue(req).await.unwrap();

        // Watchdog kills on runtime_exceeded; the completion task still
        // persists a terminal run and releases everything.
        h.eventually("killed", || {
            h.backend.killed_ids().contains(&"sb-ttl".to_string())
        })
        .await;
        h.eventually("terminal persisted", || {
            h.registry
                .peek_run("sb-ttl")
                .map(|r| r.status == RunStatus::Failed && r.exit_code.is_some())
                .unwrap_or(false)
        })
        .await;
        h.eventually("overlay destroyed", || h.overlays.live_count() == 0).await;
        h.eventually("tap detached", || {
            h.gateway.detached_ids().contains(&"sb-ttl".to_string())
        })
        .await;
        h.eventually("acked", || h.queue.in_flight_len() == 0).await;
    }

    #[test]
    fn vcpu_derivation_rounds_up() {
        assert_eq!(vcpus_for(0), 1);
        assert_eq!(vcpus_for(500), 1);
        assert_eq!(vcpus_for(1000), 1);
        assert_eq!(vcpus_for(1001), 2);
        assert_eq!(vcpus_for(4000), 4);
    }
}
