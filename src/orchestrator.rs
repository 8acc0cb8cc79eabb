//! Fleet orchestrator.
//!
//! The seam the front-door surface calls: validate and place incoming
//! requests, fan cancels out over the control bus, and reconcile the
//! registry against what nodes actually report. Placement itself is the
//! scheduler's job; execution belongs to the node agents.

use std::sync::Arc;

use chrono::Utc;

use crate::control::{ControlBus, control_topic};
use crate::domain::{NodeId, RunStatus, SandboxRequest, SandboxRun};
use crate::external::{PolicyStore, Queue, QueueError, Registry, StoreError, TemplateCatalog};
use crate::scheduler::{ScheduleError, Scheduler};

#[derive(thiserror::Error, Debug)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("template: {0}")]
    Template(#[from] StoreError),

    #[error("schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),
}

pub struct Orchestrator {
    registry: Arc<dyn Registry>,
    policies: Arc<dyn PolicyStore>,
    templates: Arc<dyn TemplateCatalog>,
    queue: Arc<dyn Queue>,
    bus: Arc<dyn ControlBus>,
    scheduler: Scheduler,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<dyn Registry>,
        policies: Arc<dyn PolicyStore>,
        templates: Arc<dyn TemplateCatalog>,
        queue: Arc<dyn Queue>,
        bus: Arc<dyn ControlBus>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            registry,
            policies,
            templates,
            queue,
            bus,
            scheduler,
        }
    }

    /// Validate, place, and enqueue one request. Returns the chosen
    /// node. Unplaceable requests stay PENDING in the registry.
    pub async fn submit(&self, mut req: SandboxRequest) -> Result<NodeId, SubmitError> {
        if req.id.is_empty() {
            req.id = format!("sb-{}", uuid::Uuid::new_v4());
        }
        if req.command.is_empty() {
            return Err(SubmitError::InvalidRequest("empty command".into()));
        }
        let _ = self.templates.get_template(&req.template).await?;

        // Fill unset knobs from the template's policy.
        let policy = self
            .policies
            .get_policy(&req.template)
            .await
            .unwrap_or_else(|_| crate::domain::SandboxPolicy::default_lockdown(&req.template));
        if req.resources.mem_mb == 0 {
            req.resources = policy.resources.clone();
        }
        if req.network.is_none() {
            req.network = Some(policy.network.clone());
        }

        let mut run = pending_run(&req);
        let nodes = self.registry.list_nodes().await.unwrap_or_default();
        let node_id = match self.scheduler.choose_node(&req, &nodes, Utc::now()) {
            Ok(node_id) => node_id,
            Err(e) => {
                // Leave a PENDING record behind for the operator.
                let _ = self.registry.update_run(run).await;
                return Err(e.into());
            }
        };

        req.node_id = Some(node_id.clone());
        run.node_id = Some(node_id.clone());
        run.status = RunStatus::Scheduled;
        run.updated_at = Utc::now();
        let _ = self.registry.update_run(run).await;

        self.queue.enqueue(req.clone()).await?;
        tracing::info!(sandbox = %req.id, node = %node_id, "request scheduled");
        metrics::counter!("tartarus_jobs_scheduled_total").increment(1);
        Ok(node_id)
    }

    /// Cancel a run: not-yet-launched runs flip to CANCELED; launched
    /// ones get a KILL on their node's control topic.
    pub async fn cancel(&self, sandbox_id: &str) -> Result<(), StoreError> {
        let mut run = self.registry.get_run(sandbox_id).await?;
        if run.is_terminal() {
            return Ok(());
        }

        if matches!(run.status, RunStatus::Pending | RunStatus::Scheduled) {
            run.status = RunStatus::Canceled;
            run.finished_at = Some(Utc::now());
            run.updated_at = Utc::now();
            self.registry.update_run(run).await?;
            return Ok(());
        }

        let node_id = run
            .node_id
            .clone()
            .ok_or_else(|| StoreError::Internal(format!("run {sandbox_id} has no node")))?;
        self.bus
            .publish(
                &control_topic(&node_id),
                format!("KILL {sandbox_id}").into_bytes(),
            )
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        tracing::info!(sandbox = %sandbox_id, node = %node_id, "kill dispatched");
        Ok(())
    }

    /// Compare each node's reported run list against the registry and
    /// close out runs the node no longer knows about.
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        let nodes = self.registry.list_nodes().await?;
        let runs = self.registry.list_runs().await?;
        let mut closed = 0;

        for node in &nodes {
            for run in &runs {
                if run.node_id.as_deref() != Some(node.info.id.as_str()) {
                    continue;
                }
                if run.status == RunStatus::Running && !node.active_runs.contains(&run.id) {
                    let mut lost = run.clone();
                    lost.status = RunStatus::Canceled;
                    lost.error = Some("not reported by node".into());
                    lost.finished_at = Some(Utc::now());
                    lost.updated_at = Utc::now();
                    tracing::warn!(sandbox = %run.id, node = %node.info.id, "closing lost run");
                    self.registry.update_run(lost).await?;
                    closed += 1;
                }
            }
        }
        Ok(closed)
    }
}

fn pending_run(req: &SandboxRequest) -> SandboxRun {
    SandboxRun {
        id: req.id.clone(),
        request_id: req.id.clone(),
        node_id: None,
        template: req.template.clone(),
        status: RunStatus::Pending,
        exit_code: None,
        error: None,
        runtime: None,
        started_at: None,
        finished_at: None,
        created_at: req.created_at,
        updated_at: Utc::now(),
        memory_mb: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::InMemoryControlBus;
    use crate::domain::{
        Capacity, NodeInfo, NodeStatus, ResourceSpec, default_heat_classes,
    };
    use crate::external::{
        InMemoryPolicyStore, InMemoryQueue, InMemoryRegistry, Template,
        InMemoryTemplateCatalog,
    };
    use crate::scheduler::Strategy;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        orchestrator: Orchestrator,
        registry: Arc<InMemoryRegistry>,
        queue: Arc<InMemoryQueue>,
        bus: Arc<InMemoryControlBus>,
    }

    async fn fixture(nodes: Vec<NodeStatus>) -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(5)));
        for node in nodes {
            registry.put_node(node);
        }
        let policies = Arc::new(InMemoryPolicyStore::new());
        let templates = Arc::new(InMemoryTemplateCatalog::new());
        templates
            .register_template(Template {
                id: "py312".into(),
                display_name: "Python 3.12".into(),
                tags: vec![],
            })
            .await
            .unwrap();
        let queue = Arc::new(InMemoryQueue::new());
        let bus = Arc::new(InMemoryControlBus::new());
        let orchestrator = Orchestrator::new(
            registry.clone(),
            policies,
            templates,
            queue.clone(),
            bus.clone(),
            Scheduler::new(Strategy::LeastLoaded, default_heat_classes()),
        );
        Fixture {
            orchestrator,
            registry,
            queue,
            bus,
        }
    }

    fn node(id: &str, free_mem: u64) -> NodeStatus {
        NodeStatus {
            info: NodeInfo {
                id: id.into(),
                address: format!("{id}:7000"),
                labels: BTreeMap::new(),
                capacity: Capacity {
                    cpu_milli: 8000,
                    mem_mb: 8192,
                    gpu: 0,
                },
            },
            allocated: Capacity {
                cpu_milli: 0,
                mem_mb: 8192 - free_mem,
                gpu: 0,
            },
            last_heartbeat: Utc::now(),
            active_runs: vec![],
        }
    }

    fn request(id: &str, mem_mb: u32) -> SandboxRequest {
        SandboxRequest {
            id: id.into(),
            template: "py312".into(),
            node_id: None,
            heat_level: None,
            command: vec!["python".into()],
            args: vec![],
            env: BTreeMap::new(),
            resources: ResourceSpec {
                cpu_milli: 500,
                mem_mb,
                ttl: Duration::ZERO,
                ..Default::default()
            },
            network: None,
            retention: Default::default(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn submit_schedules_persists_and_enqueues() {
        let f = fixture(vec![node("node-a", 4096)]).await;
        let chosen = f.orchestrator.submit(request("sb-1", 512)).await.unwrap();
        assert_eq!(chosen, "node-a");

        let run = f.registry.peek_run("sb-1").unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);
        assert_eq!(run.node_id.as_deref(), Some("node-a"));

        let (queued, _) = f.queue.dequeue().await.unwrap();
        assert_eq!(queued.node_id.as_deref(), Some("node-a"));
        // Policy filled the unset network reference.
        assert_eq!(queued.network.as_deref(), Some("no-internet"));
    }

    #[tokio::test]
    async fn zero_memory_request_inherits_policy_resources() {
        let f = fixture(vec![node("node-a", 4096)]).await;
        let _ = f.orchestrator.submit(request("sb-1", 0)).await.unwrap();
        let (queued, _) = f.queue.dequeue().await.unwrap();
        // Lockdown defaults.
        assert_eq!(queued.resources.mem_mb, 128);
        assert_eq!(queued.resources.cpu_milli, 1000);
    }

    #[tokio::test]
    async fn unknown_template_is_rejected_before_scheduling() {
        let f = fixture(vec![node("node-a", 4096)]).await;
        let mut req = request("sb-1", 512);
        req.template = "ghost".into();
        let err = f.orchestrator.submit(req).await.unwrap_err();
        assert!(matches!(err, SubmitError::Template(StoreError::NotFound(_))));
        assert_eq!(f.queue.len().await, 0);
        assert!(f.registry.peek_run("sb-1").is_none());
    }

    #[tokio::test]
    async fn unschedulable_request_stays_pending() {
        let f = fixture(vec![node("node-a", 64)]).await;
        let err = f.orchestrator.submit(request("sb-1", 512)).await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Schedule(ScheduleError::NoCapacity)
        ));
        let run = f.registry.peek_run("sb-1").unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(f.queue.len().await, 0);
    }

    #[tokio::test]
    async fn cancel_flips_scheduled_run_to_canceled() {
        let f = fixture(vec![node("node-a", 4096)]).await;
        let _ = f.orchestrator.submit(request("sb-1", 512)).await.unwrap();

        f.orchestrator.cancel("sb-1").await.unwrap();
        let run = f.registry.peek_run("sb-1").unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
        assert!(run.exit_code.is_none());
    }

    #[tokio::test]
    async fn cancel_of_running_run_publishes_kill() {
        let f = fixture(vec![node("node-a", 4096)]).await;
        let _ = f.orchestrator.submit(request("sb-1", 512)).await.unwrap();

        let mut run = f.registry.peek_run("sb-1").unwrap();
        run.status = RunStatus::Running;
        f.registry.update_run(run).await.unwrap();

        let mut rx = f.bus.subscribe(&control_topic("node-a")).await.unwrap();
        f.orchestrator.cancel("sb-1").await.unwrap();
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, b"KILL sb-1");
    }

    #[tokio::test]
    async fn reconcile_closes_runs_the_node_dropped() {
        let mut reporting = node("node-a", 4096);
        reporting.active_runs = vec!["sb-live".into()];
        let f = fixture(vec![reporting]).await;

        for (id, status) in [("sb-live", RunStatus::Running), ("sb-lost", RunStatus::Running)] {
            let mut run = pending_run(&request(id, 128));
            run.status = status;
            run.node_id = Some("node-a".into());
            f.registry.update_run(run).await.unwrap();
        }

        let closed = f.orchestrator.reconcile().await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(
            f.registry.peek_run("sb-lost").unwrap().status,
            RunStatus::Canceled
        );
        assert_eq!(
            f.registry.peek_run("sb-live").unwrap().status,
            RunStatus::Running
        );
    }
}
