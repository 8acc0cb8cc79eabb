//! Per-run policy enforcement.
//!
//! Arming a run spawns a watcher task that polls the runtime at a fixed
//! interval and kills the run on the first limit breach. The active map
//! holds only cancel handles; its mutex is taken just long enough to
//! insert or remove one. Watchers hold no locks while calling runtime
//! or gateway operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::domain::{PolicySnapshot, SandboxId};
use crate::external::NetworkGateway;
use crate::runtime::error::RuntimeError;
use crate::runtime::traits::SandboxRuntime;

/// Everything a watcher needs about one run.
#[derive(Debug, Clone)]
pub struct ArmSpec {
    pub run_id: SandboxId,
    pub tap: Option<String>,
    pub started_at: DateTime<Utc>,
    pub policy: PolicySnapshot,
}

pub struct Watchdog {
    runtime: Arc<dyn SandboxRuntime>,
    gateway: Arc<dyn NetworkGateway>,
    interval: Duration,
    active: Arc<Mutex<HashMap<SandboxId, JoinHandle<()>>>>,
}

impl Watchdog {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        gateway: Arc<dyn NetworkGateway>,
        interval: Duration,
    ) -> Self {
        Self {
            runtime,
            gateway,
            interval,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn armed_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Start enforcement for a run. Observation-only policies
    /// (`kill_on_breach == false`) are not watched.
    pub fn arm(&self, spec: ArmSpec) {
        if !spec.policy.kill_on_breach {
            return;
        }
        let id = spec.run_id.clone();
        let runtime = self.runtime.clone();
        let gateway = self.gateway.clone();
        let interval = self.interval;
        let active = self.active.clone();

        let handle = {
            let id = id.clone();
            tokio::spawn(async move {
                watch(runtime, gateway, interval, spec).await;
                let _ = active.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            })
        };

        let old = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    /// Stop enforcement. Idempotent.
    pub fn disarm(&self, id: &str) {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn watch(
    runtime: Arc<dyn SandboxRuntime>,
    gateway: Arc<dyn NetworkGateway>,
    interval: Duration,
    spec: ArmSpec,
) {
    let id = spec.run_id.as_str();
    let policy = &spec.policy;
    loop {
        tokio::time::sleep(interval).await;

        let run = match runtime.inspect(id).await {
            Ok(run) => run,
            Err(RuntimeError::NotFound(_)) => return,
            Err(e) => {
                tracing::debug!(sandbox = %id, error = %e, "watchdog inspect failed");
                continue;
            }
        };
        // Never kill a run that is already terminal.
        if run.is_terminal() {
            return;
        }

        let mut violation: Option<&'static str> = None;

        if !policy.max_runtime.is_zero() {
            let elapsed = Utc::now().signed_duration_since(spec.started_at);
            if elapsed
                > chrono::Duration::from_std(policy.max_runtime).unwrap_or(chrono::Duration::MAX)
            {
                violation = Some("runtime_exceeded");
            }
        }

        if violation.is_none() && policy.max_memory_mb > 0 && run.memory_mb > policy.max_memory_mb
        {
            violation = Some("memory_exceeded");
        }

        if violation.is_none() {
            if let Some(tap) = &spec.tap {
                // Host-RX is VM egress; host-TX is VM ingress.
                match gateway.interface_counters(tap).await {
                    Ok((rx, tx)) => {
                        if policy.max_egress_bytes > 0 && rx > policy.max_egress_bytes {
                            violation = Some("network_egress_exceeded");
                        } else if policy.max_ingress_bytes > 0 && tx > policy.max_ingress_bytes {
                            violation = Some("network_ingress_exceeded");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(sandbox = %id, tap = %tap, error = %e, "counter read failed");
                    }
                }

                if violation.is_none() && policy.max_banned_ip_attempts > 0 {
                    match gateway.drop_count(tap).await {
                        Ok(drops) if drops > policy.max_banned_ip_attempts => {
                            violation = Some("banned_ip_attempts_exceeded");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(sandbox = %id, tap = %tap, error = %e, "drop count read failed");
                        }
                    }
                }
            }
        }

        if let Some(reason) = violation {
            tracing::warn!(
                sandbox = %id,
                reason,
                memory_mb = run.memory_mb,
                max_memory_mb = policy.max_memory_mb,
                max_runtime_secs = policy.max_runtime.as_secs(),
                "policy violation, killing run"
            );
            metrics::counter!("tartarus_kill_total", "reason" => reason).increment(1);
            if let Err(e) = runtime.kill(id).await {
                tracing::error!(sandbox = %id, error = %e, "watchdog kill failed");
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RuntimeKind;
    use crate::external::InMemoryGateway;
    use crate::runtime::fake::FakeBackend;
    use crate::runtime::state::tests::{config as vm_config, request};

    const TICK: Duration = Duration::from_millis(10);

    fn watchdog(
        backend: Arc<FakeBackend>,
        gateway: Arc<InMemoryGateway>,
    ) -> Watchdog {
        Watchdog::new(backend, gateway, TICK)
    }

    fn policy(kill_on_breach: bool) -> PolicySnapshot {
        PolicySnapshot {
            kill_on_breach,
            ..Default::default()
        }
    }

    async fn settle() {
        // A handful of ticks is plenty for the watcher to act.
        tokio::time::sleep(TICK * 5).await;
    }

    #[tokio::test]
    async fn arm_is_noop_without_kill_on_breach() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        let wd = watchdog(backend, gateway);

        wd.arm(ArmSpec {
            run_id: "sb-1".into(),
            tap: None,
            started_at: Utc::now(),
            policy: policy(false),
        });
        assert_eq!(wd.armed_count(), 0);
    }

    #[tokio::test]
    async fn arm_disarm_leaves_run_untouched() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        let _ = backend.launch(request("sb-1", 100), vm_config()).await.unwrap();

        let wd = watchdog(backend.clone(), gateway);
        let mut p = policy(true);
        p.max_memory_mb = 1_000_000;
        wd.arm(ArmSpec {
            run_id: "sb-1".into(),
            tap: None,
            started_at: Utc::now(),
            policy: p,
        });
        wd.disarm("sb-1");
        // Disarm is idempotent.
        wd.disarm("sb-1");

        settle().await;
        assert!(backend.killed_ids().is_empty());
        assert!(backend.inspect("sb-1").await.is_ok());
        assert_eq!(wd.armed_count(), 0);
    }

    #[tokio::test]
    async fn memory_breach_kills_within_a_few_ticks() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        // Backend reports memory at 50% of the allocated 100 MB.
        backend.report_memory_percent(50);
        let _ = backend.launch(request("sb-mem", 100), vm_config()).await.unwrap();

        let wd = watchdog(backend.clone(), gateway);
        let mut p = policy(true);
        p.max_memory_mb = 40;
        wd.arm(ArmSpec {
            run_id: "sb-mem".into(),
            tap: None,
            started_at: Utc::now(),
            policy: p,
        });

        settle().await;
        assert_eq!(backend.killed_ids(), vec!["sb-mem".to_string()]);
        assert!(matches!(
            backend.inspect("sb-mem").await.unwrap_err(),
            RuntimeError::NotFound(_)
        ));
        assert_eq!(wd.armed_count(), 0);
    }

    #[tokio::test]
    async fn ttl_zero_never_trips_runtime_limit() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        let _ = backend.launch(request("sb-ttl", 100), vm_config()).await.unwrap();

        let wd = watchdog(backend.clone(), gateway);
        wd.arm(ArmSpec {
            run_id: "sb-ttl".into(),
            tap: None,
            // Started long ago; max_runtime stays zero.
            started_at: Utc::now() - chrono::Duration::hours(5),
            policy: policy(true),
        });

        settle().await;
        assert!(backend.killed_ids().is_empty());
        wd.disarm("sb-ttl");
    }

    #[tokio::test]
    async fn runtime_limit_breach_kills() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        let _ = backend.launch(request("sb-slow", 100), vm_config()).await.unwrap();

        let wd = watchdog(backend.clone(), gateway);
        let mut p = policy(true);
        p.max_runtime = Duration::from_secs(60);
        wd.arm(ArmSpec {
            run_id: "sb-slow".into(),
            tap: None,
            started_at: Utc::now() - chrono::Duration::seconds(120),
            policy: p,
        });

        settle().await;
        assert_eq!(backend.killed_ids(), vec!["sb-slow".to_string()]);
    }

    #[tokio::test]
    async fn egress_counter_maps_to_host_rx() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        let _ = backend.launch(request("sb-net", 100), vm_config()).await.unwrap();
        // Host saw 2000 bytes received from the VM (egress), 10 sent.
        gateway.set_counters("trt-tap0", 2000, 10);

        let wd = watchdog(backend.clone(), gateway);
        let mut p = policy(true);
        p.max_egress_bytes = 1000;
        p.max_ingress_bytes = 1_000_000;
        wd.arm(ArmSpec {
            run_id: "sb-net".into(),
            tap: Some("trt-tap0".into()),
            started_at: Utc::now(),
            policy: p,
        });

        settle().await;
        assert_eq!(backend.killed_ids(), vec!["sb-net".to_string()]);
    }

    #[tokio::test]
    async fn drop_count_crossing_threshold_kills_on_next_tick() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        let _ = backend.launch(request("sb-fw", 100), vm_config()).await.unwrap();
        gateway.set_drops("trt-tap0", 5);

        let wd = watchdog(backend.clone(), gateway.clone());
        let mut p = policy(true);
        p.max_banned_ip_attempts = 5;
        wd.arm(ArmSpec {
            run_id: "sb-fw".into(),
            tap: Some("trt-tap0".into()),
            started_at: Utc::now(),
            policy: p,
        });

        // At exactly the threshold nothing happens.
        settle().await;
        assert!(backend.killed_ids().is_empty());

        // One more drop crosses it.
        gateway.set_drops("trt-tap0", 6);
        settle().await;
        assert_eq!(backend.killed_ids(), vec!["sb-fw".to_string()]);
    }

    #[tokio::test]
    async fn terminal_run_is_never_killed() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        backend.report_memory_percent(100);
        let _ = backend.launch(request("sb-done", 100), vm_config()).await.unwrap();
        backend.complete("sb-done", 0);

        let wd = watchdog(backend.clone(), gateway);
        let mut p = policy(true);
        p.max_memory_mb = 1;
        wd.arm(ArmSpec {
            run_id: "sb-done".into(),
            tap: None,
            started_at: Utc::now(),
            policy: p,
        });

        settle().await;
        assert!(backend.killed_ids().is_empty());
        assert_eq!(wd.armed_count(), 0);
    }

    #[tokio::test]
    async fn watcher_self_disarms_when_run_vanishes() {
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let gateway = Arc::new(InMemoryGateway::new("trt-tap"));
        let wd = watchdog(backend.clone(), gateway);
        // Armed for a run the backend has never seen.
        wd.arm(ArmSpec {
            run_id: "sb-ghost".into(),
            tap: None,
            started_at: Utc::now(),
            policy: policy(true),
        });
        settle().await;
        assert_eq!(wd.armed_count(), 0);
        assert!(backend.killed_ids().is_empty());
    }
}
