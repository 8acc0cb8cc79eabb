//! Hibernate/wake capability.
//!
//! Hibernating a sandbox snapshots it, shuts it down, and retains a
//! sleeping record holding the snapshot paths plus the original launch
//! inputs. Waking relaunches from the retained snapshot and verifies
//! the run with an inspect. The agent consumes this as a one-way
//! handle; the runtime never references back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::domain::{SandboxId, SandboxRequest, SandboxRun, SnapshotRef, VmConfig};
use crate::runtime::error::RuntimeError;
use crate::runtime::traits::SandboxRuntime;

#[derive(Debug, Clone)]
pub struct SleepingSandbox {
    pub request: SandboxRequest,
    pub cfg: VmConfig,
    pub mem_path: PathBuf,
    pub disk_path: PathBuf,
    pub slept_at: DateTime<Utc>,
}

pub struct Hypnos {
    snapshot_dir: PathBuf,
    sleeping: Mutex<HashMap<SandboxId, SleepingSandbox>>,
}

impl Hypnos {
    pub fn new(snapshot_dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&snapshot_dir)?;
        Ok(Self {
            snapshot_dir,
            sleeping: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_sleeping(&self, id: &str) -> bool {
        self.sleeping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn sleeping_count(&self) -> usize {
        self.sleeping.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshot, shut down, and retain.
    pub async fn hibernate(
        &self,
        runtime: &dyn SandboxRuntime,
        id: &str,
    ) -> Result<(), RuntimeError> {
        let (cfg, request) = runtime.get_config(id).await?;

        let dir = self.snapshot_dir.join(id);
        std::fs::create_dir_all(&dir)?;
        let mem_path = dir.join("mem_file");
        let disk_path = dir.join("vm_state");

        runtime.create_snapshot(id, &mem_path, &disk_path).await?;
        runtime.shutdown(id).await?;

        let _ = self
            .sleeping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.to_string(),
                SleepingSandbox {
                    request,
                    cfg,
                    mem_path,
                    disk_path,
                    slept_at: Utc::now(),
                },
            );
        tracing::info!(sandbox = %id, "sandbox hibernated");
        Ok(())
    }

    /// Relaunch from the retained snapshot and verify with an inspect.
    pub async fn wake(
        &self,
        runtime: &dyn SandboxRuntime,
        id: &str,
    ) -> Result<SandboxRun, RuntimeError> {
        let record = self
            .sleeping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("{id} is not sleeping")))?;

        let mut cfg = record.cfg.clone();
        cfg.snapshot = SnapshotRef {
            id: format!("hypnos-{id}"),
            disk_image: record.disk_path.clone(),
            mem_file: Some(record.mem_path.clone()),
            kernel_image: None,
        };

        match runtime.launch(record.request.clone(), cfg).await {
            Ok(_) => {
                let run = runtime.inspect(id).await?;
                tracing::info!(sandbox = %id, "sandbox woke");
                Ok(run)
            }
            Err(e) => {
                // Keep the record so a later wake can retry.
                let _ = self
                    .sleeping
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.to_string(), record);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunStatus, RuntimeKind};
    use crate::runtime::fake::FakeBackend;
    use crate::runtime::state::tests::{config as vm_config, request};

    #[tokio::test]
    async fn hibernate_then_wake_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let hypnos = Hypnos::new(tmp.path().join("hypnos")).unwrap();

        let _ = backend
            .launch(request("sb-sleep", 128), vm_config())
            .await
            .unwrap();

        hypnos
            .hibernate(backend.as_ref(), "sb-sleep")
            .await
            .unwrap();
        assert!(hypnos.is_sleeping("sb-sleep"));
        // Shut down by hibernate.
        assert!(backend.inspect("sb-sleep").await.is_err());
        // Snapshot files were written.
        assert!(tmp.path().join("hypnos/sb-sleep/mem_file").exists());
        assert!(tmp.path().join("hypnos/sb-sleep/vm_state").exists());

        let run = hypnos.wake(backend.as_ref(), "sb-sleep").await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(!hypnos.is_sleeping("sb-sleep"));
    }

    #[tokio::test]
    async fn wake_of_unknown_sandbox_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let hypnos = Hypnos::new(tmp.path().join("hypnos")).unwrap();

        let err = hypnos.wake(backend.as_ref(), "never-slept").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_wake_retains_the_record() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let hypnos = Hypnos::new(tmp.path().join("hypnos")).unwrap();

        let _ = backend
            .launch(request("sb-sleep", 128), vm_config())
            .await
            .unwrap();
        hypnos
            .hibernate(backend.as_ref(), "sb-sleep")
            .await
            .unwrap();

        backend.fail_next_launches("no capacity");
        assert!(hypnos.wake(backend.as_ref(), "sb-sleep").await.is_err());
        assert!(hypnos.is_sleeping("sb-sleep"));
    }

    #[tokio::test]
    async fn hibernate_of_unknown_sandbox_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(RuntimeKind::Microvm);
        let hypnos = Hypnos::new(tmp.path().join("hypnos")).unwrap();

        let err = hypnos
            .hibernate(backend.as_ref(), "sb-ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
        assert_eq!(hypnos.sleeping_count(), 0);
    }
}
