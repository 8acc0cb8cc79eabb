//! Per-backend run bookkeeping.
//!
//! Every backend keeps a lock-guarded map `SandboxId -> Arc<RunSlot>`.
//! The map mutex is held only for insert/remove/lookup; the exit-code
//! slot inside each `RunSlot` has its own narrow mutex written once by
//! the background task that captures the workload's exit status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::error::RuntimeError;
use crate::domain::{
    Capacity, RunStatus, RuntimeKind, SandboxId, SandboxRequest, SandboxRun, VmConfig,
};

#[derive(Debug, Default, Clone)]
struct ExitState {
    code: Option<i32>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

/// Backend-local state for one launched run.
pub struct RunSlot {
    pub req: SandboxRequest,
    pub cfg: VmConfig,
    kind: RuntimeKind,
    pub started_at: DateTime<Utc>,
    pub console_path: Option<PathBuf>,
    /// Host pid of the supervising process, when one exists.
    pub pid: Mutex<Option<u32>>,
    exit: Mutex<ExitState>,
    done_tx: watch::Sender<bool>,
}

impl RunSlot {
    pub fn new(
        req: SandboxRequest,
        cfg: VmConfig,
        kind: RuntimeKind,
        console_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            req,
            cfg,
            kind,
            started_at: Utc::now(),
            console_path,
            pid: Mutex::new(None),
            exit: Mutex::new(ExitState::default()),
            done_tx,
        })
    }

    /// Record the workload's exit code. First write wins; terminal
    /// transition is monotonic.
    pub fn record_exit(&self, code: i32) {
        {
            let mut exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
            if exit.code.is_some() {
                return;
            }
            exit.code = Some(code);
            exit.finished_at = Some(Utc::now());
        }
        let _ = self.done_tx.send(true);
    }

    /// Record a failure with an error string. Maps to FAILED with the
    /// given code.
    pub fn record_failure(&self, code: i32, error: impl Into<String>) {
        {
            let mut exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
            if exit.code.is_some() {
                return;
            }
            exit.code = Some(code);
            exit.error = Some(error.into());
            exit.finished_at = Some(Utc::now());
        }
        let _ = self.done_tx.send(true);
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.lock().unwrap_or_else(|e| e.into_inner()).code
    }

    pub fn is_done(&self) -> bool {
        self.exit_code().is_some()
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the exit code has been recorded.
    pub async fn wait_done(&self) {
        let mut rx = self.done_tx.subscribe();
        // wait_for returns immediately when the value already matches.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Project this slot into the shared run representation. Status is
    /// derived from exit-code presence.
    pub fn run_view(&self, observed_memory_mb: u64) -> SandboxRun {
        let exit = self
            .exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let status = match exit.code {
            Some(0) => RunStatus::Succeeded,
            Some(_) => RunStatus::Failed,
            None => RunStatus::Running,
        };
        SandboxRun {
            id: self.req.id.clone(),
            request_id: self.req.id.clone(),
            node_id: self.req.node_id.clone(),
            template: self.req.template.clone(),
            status,
            exit_code: exit.code,
            error: exit.error,
            runtime: Some(self.kind),
            started_at: Some(self.started_at),
            finished_at: exit.finished_at,
            created_at: self.req.created_at,
            updated_at: Utc::now(),
            memory_mb: observed_memory_mb,
        }
    }
}

/// Lock-guarded map of live runs for one backend.
pub struct RunTable {
    inner: Mutex<HashMap<SandboxId, Arc<RunSlot>>>,
}

impl RunTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a slot for a new run. A second launch with the same id
    /// fails without touching the first.
    pub fn insert_new(&self, id: &str, slot: Arc<RunSlot>) -> Result<(), RuntimeError> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(id) {
            return Err(RuntimeError::LaunchFailed(format!(
                "sandbox {id} already exists"
            )));
        }
        let _ = map.insert(id.to_string(), slot);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<RunSlot>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<RunSlot>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn list(&self) -> Vec<Arc<RunSlot>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Sum of requested resources across runs that are still running.
    pub fn allocation(&self) -> Capacity {
        let mut total = Capacity::default();
        for slot in self.list() {
            if !slot.is_done() {
                total.add(&slot.req.resources);
            }
        }
        total
    }
}
