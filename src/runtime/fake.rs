//! Scriptable in-memory backend used across component tests.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::error::RuntimeError;
use super::state::{RunSlot, RunTable};
use super::traits::{OutputSender, SandboxRuntime};
use crate::domain::{Capacity, RuntimeKind, SandboxRequest, SandboxRun, VmConfig};

pub struct FakeBackend {
    kind: RuntimeKind,
    table: RunTable,
    /// When set, every launch fails with this message.
    fail_launch: Mutex<Option<String>>,
    /// Observed memory reported as a percentage of the requested mem_mb.
    memory_percent: Mutex<u64>,
    /// Ids passed to kill, in order.
    pub kills: Mutex<Vec<String>>,
    /// Console bytes returned by stream_logs.
    pub console: Mutex<Vec<u8>>,
}

impl FakeBackend {
    pub fn new(kind: RuntimeKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            table: RunTable::new(),
            fail_launch: Mutex::new(None),
            memory_percent: Mutex::new(0),
            kills: Mutex::new(Vec::new()),
            console: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next_launches(&self, message: &str) {
        *self.fail_launch.lock().unwrap() = Some(message.to_string());
    }

    pub fn report_memory_percent(&self, percent: u64) {
        *self.memory_percent.lock().unwrap() = percent;
    }

    /// Finish a run with the given exit code, as the workload would.
    pub fn complete(&self, id: &str, code: i32) {
        if let Some(slot) = self.table.get(id) {
            slot.record_exit(code);
        }
    }

    pub fn killed_ids(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    fn observed_mem(&self, slot: &RunSlot) -> u64 {
        let percent = *self.memory_percent.lock().unwrap();
        u64::from(slot.req.resources.mem_mb) * percent / 100
    }
}

#[async_trait]
impl SandboxRuntime for FakeBackend {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn launch(
        &self,
        req: SandboxRequest,
        cfg: VmConfig,
    ) -> Result<SandboxRun, RuntimeError> {
        if let Some(message) = self.fail_launch.lock().unwrap().clone() {
            return Err(RuntimeError::LaunchFailed(message));
        }
        let id = req.id.clone();
        let slot = RunSlot::new(req, cfg, self.kind, None);
        self.table.insert_new(&id, slot.clone())?;
        Ok(slot.run_view(0))
    }

    async fn inspect(&self, id: &str) -> Result<SandboxRun, RuntimeError> {
        let slot = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let mem = self.observed_mem(&slot);
        Ok(slot.run_view(mem))
    }

    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError> {
        Ok(self.table.list().into_iter().map(|s| s.run_view(0)).collect())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.kills.lock().unwrap().push(id.to_string());
        let Some(slot) = self.table.remove(id) else {
            return Ok(());
        };
        slot.record_failure(137, "killed");
        Ok(())
    }

    async fn shutdown(&self, id: &str) -> Result<(), RuntimeError> {
        self.kill(id).await
    }

    async fn create_snapshot(
        &self,
        id: &str,
        mem_path: &Path,
        disk_path: &Path,
    ) -> Result<(), RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        std::fs::write(mem_path, b"mem")?;
        std::fs::write(disk_path, b"disk")?;
        Ok(())
    }

    async fn get_config(
        &self,
        id: &str,
    ) -> Result<(VmConfig, SandboxRequest), RuntimeError> {
        let slot = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok((slot.cfg.clone(), slot.req.clone()))
    }

    async fn stream_logs(
        &self,
        id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        _follow: bool,
    ) -> Result<(), RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let bytes = self.console.lock().unwrap().clone();
        writer.write_all(&bytes).await?;
        Ok(())
    }

    async fn allocation(&self) -> Capacity {
        self.table.allocation()
    }

    async fn wait(&self, id: &str) -> Result<(), RuntimeError> {
        if let Some(slot) = self.table.get(id) {
            slot.wait_done().await;
        }
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        stdout: OutputSender,
        _stderr: OutputSender,
    ) -> Result<i32, RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let _ = stdout
            .send(format!("ran: {}", argv.join(" ")).into_bytes())
            .await;
        Ok(0)
    }
}
