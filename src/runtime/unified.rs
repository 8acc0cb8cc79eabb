//! Unified runtime.
//!
//! Holds one optional handle per backend variant, picks the backend for
//! a launch (explicit isolation request, configured default, or the
//! auto-selector), and delegates operations on existing sandboxes to
//! their owner. `list` and `allocation` aggregate across all configured
//! backends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use super::error::RuntimeError;
use super::traits::{InputReceiver, OutputSender, SandboxRuntime};
use crate::domain::{
    Capacity, RuntimeKind, SandboxId, SandboxRequest, SandboxRun, VmConfig, meta,
};

/// A workload is lightweight when it fits the WASM fast path.
const LIGHTWEIGHT_TTL_CEILING: Duration = Duration::from_secs(300);

pub struct UnifiedRuntime {
    backends: HashMap<RuntimeKind, Arc<dyn SandboxRuntime>>,
    default_backend: RuntimeKind,
    auto_select: bool,
    /// Owner tags recorded at launch; misses fall back to probing.
    owners: Mutex<HashMap<SandboxId, RuntimeKind>>,
}

impl UnifiedRuntime {
    pub fn builder() -> UnifiedRuntimeBuilder {
        UnifiedRuntimeBuilder {
            backends: HashMap::new(),
            default_backend: RuntimeKind::Microvm,
            auto_select: true,
        }
    }

    fn backend(&self, kind: RuntimeKind) -> Result<&Arc<dyn SandboxRuntime>, RuntimeError> {
        self.backends
            .get(&kind)
            .ok_or_else(|| RuntimeError::BackendDown(format!("{} backend not configured", kind.as_str())))
    }

    /// Pick the backend for a launch.
    pub fn select(&self, req: &SandboxRequest) -> RuntimeKind {
        if let Some(isolation) = req.metadata.get(meta::ISOLATION_TYPE) {
            match isolation.as_str() {
                "microvm" => return RuntimeKind::Microvm,
                "wasm" => return RuntimeKind::Wasm,
                "gvisor" => return RuntimeKind::Gvisor,
                other => {
                    tracing::debug!(isolation = %other, "unrecognised isolation_type, ignoring");
                }
            }
        }

        if !self.auto_select {
            return self.default_backend;
        }

        if let Some(preferred) = req
            .metadata
            .get(meta::PREFERRED_RUNTIME)
            .and_then(|s| RuntimeKind::parse(s))
        {
            return preferred;
        }

        if is_lightweight(req) {
            return RuntimeKind::Wasm;
        }
        if is_privileged(req) {
            return RuntimeKind::Microvm;
        }
        RuntimeKind::Microvm
    }

    /// Find the backend owning `id`: the launch-time tag when we have
    /// one, otherwise probe every backend's inspect.
    async fn locate(&self, id: &str) -> Result<Arc<dyn SandboxRuntime>, RuntimeError> {
        let tagged = self.owners.lock().unwrap_or_else(|e| e.into_inner()).get(id).copied();
        if let Some(kind) = tagged {
            if let Some(backend) = self.backends.get(&kind) {
                return Ok(backend.clone());
            }
        }

        for (kind, backend) in &self.backends {
            if backend.inspect(id).await.is_ok() {
                let _ = self
                    .owners
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.to_string(), *kind);
                return Ok(backend.clone());
            }
        }
        Err(RuntimeError::NotFound(id.to_string()))
    }

    fn forget(&self, id: &str) {
        let _ = self
            .owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

fn is_lightweight(req: &SandboxRequest) -> bool {
    let r = &req.resources;
    if r.cpu_milli > 500 || r.mem_mb > 256 || r.gpu.count > 0 {
        return false;
    }
    let short_lived = !r.ttl.is_zero() && r.ttl < LIGHTWEIGHT_TTL_CEILING;
    let tiny = r.cpu_milli <= 250 && r.mem_mb <= 128;
    short_lived || tiny
}

fn is_privileged(req: &SandboxRequest) -> bool {
    let r = &req.resources;
    r.gpu.count > 0
        || r.cpu_milli > 2000
        || r.mem_mb > 4096
        || req.metadata.contains_key(meta::KERNEL_MODULES)
        || req.metadata.contains_key(meta::DEVICES)
}

pub struct UnifiedRuntimeBuilder {
    backends: HashMap<RuntimeKind, Arc<dyn SandboxRuntime>>,
    default_backend: RuntimeKind,
    auto_select: bool,
}

impl UnifiedRuntimeBuilder {
    pub fn with_backend(mut self, backend: Arc<dyn SandboxRuntime>) -> Self {
        let _ = self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn default_backend(mut self, kind: RuntimeKind) -> Self {
        self.default_backend = kind;
        self
    }

    pub fn auto_select(mut self, enabled: bool) -> Self {
        self.auto_select = enabled;
        self
    }

    pub fn build(self) -> UnifiedRuntime {
        UnifiedRuntime {
            backends: self.backends,
            default_backend: self.default_backend,
            auto_select: self.auto_select,
            owners: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SandboxRuntime for UnifiedRuntime {
    fn kind(&self) -> RuntimeKind {
        self.default_backend
    }

    async fn launch(
        &self,
        req: SandboxRequest,
        cfg: VmConfig,
    ) -> Result<SandboxRun, RuntimeError> {
        let kind = self.select(&req);
        let id = req.id.clone();
        tracing::debug!(sandbox = %id, runtime = kind.as_str(), "backend selected");

        let run = self.backend(kind)?.launch(req, cfg).await?;
        let _ = self
            .owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, kind);
        Ok(run)
    }

    async fn inspect(&self, id: &str) -> Result<SandboxRun, RuntimeError> {
        self.locate(id).await?.inspect(id).await
    }

    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError> {
        let mut runs = Vec::new();
        for backend in self.backends.values() {
            runs.extend(backend.list().await?);
        }
        Ok(runs)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        match self.locate(id).await {
            Ok(backend) => {
                let result = backend.kill(id).await;
                self.forget(id);
                result
            }
            // Already gone; kill is idempotent.
            Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        self.locate(id).await?.pause(id).await
    }

    async fn resume(&self, id: &str) -> Result<(), RuntimeError> {
        self.locate(id).await?.resume(id).await
    }

    async fn create_snapshot(
        &self,
        id: &str,
        mem_path: &Path,
        disk_path: &Path,
    ) -> Result<(), RuntimeError> {
        self.locate(id)
            .await?
            .create_snapshot(id, mem_path, disk_path)
            .await
    }

    async fn shutdown(&self, id: &str) -> Result<(), RuntimeError> {
        match self.locate(id).await {
            Ok(backend) => backend.shutdown(id).await,
            Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_config(
        &self,
        id: &str,
    ) -> Result<(VmConfig, SandboxRequest), RuntimeError> {
        self.locate(id).await?.get_config(id).await
    }

    async fn stream_logs(
        &self,
        id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        follow: bool,
    ) -> Result<(), RuntimeError> {
        self.locate(id).await?.stream_logs(id, writer, follow).await
    }

    async fn allocation(&self) -> Capacity {
        let mut total = Capacity::default();
        for backend in self.backends.values() {
            let alloc = backend.allocation().await;
            total.cpu_milli += alloc.cpu_milli;
            total.mem_mb += alloc.mem_mb;
            total.gpu += alloc.gpu;
        }
        total
    }

    async fn wait(&self, id: &str) -> Result<(), RuntimeError> {
        match self.locate(id).await {
            Ok(backend) => backend.wait(id).await,
            Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        stdout: OutputSender,
        stderr: OutputSender,
    ) -> Result<i32, RuntimeError> {
        self.locate(id).await?.exec(id, argv, stdout, stderr).await
    }

    async fn exec_interactive(
        &self,
        id: &str,
        argv: &[String],
        stdin: InputReceiver,
        stdout: OutputSender,
        stderr: OutputSender,
    ) -> Result<i32, RuntimeError> {
        self.locate(id)
            .await?
            .exec_interactive(id, argv, stdin, stdout, stderr)
            .await
    }
}
