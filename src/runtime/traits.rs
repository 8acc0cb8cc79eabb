use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use super::error::RuntimeError;
use crate::domain::{Capacity, RuntimeKind, SandboxRequest, SandboxRun, VmConfig};

/// Outgoing byte stream for exec output. Chunks preserve write order.
pub type OutputSender = mpsc::Sender<Vec<u8>>;

/// Incoming byte stream for interactive exec stdin.
pub type InputReceiver = mpsc::Receiver<Vec<u8>>;

/// Uniform lifecycle over heterogeneous isolation backends.
///
/// Backends implement this trait; the unified runtime delegates to the
/// owner. Operations a backend does not support return
/// `RuntimeError::Unsupported`. Launch is atomic: on failure no partial
/// state is visible to `inspect`/`list`.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Create and start a workload. Returns the run in RUNNING state.
    async fn launch(
        &self,
        req: SandboxRequest,
        cfg: VmConfig,
    ) -> Result<SandboxRun, RuntimeError>;

    /// Current run state. Status is derived from exit-code presence.
    async fn inspect(&self, id: &str) -> Result<SandboxRun, RuntimeError>;

    /// All backend-local runs.
    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError>;

    /// Forceful stop. Idempotent; NotFound is treated as done. Releases
    /// all backend-internal resources for the run.
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        let _ = id;
        Err(RuntimeError::Unsupported("pause"))
    }

    async fn resume(&self, id: &str) -> Result<(), RuntimeError> {
        let _ = id;
        Err(RuntimeError::Unsupported("resume"))
    }

    async fn create_snapshot(
        &self,
        id: &str,
        mem_path: &Path,
        disk_path: &Path,
    ) -> Result<(), RuntimeError> {
        let _ = (id, mem_path, disk_path);
        Err(RuntimeError::Unsupported("create_snapshot"))
    }

    /// Graceful stop: soft-stop, wait up to 30 s, then kill.
    async fn shutdown(&self, id: &str) -> Result<(), RuntimeError>;

    /// The config and request a run was launched with.
    async fn get_config(
        &self,
        id: &str,
    ) -> Result<(VmConfig, SandboxRequest), RuntimeError>;

    /// Copy console output into `writer`. Non-follow drains what the
    /// console holds and returns; follow tails until the run is terminal.
    async fn stream_logs(
        &self,
        id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        follow: bool,
    ) -> Result<(), RuntimeError>;

    /// Sum of RUNNING runs' requested resources.
    async fn allocation(&self) -> Capacity;

    /// Block until the run reaches a terminal state. Returns immediately
    /// for unknown ids (already released).
    async fn wait(&self, id: &str) -> Result<(), RuntimeError>;

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        stdout: OutputSender,
        stderr: OutputSender,
    ) -> Result<i32, RuntimeError> {
        let _ = (id, argv, stdout, stderr);
        Err(RuntimeError::Unsupported("exec"))
    }

    async fn exec_interactive(
        &self,
        id: &str,
        argv: &[String],
        stdin: InputReceiver,
        stdout: OutputSender,
        stderr: OutputSender,
    ) -> Result<i32, RuntimeError> {
        let _ = (id, argv, stdin, stdout, stderr);
        Err(RuntimeError::Unsupported("exec_interactive"))
    }
}
