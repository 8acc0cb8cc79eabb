//! Container backend.
//!
//! Delegates to an external container daemon over its REST API. The
//! backend ensures image presence (pulling when missing), creates the
//! container with a memory byte-limit and a CPU quota/period derived
//! from the requested milli-cores, and captures the exit code from the
//! daemon's wait endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::error::RuntimeError;
use super::state::{RunSlot, RunTable};
use super::traits::{OutputSender, SandboxRuntime};
use crate::domain::{Capacity, RuntimeKind, SandboxRequest, SandboxRun, VmConfig};

const DAEMON_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const FOLLOW_POLL: Duration = Duration::from_millis(100);

/// CPU throttling window: 100 ms.
const CPU_PERIOD_USEC: u64 = 100_000;

/// quota = milliCPU × 100 µs over a 100 ms period.
fn cpu_quota(cpu_milli: u32) -> (u64, u64) {
    (u64::from(cpu_milli) * 100, CPU_PERIOD_USEC)
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Base URL of the container daemon, e.g. `http://127.0.0.1:7700`.
    pub daemon_url: String,
}

#[derive(Debug, Deserialize)]
struct WaitResponse {
    exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    memory_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

pub struct ContainerBackend {
    daemon_url: String,
    client: reqwest::Client,
    table: Arc<RunTable>,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            daemon_url: config.daemon_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            table: Arc::new(RunTable::new()),
        }
    }

    pub async fn health_check(&self) -> Result<(), RuntimeError> {
        let url = format!("{}/health", self.daemon_url);
        let resp = self
            .client
            .get(&url)
            .timeout(DAEMON_HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| RuntimeError::BackendDown(format!("container daemon: {e}")))?;
        if !resp.status().is_success() {
            return Err(RuntimeError::BackendDown(format!(
                "container daemon health returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Pull the image when the daemon does not have it yet.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let url = format!("{}/images/{image}", self.daemon_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RuntimeError::BackendDown(format!("container daemon: {e}")))?;
        if resp.status().is_success() {
            return Ok(());
        }

        tracing::info!(image = %image, "pulling image");
        let url = format!("{}/images/pull", self.daemon_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "reference": image }))
            .send()
            .await
            .map_err(|e| RuntimeError::BackendDown(format!("container daemon: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::ImagePull(format!(
                "{image}: {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, RuntimeError> {
        let url = format!("{}{path}", self.daemon_url);
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RuntimeError::BackendDown(format!("container daemon: {e}")))
    }

    async fn observed_memory_mb(&self, id: &str) -> u64 {
        let url = format!("{}/containers/{id}/stats", self.daemon_url);
        let Ok(resp) = self.client.get(&url).send().await else {
            return 0;
        };
        match resp.json::<StatsResponse>().await {
            Ok(stats) => stats.memory_bytes / (1024 * 1024),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl SandboxRuntime for ContainerBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Container
    }

    async fn launch(
        &self,
        req: SandboxRequest,
        cfg: VmConfig,
    ) -> Result<SandboxRun, RuntimeError> {
        let id = req.id.clone();
        let image = cfg.snapshot.id.clone();

        let slot = RunSlot::new(req, cfg, RuntimeKind::Container, None);
        self.table.insert_new(&id, slot.clone())?;

        let launched: Result<(), RuntimeError> = async {
            self.ensure_image(&image).await?;

            let (quota, period) = cpu_quota(slot.req.resources.cpu_milli);
            let env: BTreeMap<&String, &String> = slot.req.env.iter().collect();
            let resp = self
                .post(
                    "/containers",
                    serde_json::json!({
                        "id": id,
                        "image": image,
                        "cmd": slot.req.argv(),
                        "env": env,
                        "memory_bytes": u64::from(slot.req.resources.mem_mb) * 1024 * 1024,
                        "cpu_quota": quota,
                        "cpu_period": period,
                        "overlay_path": slot.cfg.overlay_path,
                        "tap_device": slot.cfg.tap_device,
                    }),
                )
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(RuntimeError::LaunchFailed(format!(
                    "container create returned {status}: {body}"
                )));
            }

            let resp = self
                .post(&format!("/containers/{id}/start"), serde_json::json!({}))
                .await?;
            if !resp.status().is_success() {
                return Err(RuntimeError::LaunchFailed(format!(
                    "container start returned {}",
                    resp.status()
                )));
            }
            Ok(())
        }
        .await;

        if let Err(e) = launched {
            let _ = self.table.remove(&id);
            // Best effort: the daemon may have a half-created container.
            let url = format!("{}/containers/{id}", self.daemon_url);
            let _ = self.client.delete(&url).send().await;
            return Err(e);
        }

        tracing::info!(sandbox = %id, image = %slot.cfg.snapshot.id, "container launched");

        // Exit capture from the daemon's wait channel.
        {
            let slot = slot.clone();
            let client = self.client.clone();
            let url = format!("{}/containers/{id}/wait", self.daemon_url);
            let id = id.clone();
            let _ = tokio::spawn(async move {
                match client.post(&url).send().await {
                    Ok(resp) => match resp.json::<WaitResponse>().await {
                        Ok(wait) => {
                            tracing::info!(sandbox = %id, code = wait.exit_code, "container exited");
                            slot.record_exit(wait.exit_code);
                        }
                        Err(e) => slot.record_failure(1, format!("wait decode failed: {e}")),
                    },
                    Err(e) => slot.record_failure(1, format!("wait failed: {e}")),
                }
            });
        }

        Ok(slot.run_view(0))
    }

    async fn inspect(&self, id: &str) -> Result<SandboxRun, RuntimeError> {
        let slot = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let mem = if slot.is_done() {
            0
        } else {
            self.observed_memory_mb(id).await
        };
        Ok(slot.run_view(mem))
    }

    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError> {
        Ok(self.table.list().into_iter().map(|s| s.run_view(0)).collect())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let Some(slot) = self.table.remove(id) else {
            return Ok(());
        };
        tracing::info!(sandbox = %id, "killing container");
        let url = format!("{}/containers/{id}", self.daemon_url);
        if let Err(e) = self.client.delete(&url).send().await {
            tracing::warn!(sandbox = %id, error = %e, "container force-remove failed");
        }
        slot.record_failure(137, "killed");
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let resp = self
            .post(&format!("/containers/{id}/pause"), serde_json::json!({}))
            .await?;
        if !resp.status().is_success() {
            return Err(RuntimeError::Internal(format!(
                "pause returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<(), RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let resp = self
            .post(&format!("/containers/{id}/unpause"), serde_json::json!({}))
            .await?;
        if !resp.status().is_success() {
            return Err(RuntimeError::Internal(format!(
                "unpause returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn shutdown(&self, id: &str) -> Result<(), RuntimeError> {
        let Some(slot) = self.table.get(id) else {
            return Ok(());
        };
        tracing::info!(sandbox = %id, "graceful container shutdown");
        let _ = self
            .post(
                &format!("/containers/{id}/stop"),
                serde_json::json!({ "timeout_secs": SHUTDOWN_GRACE.as_secs() }),
            )
            .await;
        if tokio::time::timeout(SHUTDOWN_GRACE, slot.wait_done())
            .await
            .is_err()
        {
            tracing::warn!(sandbox = %id, "soft-stop timed out, killing");
            self.kill(id).await?;
        }
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
        follow: bool,
    ) -> Result<(), RuntimeError> {
        let slot = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        let mut offset: u64 = 0;
        loop {
            let done = slot.is_done();
            let url = format!(
                "{}/containers/{id}/logs?offset={offset}",
                self.daemon_url
            );
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| RuntimeError::BackendDown(format!("container daemon: {e}")))?;
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| RuntimeError::Internal(format!("log read failed: {e}")))?;
            if !bytes.is_empty() {
                writer.write_all(&bytes).await?;
                offset += bytes.len() as u64;
            }
            if !follow || done {
                writer.flush().await?;
                return Ok(());
            }
            tokio::time::sleep(FOLLOW_POLL).await;
        }
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
        stderr: OutputSender,
    ) -> Result<i32, RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let resp = self
            .post(
                &format!("/containers/{id}/exec"),
                serde_json::json!({ "argv": argv }),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(RuntimeError::Internal(format!(
                "exec returned {}",
                resp.status()
            )));
        }
        let exec: ExecResponse = resp
            .json()
            .await
            .map_err(|e| RuntimeError::Internal(format!("exec decode failed: {e}")))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        if let Ok(bytes) = b64.decode(&exec.stdout) {
            let _ = stdout.send(bytes).await;
        }
        if let Ok(bytes) = b64.decode(&exec.stderr) {
            let _ = stderr.send(bytes).await;
        }
        Ok(exec.exit_code)
    }
}
