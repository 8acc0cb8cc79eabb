//! gVisor-style backend.
//!
//! Writes an OCI bundle (rootfs + config.json) into a per-sandbox
//! directory and drives a user-space kernel binary over it. The
//! platform flag is detected from `/dev/kvm` presence. The binary also
//! serves pause/resume/checkpoint; exec shells through its `exec`
//! subcommand.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use super::error::RuntimeError;
use super::logs;
use super::state::{RunSlot, RunTable};
use super::traits::{OutputSender, SandboxRuntime};
use crate::domain::{Capacity, RuntimeKind, SandboxRequest, SandboxRun, VmConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GvisorConfig {
    /// Path to the user-space kernel binary.
    pub kernel_bin: PathBuf,
    /// Per-sandbox bundle directories live under here.
    pub state_dir: PathBuf,
    /// `--root` passed to every invocation.
    pub runtime_root: PathBuf,
}

pub struct GvisorBackend {
    config: GvisorConfig,
    platform: &'static str,
    table: Arc<RunTable>,
}

impl GvisorBackend {
    pub fn new(config: GvisorConfig) -> Result<Self, RuntimeError> {
        std::fs::create_dir_all(&config.state_dir).map_err(|e| {
            RuntimeError::Internal(format!(
                "failed to create gvisor state dir {}: {e}",
                config.state_dir.display()
            ))
        })?;
        std::fs::create_dir_all(&config.runtime_root).map_err(|e| {
            RuntimeError::Internal(format!(
                "failed to create gvisor runtime root {}: {e}",
                config.runtime_root.display()
            ))
        })?;
        Ok(Self {
            config,
            platform: detect_platform(Path::new("/dev/kvm")),
            table: Arc::new(RunTable::new()),
        })
    }

    pub async fn health_check(&self) -> Result<(), RuntimeError> {
        if !self.config.kernel_bin.exists() {
            return Err(RuntimeError::BackendDown(format!(
                "user-space kernel binary not found at {}",
                self.config.kernel_bin.display()
            )));
        }
        Ok(())
    }

    fn bundle_dir(&self, id: &str) -> PathBuf {
        self.config.state_dir.join(id)
    }

    /// Run a subcommand of the kernel binary against one sandbox.
    async fn runsc(&self, args: &[&str]) -> Result<std::process::Output, RuntimeError> {
        let output = tokio::process::Command::new(&self.config.kernel_bin)
            .arg("--root")
            .arg(&self.config.runtime_root)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }

    fn release(&self, id: &str) {
        let _ = self.table.remove(id);
        let dir = self.bundle_dir(id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(sandbox = %id, error = %e, "failed to remove bundle dir");
            }
        }
    }
}

/// `kvm` when the host exposes KVM, `ptrace` otherwise.
fn detect_platform(kvm_dev: &Path) -> &'static str {
    if kvm_dev.exists() { "kvm" } else { "ptrace" }
}

/// OCI runtime spec for one sandbox. The overlay is the root
/// filesystem; resources mirror the request.
fn oci_spec(req: &SandboxRequest, cfg: &VmConfig) -> serde_json::Value {
    let mut env: Vec<String> = vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into(),
    ];
    for (key, value) in &req.env {
        env.push(format!("{key}={value}"));
    }

    let quota = u64::from(req.resources.cpu_milli) * 100;

    serde_json::json!({
        "ociVersion": "1.0.2",
        "process": {
            "terminal": false,
            "args": req.argv(),
            "env": env,
            "cwd": "/",
        },
        "root": {
            "path": cfg.overlay_path,
            "readonly": false,
        },
        "mounts": [
            { "destination": "/proc", "type": "proc", "source": "proc" },
            {
                "destination": "/dev",
                "type": "tmpfs",
                "source": "tmpfs",
                "options": ["nosuid", "strictatime", "mode=755", "size=65536k"],
            },
        ],
        "linux": {
            "resources": {
                "memory": { "limit": u64::from(req.resources.mem_mb) * 1024 * 1024 },
                "cpu": { "quota": quota, "period": 100_000 },
            },
        },
    })
}

#[async_trait]
impl SandboxRuntime for GvisorBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Gvisor
    }

    async fn launch(
        &self,
        req: SandboxRequest,
        cfg: VmConfig,
    ) -> Result<SandboxRun, RuntimeError> {
        let id = req.id.clone();
        let bundle = self.bundle_dir(&id);
        let console_path = bundle.join("console.log");

        let slot = RunSlot::new(req, cfg, RuntimeKind::Gvisor, Some(console_path.clone()));
        self.table.insert_new(&id, slot.clone())?;

        tracing::info!(sandbox = %id, platform = self.platform, "launching gvisor sandbox");

        let prepared: Result<(std::fs::File, std::fs::File), RuntimeError> = (|| {
            std::fs::create_dir_all(bundle.join("rootfs"))?;
            let spec = oci_spec(&slot.req, &slot.cfg);
            std::fs::write(
                bundle.join("config.json"),
                serde_json::to_vec_pretty(&spec)
                    .map_err(|e| RuntimeError::Internal(format!("spec encode failed: {e}")))?,
            )?;
            let console = std::fs::File::create(&console_path)?;
            let console_err = console.try_clone()?;
            Ok((console, console_err))
        })();

        let (stdout, stderr) = match prepared {
            Ok(files) => files,
            Err(e) => {
                self.release(&id);
                return Err(RuntimeError::LaunchFailed(format!(
                    "bundle write failed: {e}"
                )));
            }
        };

        let child = tokio::process::Command::new(&self.config.kernel_bin)
            .arg("--root")
            .arg(&self.config.runtime_root)
            .arg(format!("--platform={}", self.platform))
            .arg("run")
            .arg("--bundle")
            .arg(&bundle)
            .arg(&id)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                self.release(&id);
                return Err(RuntimeError::LaunchFailed(format!(
                    "failed to start user-space kernel: {e}"
                )));
            }
        };
        slot.set_pid(child.id());

        {
            let slot = slot.clone();
            let id = id.clone();
            let _ = tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        let code = status.code().unwrap_or(137);
                        tracing::info!(sandbox = %id, code, "gvisor sandbox exited");
                        slot.record_exit(code);
                    }
                    Err(e) => {
                        tracing::warn!(sandbox = %id, error = %e, "gvisor wait failed");
                        slot.record_failure(1, format!("wait failed: {e}"));
                    }
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
        Ok(slot.run_view(0))
    }

    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError> {
        Ok(self.table.list().into_iter().map(|s| s.run_view(0)).collect())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let Some(slot) = self.table.remove(id) else {
            return Ok(());
        };
        tracing::info!(sandbox = %id, "killing gvisor sandbox");
        let _ = self.runsc(&["kill", id, "KILL"]).await;
        let _ = self.runsc(&["delete", "-force", id]).await;
        // The supervising process should exit on its own after `kill`;
        // make sure of it.
        if let Some(pid) = slot.pid() {
            let _ = tokio::process::Command::new("kill")
                .args(["-9", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
        slot.record_failure(137, "killed");
        let dir = self.bundle_dir(id);
        if dir.exists() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let output = self.runsc(&["pause", id]).await?;
        if !output.status.success() {
            return Err(RuntimeError::Internal(format!(
                "pause failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<(), RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let output = self.runsc(&["resume", id]).await?;
        if !output.status.success() {
            return Err(RuntimeError::Internal(format!(
                "resume failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        id: &str,
        mem_path: &Path,
        _disk_path: &Path,
    ) -> Result<(), RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        // The user-space kernel writes the full checkpoint image (memory
        // and fs state) under one directory.
        let image_dir = mem_path.to_string_lossy().to_string();
        std::fs::create_dir_all(mem_path)?;
        let output = self
            .runsc(&["checkpoint", "--image-path", &image_dir, id])
            .await?;
        if !output.status.success() {
            return Err(RuntimeError::Internal(format!(
                "checkpoint failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn shutdown(&self, id: &str) -> Result<(), RuntimeError> {
        let Some(slot) = self.table.get(id) else {
            return Ok(());
        };
        tracing::info!(sandbox = %id, "graceful gvisor shutdown");
        let _ = self.runsc(&["kill", id, "TERM"]).await;
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
        let Some(console) = slot.console_path.clone() else {
            return Ok(());
        };
        if follow {
            logs::follow_console(&slot, &console, writer).await
        } else {
            logs::copy_console(&console, writer).await
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
        let mut args: Vec<&str> = vec!["exec", id];
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        args.extend_from_slice(&argv_refs);

        let output = self.runsc(&args).await?;
        if !output.stdout.is_empty() {
            let _ = stdout.send(output.stdout).await;
        }
        if !output.stderr.is_empty() {
            let _ = stderr.send(output.stderr).await;
        }
        Ok(output.status.code().unwrap_or(1))
    }
}
