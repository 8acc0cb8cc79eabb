//! MicroVM backend.
//!
//! Each launch starts a VMM process with a per-VM API socket, pushes
//! machine/boot/drive/network config over the socket, and boots. When
//! the template snapshot carries a memory file the backend loads the
//! snapshot and resumes instead. A background task per launch captures
//! the VMM's exit status. Guest memory is sampled from the VMM
//! process's resident-set size.

pub mod api;
pub mod cmdline;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use self::api::{BootConfig, NetInterfaceConfig, SnapshotLoad, VmmApi};
use super::error::RuntimeError;
use super::logs;
use super::state::{RunSlot, RunTable};
use super::traits::SandboxRuntime;
use crate::domain::{Capacity, RuntimeKind, SandboxRequest, SandboxRun, VmConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MicrovmConfig {
    /// Path to the VMM binary.
    pub vmm_bin: PathBuf,
    /// Per-VM state directories live under here.
    pub state_dir: PathBuf,
    /// Prefixed onto VM ids so the reconcile sweep can recognise this
    /// deployment's VMM processes by command line.
    pub deployment_marker: String,
    /// How long to wait for the API socket after spawning the VMM.
    pub socket_wait: Duration,
    /// Guest page size used for RSS sampling.
    pub page_size: u64,
}

impl MicrovmConfig {
    pub fn new(vmm_bin: PathBuf, state_dir: PathBuf, deployment_marker: String) -> Self {
        Self {
            vmm_bin,
            state_dir,
            deployment_marker,
            socket_wait: Duration::from_secs(5),
            page_size: 4096,
        }
    }
}

pub struct MicrovmBackend {
    config: MicrovmConfig,
    table: RunTable,
}

impl MicrovmBackend {
    pub fn new(config: MicrovmConfig) -> Result<Self, RuntimeError> {
        std::fs::create_dir_all(&config.state_dir).map_err(|e| {
            RuntimeError::Internal(format!(
                "failed to create microvm state dir {}: {e}",
                config.state_dir.display()
            ))
        })?;
        Ok(Self {
            config,
            table: RunTable::new(),
        })
    }

    /// VMM binary present and KVM available.
    pub async fn health_check(&self) -> Result<(), RuntimeError> {
        if !self.config.vmm_bin.exists() {
            return Err(RuntimeError::BackendDown(format!(
                "vmm binary not found at {}",
                self.config.vmm_bin.display()
            )));
        }
        if !Path::new("/dev/kvm").exists() {
            return Err(RuntimeError::BackendDown("/dev/kvm not available".into()));
        }
        Ok(())
    }

    fn vm_dir(&self, id: &str) -> PathBuf {
        self.config.state_dir.join(id)
    }

    fn socket_path(&self, id: &str) -> PathBuf {
        self.vm_dir(id).join("vmm.socket")
    }

    fn release(&self, id: &str) {
        let _ = self.table.remove(id);
        let dir = self.vm_dir(id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(sandbox = %id, error = %e, "failed to remove vm state dir");
            }
        }
    }

    async fn kill_pid(pid: u32) {
        let _ = tokio::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }

    fn observed_memory_mb(&self, slot: &RunSlot) -> u64 {
        if slot.is_done() {
            return 0;
        }
        let Some(pid) = slot.pid() else { return 0 };
        let statm = match std::fs::read_to_string(format!("/proc/{pid}/statm")) {
            Ok(s) => s,
            Err(_) => return 0,
        };
        resident_pages(&statm)
            .map(|pages| pages * self.config.page_size / (1024 * 1024))
            .unwrap_or(0)
    }
}

/// Second field of /proc/<pid>/statm: resident pages.
fn resident_pages(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), RuntimeError> {
    let start = tokio::time::Instant::now();
    while !path.exists() {
        if start.elapsed() > timeout {
            return Err(RuntimeError::LaunchFailed(format!(
                "vmm api socket {} did not appear within {timeout:?}",
                path.display()
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

#[async_trait]
impl SandboxRuntime for MicrovmBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Microvm
    }

    async fn launch(
        &self,
        req: SandboxRequest,
        cfg: VmConfig,
    ) -> Result<SandboxRun, RuntimeError> {
        let id = req.id.clone();
        let vm_dir = self.vm_dir(&id);
        let console_path = vm_dir.join("console.log");
        let socket_path = self.socket_path(&id);

        let slot = RunSlot::new(req, cfg, RuntimeKind::Microvm, Some(console_path.clone()));
        self.table.insert_new(&id, slot.clone())?;

        tracing::info!(
            sandbox = %id,
            vcpu = slot.cfg.vcpu,
            mem_mib = slot.cfg.memory_mb,
            resume = slot.cfg.snapshot.mem_file.is_some(),
            "launching microvm"
        );

        if let Err(e) = std::fs::create_dir_all(&vm_dir) {
            self.release(&id);
            return Err(RuntimeError::LaunchFailed(format!(
                "failed to create vm state dir: {e}"
            )));
        }

        let console = match std::fs::File::create(&console_path)
            .and_then(|f| f.try_clone().map(|c| (f, c)))
        {
            Ok(files) => files,
            Err(e) => {
                self.release(&id);
                return Err(RuntimeError::LaunchFailed(format!(
                    "failed to create console file: {e}"
                )));
            }
        };

        let vm_id = format!("{}-{id}", self.config.deployment_marker);
        let child = tokio::process::Command::new(&self.config.vmm_bin)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--id")
            .arg(&vm_id)
            .stdout(Stdio::from(console.0))
            .stderr(Stdio::from(console.1))
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                self.release(&id);
                return Err(RuntimeError::LaunchFailed(format!(
                    "failed to start vmm: {e}"
                )));
            }
        };
        slot.set_pid(child.id());

        if let Err(e) = wait_for_socket(&socket_path, self.config.socket_wait).await {
            let _ = child.kill().await;
            self.release(&id);
            return Err(e);
        }

        // Configure over the socket: resume from snapshot when a memory
        // file is present (kernel omitted), boot otherwise.
        let api = VmmApi::new(socket_path);
        let net = slot.cfg.tap_device.as_ref().map(|tap| NetInterfaceConfig {
            iface_id: "eth0".into(),
            host_dev_name: tap.clone(),
        });

        let configured = if let Some(mem_file) = &slot.cfg.snapshot.mem_file {
            api.load_snapshot(&SnapshotLoad {
                snapshot_path: slot.cfg.snapshot.disk_image.to_string_lossy().to_string(),
                mem_file_path: mem_file.to_string_lossy().to_string(),
                resume_vm: true,
            })
            .await
        } else {
            match &slot.cfg.snapshot.kernel_image {
                Some(kernel) => {
                    let boot = BootConfig {
                        kernel_image_path: kernel.to_string_lossy().to_string(),
                        boot_args: cmdline::build_boot_args(&slot.req, &slot.cfg),
                        rootfs_path: slot.cfg.overlay_path.to_string_lossy().to_string(),
                        vcpu_count: slot.cfg.vcpu,
                        mem_size_mib: slot.cfg.memory_mb,
                    };
                    api.configure_and_boot(&boot, net.as_ref()).await
                }
                None => Err(RuntimeError::LaunchFailed(
                    "snapshot has neither memory file nor kernel image".into(),
                )),
            }
        };

        if let Err(e) = configured {
            let _ = child.kill().await;
            self.release(&id);
            return Err(match e {
                RuntimeError::LaunchFailed(m) => RuntimeError::LaunchFailed(m),
                other => RuntimeError::LaunchFailed(format!("vm configuration failed: {other}")),
            });
        }

        // Exit capture. The VMM process ends when the guest halts or is
        // killed; the recorded code drives status derivation.
        {
            let slot = slot.clone();
            let id = id.clone();
            let _ = tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        let code = status.code().unwrap_or(137);
                        tracing::info!(sandbox = %id, code, "vmm exited");
                        slot.record_exit(code);
                    }
                    Err(e) => {
                        tracing::warn!(sandbox = %id, error = %e, "vmm wait failed");
                        slot.record_failure(1, format!("vmm wait failed: {e}"));
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
        Ok(slot.run_view(self.observed_memory_mb(&slot)))
    }

    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError> {
        Ok(self
            .table
            .list()
            .into_iter()
            .map(|slot| {
                let mem = self.observed_memory_mb(&slot);
                slot.run_view(mem)
            })
            .collect())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let Some(slot) = self.table.remove(id) else {
            return Ok(());
        };
        tracing::info!(sandbox = %id, "killing microvm");
        if let Some(pid) = slot.pid() {
            Self::kill_pid(pid).await;
        }
        slot.record_failure(137, "killed");
        let dir = self.vm_dir(id);
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
        VmmApi::new(self.socket_path(id)).pause().await
    }

    async fn resume(&self, id: &str) -> Result<(), RuntimeError> {
        let _ = self
            .table
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        VmmApi::new(self.socket_path(id)).resume().await
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
        let api = VmmApi::new(self.socket_path(id));
        api.pause().await?;
        let result = api
            .create_snapshot(
                &disk_path.to_string_lossy(),
                &mem_path.to_string_lossy(),
            )
            .await;
        // Resume even when the snapshot failed.
        let resumed = api.resume().await;
        result.and(resumed)
    }

    async fn shutdown(&self, id: &str) -> Result<(), RuntimeError> {
        let Some(slot) = self.table.get(id) else {
            return Ok(());
        };
        tracing::info!(sandbox = %id, "graceful microvm shutdown");
        let _ = VmmApi::new(self.socket_path(id)).send_ctrl_alt_del().await;
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state::tests::{config as vm_config, request};
    use std::os::unix::fs::PermissionsExt;

    fn backend(dir: &Path, vmm_bin: PathBuf) -> MicrovmBackend {
        let mut config =
            MicrovmConfig::new(vmm_bin, dir.join("state"), "tartarus-test".into());
        config.socket_wait = Duration::from_millis(200);
        MicrovmBackend::new(config).unwrap()
    }

    /// A stand-in VMM: creates the API socket path as a plain file so
    /// launch proceeds to the configure step, which then fails because
    /// nothing is listening.
    fn write_fake_vmm(dir: &Path) -> PathBuf {
        let path = dir.join("fake-vmm.sh");
        std::fs::write(&path, "#!/bin/sh\ntouch \"$2\"\nexec sleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn resident_pages_parses_statm() {
        assert_eq!(resident_pages("12345 678 90 1 0 2 0"), Some(678));
        assert_eq!(resident_pages(""), None);
        assert_eq!(resident_pages("only-one"), None);
    }

    #[tokio::test]
    async fn launch_with_missing_vmm_fails_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), tmp.path().join("no-such-vmm"));

        let err = backend
            .launch(request("sb-1", 128), vm_config())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::LaunchFailed(_)));

        // No partial state.
        assert!(matches!(
            backend.inspect("sb-1").await.unwrap_err(),
            RuntimeError::NotFound(_)
        ));
        assert!(!backend.vm_dir("sb-1").exists());
    }

    #[tokio::test]
    async fn launch_cleans_up_when_configure_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let vmm = write_fake_vmm(tmp.path());
        let backend = backend(tmp.path(), vmm);

        // The fake VMM touches the socket path but serves no API, so the
        // configure step fails and the launch must roll back.
        let err = backend
            .launch(request("sb-1", 128), vm_config())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::LaunchFailed(_)));
        assert!(matches!(
            backend.inspect("sb-1").await.unwrap_err(),
            RuntimeError::NotFound(_)
        ));
        assert!(!backend.vm_dir("sb-1").exists());
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn kill_unknown_id_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), tmp.path().join("vmm"));
        backend.kill("never-launched").await.unwrap();
    }

    #[tokio::test]
    async fn wait_unknown_id_returns_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), tmp.path().join("vmm"));
        backend.wait("never-launched").await.unwrap();
    }

    #[tokio::test]
    async fn stream_logs_unknown_id_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), tmp.path().join("vmm"));
        let mut out = Vec::new();
        let err = backend
            .stream_logs("nope", &mut out, false)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn exec_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), tmp.path().join("vmm"));
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let (tx2, _rx2) = tokio::sync::mpsc::channel(1);
        let err = backend
            .exec("sb-1", &["ls".into()], tx, tx2)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported(_)));
    }

    #[tokio::test]
    async fn health_check_requires_vmm_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path(), tmp.path().join("absent"));
        assert!(matches!(
            backend.health_check().await.unwrap_err(),
            RuntimeError::BackendDown(_)
        ));
    }
}
