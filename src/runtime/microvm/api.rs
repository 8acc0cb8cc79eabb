//! VMM REST API client over the per-VM unix socket.
//!
//! The VMM exposes its control plane on a unix socket; requests go
//! through `curl --unix-socket` so the agent needs no special HTTP
//! stack for socket transport.

use std::path::PathBuf;
use std::process::Stdio;

use crate::runtime::error::RuntimeError;

/// Boot configuration pushed before `InstanceStart`.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub kernel_image_path: String,
    pub boot_args: String,
    pub rootfs_path: String,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

/// Network interface wired to a host tap.
#[derive(Debug, Clone)]
pub struct NetInterfaceConfig {
    pub iface_id: String,
    pub host_dev_name: String,
}

/// Snapshot load parameters; `resume_vm` starts the guest immediately.
#[derive(Debug, Clone)]
pub struct SnapshotLoad {
    pub snapshot_path: String,
    pub mem_file_path: String,
    pub resume_vm: bool,
}

/// Typed client for one VM's API socket.
pub struct VmmApi {
    socket_path: PathBuf,
}

impl VmmApi {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn request(
        &self,
        method: &str,
        endpoint: &str,
        body: Option<&str>,
    ) -> Result<String, RuntimeError> {
        let socket = self.socket_path.to_string_lossy().to_string();
        let url = format!("http://localhost{endpoint}");

        let mut args: Vec<String> = vec![
            "--unix-socket".into(),
            socket,
            "-s".into(),
            "-w".into(),
            "\n%{http_code}".into(),
            "-X".into(),
            method.into(),
        ];
        if let Some(body) = body {
            args.push("-H".into());
            args.push("Content-Type: application/json".into());
            args.push("-d".into());
            args.push(body.into());
        }
        args.push(url);

        let output = tokio::process::Command::new("curl")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        parse_response(endpoint, &stdout, &output.stderr)
    }

    async fn put(&self, endpoint: &str, body: serde_json::Value) -> Result<(), RuntimeError> {
        let _ = self.request("PUT", endpoint, Some(&body.to_string())).await?;
        Ok(())
    }

    async fn patch(&self, endpoint: &str, body: serde_json::Value) -> Result<(), RuntimeError> {
        let _ = self
            .request("PATCH", endpoint, Some(&body.to_string()))
            .await?;
        Ok(())
    }

    // ── High-level ops ──────────────────────────────────────────────

    pub async fn set_machine_config(
        &self,
        vcpu_count: u32,
        mem_size_mib: u32,
    ) -> Result<(), RuntimeError> {
        self.put(
            "/machine-config",
            serde_json::json!({
                "vcpu_count": vcpu_count,
                "mem_size_mib": mem_size_mib,
                "smt": false,
            }),
        )
        .await
    }

    pub async fn set_boot_source(
        &self,
        kernel_image_path: &str,
        boot_args: &str,
    ) -> Result<(), RuntimeError> {
        self.put(
            "/boot-source",
            serde_json::json!({
                "kernel_image_path": kernel_image_path,
                "boot_args": boot_args,
            }),
        )
        .await
    }

    pub async fn set_rootfs(&self, path_on_host: &str) -> Result<(), RuntimeError> {
        self.put(
            "/drives/rootfs",
            serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": path_on_host,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await
    }

    pub async fn set_network_interface(
        &self,
        config: &NetInterfaceConfig,
    ) -> Result<(), RuntimeError> {
        self.put(
            &format!("/network-interfaces/{}", config.iface_id),
            serde_json::json!({
                "iface_id": config.iface_id,
                "host_dev_name": config.host_dev_name,
            }),
        )
        .await
    }

    pub async fn start_instance(&self) -> Result<(), RuntimeError> {
        self.put(
            "/actions",
            serde_json::json!({ "action_type": "InstanceStart" }),
        )
        .await
    }

    /// Soft-stop: Ctrl-Alt-Del into the guest; the init exits and the
    /// VMM process terminates.
    pub async fn send_ctrl_alt_del(&self) -> Result<(), RuntimeError> {
        self.put(
            "/actions",
            serde_json::json!({ "action_type": "SendCtrlAltDel" }),
        )
        .await
    }

    pub async fn pause(&self) -> Result<(), RuntimeError> {
        self.patch("/vm", serde_json::json!({ "state": "Paused" })).await
    }

    pub async fn resume(&self) -> Result<(), RuntimeError> {
        self.patch("/vm", serde_json::json!({ "state": "Resumed" }))
            .await
    }

    /// Create a full snapshot. The VM must be paused.
    pub async fn create_snapshot(
        &self,
        snapshot_path: &str,
        mem_file_path: &str,
    ) -> Result<(), RuntimeError> {
        self.put(
            "/snapshot/create",
            serde_json::json!({
                "snapshot_type": "Full",
                "snapshot_path": snapshot_path,
                "mem_file_path": mem_file_path,
            }),
        )
        .await
    }

    /// Load a snapshot. Must run before any other configuration; with
    /// `resume_vm` the guest continues without a boot (no kernel image
    /// is configured on this path).
    pub async fn load_snapshot(&self, params: &SnapshotLoad) -> Result<(), RuntimeError> {
        self.put(
            "/snapshot/load",
            serde_json::json!({
                "snapshot_path": params.snapshot_path,
                "mem_backend": {
                    "backend_path": params.mem_file_path,
                    "backend_type": "File",
                },
                "resume_vm": params.resume_vm,
            }),
        )
        .await
    }

    /// Configure and boot from scratch.
    pub async fn configure_and_boot(
        &self,
        config: &BootConfig,
        net: Option<&NetInterfaceConfig>,
    ) -> Result<(), RuntimeError> {
        self.set_machine_config(config.vcpu_count, config.mem_size_mib)
            .await?;
        self.set_boot_source(&config.kernel_image_path, &config.boot_args)
            .await?;
        self.set_rootfs(&config.rootfs_path).await?;
        if let Some(net) = net {
            self.set_network_interface(net).await?;
        }
        self.start_instance().await
    }
}

/// curl output: body lines, then the HTTP status on the last line.
fn parse_response(endpoint: &str, output: &str, stderr: &[u8]) -> Result<String, RuntimeError> {
    let lines: Vec<&str> = output.lines().collect();
    let Some(status_str) = lines.last() else {
        return Err(RuntimeError::BackendDown(format!(
            "vmm api {endpoint}: no response ({})",
            String::from_utf8_lossy(stderr).trim()
        )));
    };

    let status: u16 = status_str.parse().unwrap_or(0);
    let body = lines[..lines.len() - 1].join("\n");

    if status == 0 {
        return Err(RuntimeError::BackendDown(format!(
            "vmm api {endpoint}: unparseable response: {output}"
        )));
    }
    if (200..300).contains(&status) {
        Ok(body)
    } else {
        Err(RuntimeError::Internal(format!(
            "vmm api {endpoint} returned HTTP {status}: {body}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_success() {
        let body = parse_response("/vm", "{\"state\":\"Paused\"}\n204", &[]).unwrap();
        assert_eq!(body, "{\"state\":\"Paused\"}");
    }

    #[test]
    fn parse_response_http_error() {
        let err = parse_response("/actions", "fault\n400", &[]).unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn parse_response_empty_is_backend_down() {
        let err = parse_response("/vm", "", b"connect refused").unwrap_err();
        assert!(matches!(err, RuntimeError::BackendDown(_)));
    }

    #[test]
    fn parse_response_garbage_status() {
        let err = parse_response("/vm", "not-a-status", &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::BackendDown(_)));
    }
}
