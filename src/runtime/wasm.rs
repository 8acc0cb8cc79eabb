//! WASM backend.
//!
//! Runs a module file under a WASI host adapter, in-process. Stdout and
//! stderr are routed to a per-run console file. Exit code is 0 on clean
//! return, the `proc_exit` code when the guest exits explicitly, and 1
//! on module read or instantiation errors. Kill is implemented with
//! epoch interruption on the per-run engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use wasi_common::I32Exit;
use wasi_common::pipe::WritePipe;
use wasmtime::{Engine, Linker, Module, Store};
use wasmtime_wasi::sync::WasiCtxBuilder;

use super::error::RuntimeError;
use super::logs;
use super::state::{RunSlot, RunTable};
use super::traits::SandboxRuntime;
use crate::domain::{Capacity, RuntimeKind, SandboxRequest, SandboxRun, VmConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WasmConfig {
    /// Per-run console files live under here.
    pub state_dir: PathBuf,
}

pub struct WasmBackend {
    config: WasmConfig,
    table: Arc<RunTable>,
    /// Engines for running modules, used to deliver epoch interrupts.
    engines: Mutex<HashMap<String, Engine>>,
}

impl WasmBackend {
    pub fn new(config: WasmConfig) -> Result<Self, RuntimeError> {
        std::fs::create_dir_all(&config.state_dir).map_err(|e| {
            RuntimeError::Internal(format!(
                "failed to create wasm state dir {}: {e}",
                config.state_dir.display()
            ))
        })?;
        Ok(Self {
            config,
            table: Arc::new(RunTable::new()),
            engines: Mutex::new(HashMap::new()),
        })
    }

    fn run_dir(&self, id: &str) -> PathBuf {
        self.config.state_dir.join(id)
    }

    fn take_engine(&self, id: &str) -> Option<Engine> {
        self.engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }
}

fn engine() -> Result<Engine, RuntimeError> {
    let mut config = wasmtime::Config::new();
    let _ = config.epoch_interruption(true);
    Engine::new(&config).map_err(|e| RuntimeError::Internal(format!("wasm engine: {e}")))
}

/// Instantiate and drive the module to completion. Returns the guest
/// exit code per the backend's contract.
fn run_module(engine: &Engine, module_path: &Path, console_path: &Path) -> i32 {
    let bytes = match std::fs::read(module_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(module = %module_path.display(), error = %e, "module read failed");
            return 1;
        }
    };

    let console = match std::fs::File::create(console_path)
        .and_then(|f| f.try_clone().map(|c| (f, c)))
    {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(error = %e, "console create failed");
            return 1;
        }
    };

    let wasi = WasiCtxBuilder::new()
        .stdout(Box::new(WritePipe::new(console.0)))
        .stderr(Box::new(WritePipe::new(console.1)))
        .build();
    let mut store = Store::new(engine, wasi);
    store.set_epoch_deadline(1);

    let module = match Module::new(engine, &bytes) {
        Ok(module) => module,
        Err(e) => {
            tracing::warn!(module = %module_path.display(), error = %e, "module compile failed");
            return 1;
        }
    };

    let mut linker = Linker::new(engine);
    if let Err(e) = wasmtime_wasi::add_to_linker(&mut linker, |cx| cx) {
        tracing::warn!(error = %e, "wasi linker setup failed");
        return 1;
    }

    let instance = match linker.instantiate(&mut store, &module) {
        Ok(instance) => instance,
        Err(e) => {
            tracing::warn!(module = %module_path.display(), error = %e, "instantiation failed");
            return 1;
        }
    };

    match instance.get_typed_func::<(), ()>(&mut store, "_start") {
        Ok(start) => match start.call(&mut store, ()) {
            Ok(()) => 0,
            Err(trap) => match trap.downcast_ref::<I32Exit>() {
                Some(exit) => exit.0,
                None => 1,
            },
        },
        // Nothing to run is a clean return.
        Err(_) => 0,
    }
}

#[async_trait]
impl SandboxRuntime for WasmBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Wasm
    }

    async fn launch(
        &self,
        req: SandboxRequest,
        cfg: VmConfig,
    ) -> Result<SandboxRun, RuntimeError> {
        let id = req.id.clone();
        let run_dir = self.run_dir(&id);
        let console_path = run_dir.join("console.log");
        let module_path = cfg.snapshot.disk_image.clone();

        let slot = RunSlot::new(req, cfg, RuntimeKind::Wasm, Some(console_path.clone()));
        self.table.insert_new(&id, slot.clone())?;

        if let Err(e) = std::fs::create_dir_all(&run_dir) {
            let _ = self.table.remove(&id);
            return Err(RuntimeError::LaunchFailed(format!(
                "failed to create run dir: {e}"
            )));
        }

        let run_engine = match engine() {
            Ok(engine) => engine,
            Err(e) => {
                let _ = self.table.remove(&id);
                return Err(e);
            }
        };
        let _ = self
            .engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), run_engine.clone());

        tracing::info!(sandbox = %id, module = %module_path.display(), "launching wasm module");

        {
            let slot = slot.clone();
            let id = id.clone();
            let _ = tokio::task::spawn_blocking(move || {
                let code = run_module(&run_engine, &module_path, &console_path);
                tracing::info!(sandbox = %id, code, "wasm module finished");
                slot.record_exit(code);
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
        tracing::info!(sandbox = %id, "killing wasm module");
        if let Some(engine) = self.take_engine(id) {
            // Trips the epoch deadline; the running module traps out.
            engine.increment_epoch();
        }
        slot.record_failure(137, "killed");
        let dir = self.run_dir(id);
        if dir.exists() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        Ok(())
    }

    async fn shutdown(&self, id: &str) -> Result<(), RuntimeError> {
        let Some(slot) = self.table.get(id) else {
            return Ok(());
        };
        // No soft-stop channel into a wasm guest; give it the grace
        // window, then interrupt.
        if tokio::time::timeout(SHUTDOWN_GRACE, slot.wait_done())
            .await
            .is_err()
        {
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
