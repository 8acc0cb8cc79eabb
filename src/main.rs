use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tartarus::agent::hypnos::Hypnos;
use tartarus::agent::reconcile::{self, ReconcileConfig};
use tartarus::agent::{AgentConfig, NodeAgent};
use tartarus::config::Config;
use tartarus::control::InMemoryControlBus;
use tartarus::deadletter::FileDeadLetterSink;
use tartarus::domain::{Capacity, NodeInfo, RuntimeKind};
use tartarus::external::{
    InMemoryGateway, InMemoryOverlayPool, InMemoryQueue, InMemoryRegistry,
    InMemorySnapshotStore,
};
use tartarus::runtime::UnifiedRuntime;
use tartarus::runtime::container::{ContainerBackend, ContainerConfig};
use tartarus::runtime::gvisor::{GvisorBackend, GvisorConfig};
use tartarus::runtime::microvm::{MicrovmBackend, MicrovmConfig};
use tartarus::runtime::traits::SandboxRuntime;
use tartarus::runtime::wasm::{WasmBackend, WasmConfig};
use tartarus::watchdog::Watchdog;

#[derive(Parser)]
#[command(name = "tartarus", about = "Distributed sandbox orchestrator node agent")]
enum Cli {
    /// Run the node agent.
    #[command(alias = "run")]
    Serve,
    /// Run the host reclaim sweep once and exit.
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tartarus=info,hyper=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .init();

    let config = Config::from_env();

    // Default to serve when no subcommand is given, while keeping
    // --help and --version working.
    let cli = if std::env::args().len() <= 1 {
        Cli::Serve
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve => serve(config).await,
        Cli::Reconcile => {
            let report = reconcile::reconcile_host(&ReconcileConfig {
                tap_prefix: config.tap_prefix.clone(),
                vmm_bin_name: vmm_bin_name(&config),
                deployment_marker: config.deployment_marker.clone(),
            })
            .await;
            tracing::info!(
                taps = report.taps_deleted,
                processes = report.processes_killed,
                "reconcile done"
            );
            Ok(())
        }
    }
}

fn vmm_bin_name(config: &Config) -> String {
    config
        .vmm_bin
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "firecracker".to_string())
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!(node = %config.node_id, "starting node agent");

    let runtime = build_runtime(&config)?;

    // Single-host wiring: the queue, registry, pools, and bus run
    // in-process. Clustered deployments swap these seams for their
    // durable counterparts.
    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(InMemoryRegistry::new(config.heartbeat_period));
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let overlays = Arc::new(InMemoryOverlayPool::new(config.state_dir.join("overlays")));
    let gateway = Arc::new(InMemoryGateway::new(&config.tap_prefix));
    let bus = Arc::new(InMemoryControlBus::new());
    let deadletter = Arc::new(
        FileDeadLetterSink::new(config.state_dir.join("dead-letters.jsonl"))
            .context("dead-letter sink init failed")?,
    );

    let watchdog = Watchdog::new(runtime.clone(), gateway.clone(), config.watchdog_interval);
    let hypnos = if config.hypnos_enabled {
        Some(Hypnos::new(config.state_dir.join("hypnos")).context("hypnos init failed")?)
    } else {
        None
    };

    let node_info = NodeInfo {
        id: config.node_id.clone(),
        address: config.node_address.clone(),
        labels: BTreeMap::new(),
        capacity: Capacity {
            cpu_milli: config.capacity_cpu_milli,
            mem_mb: config.capacity_mem_mb,
            gpu: config.capacity_gpu,
        },
    };

    let mut agent_config = AgentConfig::new(
        &config.node_id,
        config.state_dir.join("snapshots"),
        ReconcileConfig {
            tap_prefix: config.tap_prefix.clone(),
            vmm_bin_name: vmm_bin_name(&config),
            deployment_marker: config.deployment_marker.clone(),
        },
    );
    agent_config.heartbeat_period = config.heartbeat_period;

    let agent = NodeAgent::new(
        agent_config,
        node_info,
        runtime,
        queue,
        registry,
        snapshots,
        overlays,
        gateway,
        bus,
        deadletter,
        watchdog,
        hypnos,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent_task = tokio::spawn(agent.run(shutdown_rx));

    tokio::signal::ctrl_c().await.context("signal wait failed")?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    agent_task.await.context("agent task failed")?;
    Ok(())
}

fn build_runtime(config: &Config) -> Result<Arc<UnifiedRuntime>> {
    let microvm: Arc<dyn SandboxRuntime> = Arc::new(
        MicrovmBackend::new(MicrovmConfig::new(
            config.vmm_bin.clone(),
            config.state_dir.join("microvms"),
            config.deployment_marker.clone(),
        ))
        .context("microvm backend init failed")?,
    );
    let gvisor: Arc<dyn SandboxRuntime> = Arc::new(
        GvisorBackend::new(GvisorConfig {
            kernel_bin: config.gvisor_bin.clone(),
            state_dir: config.state_dir.join("gvisor"),
            runtime_root: config.state_dir.join("gvisor-root"),
        })
        .context("gvisor backend init failed")?,
    );
    let wasm: Arc<dyn SandboxRuntime> = Arc::new(
        WasmBackend::new(WasmConfig {
            state_dir: config.state_dir.join("wasm"),
        })
        .context("wasm backend init failed")?,
    );

    let mut builder = UnifiedRuntime::builder()
        .with_backend(microvm)
        .with_backend(gvisor)
        .with_backend(wasm)
        .default_backend(config.default_runtime)
        .auto_select(config.auto_select);

    if let Some(url) = &config.container_daemon_url {
        let container: Arc<dyn SandboxRuntime> = Arc::new(ContainerBackend::new(
            ContainerConfig {
                daemon_url: url.clone(),
            },
        ));
        builder = builder.with_backend(container);
    } else {
        tracing::info!("container backend disabled (no daemon url)");
    }

    if config.default_runtime == RuntimeKind::Container && config.container_daemon_url.is_none()
    {
        tracing::warn!("default runtime is container but no daemon url is set");
    }

    Ok(Arc::new(builder.build()))
}
