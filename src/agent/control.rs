//! Control loop.
//!
//! Subscribes to the node's control topic and services out-of-band
//! commands against already-launched sandboxes. Each command runs in
//! its own task so a long-lived stream (LOGS, EXEC) never blocks the
//! next command. Control messages never enqueue or schedule work.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, watch};

use super::NodeAgent;
use crate::control::{
    ControlMessage, ParseError, control_topic, exec_topic, logs_topic, response_topic,
    stdin_topic,
};
use crate::runtime::error::RuntimeError;

pub(crate) async fn run_control_loop(
    agent: Arc<NodeAgent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let topic = control_topic(&agent.config.node_id);
    let mut rx = match agent.bus.subscribe(&topic).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(topic = %topic, error = %e, "control subscribe failed");
            return;
        }
    };
    tracing::info!(topic = %topic, "control loop subscribed");

    loop {
        let payload = tokio::select! {
            _ = shutdown.changed() => return,
            payload = rx.recv() => payload,
        };
        match payload {
            Ok(bytes) => {
                let line = String::from_utf8_lossy(&bytes).to_string();
                match ControlMessage::parse(&line) {
                    Ok(message) => {
                        let agent = agent.clone();
                        let _ = tokio::spawn(async move { handle(agent, message).await });
                    }
                    Err(ParseError::TooShort) => {
                        tracing::debug!(line = %line, "discarding short control message");
                    }
                    Err(e) => {
                        tracing::warn!(line = %line, error = %e, "bad control message");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "control receiver lagged, messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn handle(agent: Arc<NodeAgent>, message: ControlMessage) {
    match message {
        ControlMessage::Kill { sandbox_id } => match agent.runtime.kill(&sandbox_id).await {
            Ok(()) => tracing::info!(sandbox = %sandbox_id, "killed via control channel"),
            Err(e) => tracing::error!(sandbox = %sandbox_id, error = %e, "control kill failed"),
        },

        ControlMessage::Logs { sandbox_id, follow } => {
            stream_logs_to_topic(agent, sandbox_id, follow).await;
        }

        ControlMessage::Hibernate { sandbox_id } => match &agent.hypnos {
            Some(hypnos) => {
                if let Err(e) = hypnos.hibernate(agent.runtime.as_ref(), &sandbox_id).await {
                    tracing::error!(sandbox = %sandbox_id, error = %e, "hibernate failed");
                }
            }
            None => {
                metrics::counter!("tartarus_hypnos_disabled_total").increment(1);
                tracing::info!(sandbox = %sandbox_id, "hibernate requested but hypnos is disabled");
            }
        },

        ControlMessage::Wake { sandbox_id } => match &agent.hypnos {
            Some(hypnos) => match hypnos.wake(agent.runtime.as_ref(), &sandbox_id).await {
                Ok(run) => {
                    tracing::info!(sandbox = %sandbox_id, status = ?run.status, "woke sandbox")
                }
                Err(e) => tracing::error!(sandbox = %sandbox_id, error = %e, "wake failed"),
            },
            None => {
                metrics::counter!("tartarus_hypnos_disabled_total").increment(1);
                tracing::info!(sandbox = %sandbox_id, "wake requested but hypnos is disabled");
            }
        },

        ControlMessage::Terminate { sandbox_id, grace } => {
            let grace = grace.unwrap_or(agent.config.terminate_grace);
            let shut = tokio::time::timeout(grace, agent.runtime.shutdown(&sandbox_id)).await;
            match shut {
                Ok(Ok(())) => tracing::info!(sandbox = %sandbox_id, "terminated gracefully"),
                Ok(Err(e)) => {
                    tracing::error!(sandbox = %sandbox_id, error = %e, "terminate failed")
                }
                Err(_) => {
                    tracing::warn!(sandbox = %sandbox_id, grace = ?grace, "grace elapsed, killing");
                    if let Err(e) = agent.runtime.kill(&sandbox_id).await {
                        tracing::error!(sandbox = %sandbox_id, error = %e, "terminate kill failed");
                    }
                }
            }
        }

        ControlMessage::Snapshot { sandbox_id } => {
            let dir = agent.config.snapshot_out_dir.join(&sandbox_id);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                tracing::error!(sandbox = %sandbox_id, error = %e, "snapshot dir create failed");
                return;
            }
            let mem_path = dir.join("mem_file");
            let disk_path = dir.join("vm_state");
            match agent
                .runtime
                .create_snapshot(&sandbox_id, &mem_path, &disk_path)
                .await
            {
                Ok(()) => tracing::info!(sandbox = %sandbox_id, dir = %dir.display(), "snapshot created"),
                Err(e) => tracing::error!(sandbox = %sandbox_id, error = %e, "snapshot failed"),
            }
        }

        ControlMessage::Exec {
            sandbox_id,
            req_id,
            argv,
        } => {
            exec_to_topic(agent, sandbox_id, req_id, argv).await;
        }

        ControlMessage::ListSandboxes { req_id } => {
            let runs = match agent.runtime.list().await {
                Ok(runs) => runs,
                Err(e) => {
                    tracing::error!(error = %e, "list failed");
                    return;
                }
            };
            match serde_json::to_vec(&runs) {
                Ok(payload) => {
                    if let Err(e) = agent.bus.publish(&response_topic(&req_id), payload).await {
                        tracing::error!(req = %req_id, error = %e, "list response publish failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "list encode failed"),
            }
        }
    }
}

/// Pump `stream_logs` output onto the sandbox's log topic.
async fn stream_logs_to_topic(agent: Arc<NodeAgent>, sandbox_id: String, follow: bool) {
    let (writer, mut reader) = tokio::io::duplex(8 * 1024);

    let pump = {
        let runtime = agent.runtime.clone();
        let sandbox_id = sandbox_id.clone();
        tokio::spawn(async move {
            let mut writer = writer;
            if let Err(e) = runtime.stream_logs(&sandbox_id, &mut writer, follow).await {
                tracing::debug!(sandbox = %sandbox_id, error = %e, "log stream ended with error");
            }
            // Dropping the writer EOFs the reader.
        })
    };

    let topic = logs_topic(&sandbox_id);
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if agent.bus.publish(&topic, buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = pump.await;
}

/// Run a command in the sandbox, streaming output to the exec topic
/// keyed by the request id. Stdin arrives over the per-request stdin
/// topic when the backend supports interactive exec.
async fn exec_to_topic(
    agent: Arc<NodeAgent>,
    sandbox_id: String,
    req_id: String,
    argv: Vec<String>,
) {
    let topic = exec_topic(&sandbox_id, &req_id);
    let (stdout_tx, mut stdout_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
    let (stderr_tx, mut stderr_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);

    let out_pump = {
        let bus = agent.bus.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            while let Some(chunk) = stdout_rx.recv().await {
                let _ = bus.publish(&topic, chunk).await;
            }
        })
    };
    let err_pump = {
        let bus = agent.bus.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            while let Some(chunk) = stderr_rx.recv().await {
                let _ = bus.publish(&topic, chunk).await;
            }
        })
    };

    // Bridge the stdin topic into a byte channel for interactive exec.
    let (stdin_tx, stdin_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
    let stdin_pump = match agent.bus.subscribe(&stdin_topic(&req_id)).await {
        Ok(mut rx) => Some(tokio::spawn(async move {
            while let Ok(chunk) = rx.recv().await {
                if stdin_tx.send(chunk).await.is_err() {
                    return;
                }
            }
        })),
        Err(_) => None,
    };

    let result = match agent
        .runtime
        .exec_interactive(
            &sandbox_id,
            &argv,
            stdin_rx,
            stdout_tx.clone(),
            stderr_tx.clone(),
        )
        .await
    {
        Err(RuntimeError::Unsupported(_)) => {
            agent
                .runtime
                .exec(&sandbox_id, &argv, stdout_tx, stderr_tx)
                .await
        }
        other => {
            drop(stdout_tx);
            drop(stderr_tx);
            other
        }
    };

    match result {
        Ok(code) => tracing::info!(sandbox = %sandbox_id, req = %req_id, code, "exec finished"),
        Err(e) => tracing::error!(sandbox = %sandbox_id, req = %req_id, error = %e, "exec failed"),
    }

    if let Some(pump) = stdin_pump {
        pump.abort();
    }
    let _ = out_pump.await;
    let _ = err_pump.await;
}
