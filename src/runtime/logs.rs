//! Console-file log streaming shared by the process-backed backends.
//!
//! Non-follow mode drains whatever the console file currently holds.
//! Follow mode tails the file with a 100 ms poll until the run's exit
//! code is recorded, then drains the remainder and returns EOF.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::error::RuntimeError;
use super::state::RunSlot;

const FOLLOW_POLL: Duration = Duration::from_millis(100);

/// Copy the current console contents into `writer` once.
pub async fn copy_console(
    path: &Path,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<(), RuntimeError> {
    let bytes = tokio::fs::read(path).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Tail the console into `writer` until the slot records an exit code.
/// Buffered output written before a kill is still drained.
pub async fn follow_console(
    slot: &Arc<RunSlot>,
    path: &Path,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<(), RuntimeError> {
    let mut offset: u64 = 0;
    loop {
        let done = slot.is_done();
        offset = drain_from(path, offset, writer).await?;
        if done {
            writer.flush().await?;
            return Ok(());
        }
        tokio::time::sleep(FOLLOW_POLL).await;
    }
}

async fn drain_from(
    path: &Path,
    offset: u64,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<u64, RuntimeError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        // The console may not exist yet right after launch.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(offset),
        Err(e) => return Err(e.into()),
    };
    let start = offset.min(bytes.len() as u64) as usize;
    if start < bytes.len() {
        writer.write_all(&bytes[start..]).await?;
    }
    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RuntimeKind;
    use crate::runtime::state::tests::{config, request};

    #[tokio::test]
    async fn copy_drains_current_contents() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.log");
        tokio::fs::write(&console, b"boot ok\n").await.unwrap();

        let mut out = Vec::new();
        copy_console(&console, &mut out).await.unwrap();
        assert_eq!(out, b"boot ok\n");
    }

    #[tokio::test]
    async fn follow_tails_until_exit_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.log");
        tokio::fs::write(&console, b"line 1\n").await.unwrap();

        let slot = RunSlot::new(
            request("sb-1", 64),
            config(),
            RuntimeKind::Microvm,
            Some(console.clone()),
        );

        let tail = {
            let slot = slot.clone();
            let console = console.clone();
            tokio::spawn(async move {
                let mut out = Vec::new();
                follow_console(&slot, &console, &mut out).await.unwrap();
                out
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut current = tokio::fs::read(&console).await.unwrap();
        current.extend_from_slice(b"line 2\n");
        tokio::fs::write(&console, &current).await.unwrap();
        slot.record_exit(0);

        let out = tail.await.unwrap();
        assert_eq!(out, b"line 1\nline 2\n");
    }

    #[tokio::test]
    async fn follow_on_killed_run_flushes_buffered_output() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.log");
        tokio::fs::write(&console, b"partial output").await.unwrap();

        let slot = RunSlot::new(
            request("sb-1", 64),
            config(),
            RuntimeKind::Microvm,
            Some(console.clone()),
        );
        slot.record_failure(137, "killed");

        let mut out = Vec::new();
        follow_console(&slot, &console, &mut out).await.unwrap();
        assert_eq!(out, b"partial output");
    }

    #[tokio::test]
    async fn missing_console_is_not_fatal_in_follow() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("absent.log");

        let slot = RunSlot::new(
            request("sb-1", 64),
            config(),
            RuntimeKind::Microvm,
            None,
        );
        slot.record_exit(0);

        let mut out = Vec::new();
        follow_console(&slot, &console, &mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
