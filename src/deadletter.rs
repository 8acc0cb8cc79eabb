//! Dead-letter records for unlaunchable requests.
//!
//! A record preserves the original request payload so an operator can
//! re-submit it. Writes never sit on the agent's critical path: they go
//! through a detached, timeout-bounded task, so a misbehaving sink can
//! only lose records, never stall the loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub run_id: String,
    pub request_id: String,
    pub reason: String,
    /// Base64 of the serialized request.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(run_id: &str, request_id: &str, reason: &str, payload: &[u8]) -> Self {
        Self {
            run_id: run_id.to_string(),
            request_id: request_id.to_string(),
            reason: reason.to_string(),
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
            created_at: Utc::now(),
        }
    }

    pub fn payload_bytes(&self) -> Option<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.payload)
            .ok()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("dead-letter sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, record: DeadLetterRecord) -> Result<(), SinkError>;
}

/// Fire-and-forget write with the sink timeout applied.
pub fn write_detached(sink: Arc<dyn DeadLetterSink>, record: DeadLetterRecord) {
    let _ = tokio::spawn(async move {
        let request_id = record.request_id.clone();
        match tokio::time::timeout(WRITE_TIMEOUT, sink.write(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(request = %request_id, error = %e, "dead-letter write failed");
            }
            Err(_) => {
                tracing::error!(request = %request_id, "dead-letter write timed out");
            }
        }
    });
}

/// Appends one JSON record per line to a file on disk.
pub struct FileDeadLetterSink {
    path: std::path::PathBuf,
}

impl FileDeadLetterSink {
    pub fn new(path: std::path::PathBuf) -> Result<Self, std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetterSink {
    async fn write(&self, record: DeadLetterRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| SinkError::Unavailable(format!("encode: {e}")))?;
        line.push(b'\n');

        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SinkError::Unavailable(format!("open {}: {e}", self.path.display())))?;
        file.write_all(&line)
            .map_err(|e| SinkError::Unavailable(format!("write: {e}")))?;
        Ok(())
    }
}

pub struct InMemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
    delay: Mutex<Duration>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Make every write stall, to exercise the detached timeout.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn write(&self, record: DeadLetterRecord) -> Result<(), SinkError> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_wire_format_is_json_with_base64_payload() {
        let record = DeadLetterRecord::new("sb-1", "sb-1", "launch failed", b"{\"id\":\"sb-1\"}");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["run_id"], "sb-1");
        assert_eq!(json["request_id"], "sb-1");
        assert_eq!(json["reason"], "launch failed");
        // RFC3339 timestamp.
        assert!(json["created_at"].as_str().unwrap().contains('T'));
        // Payload round-trips through base64.
        let decoded = DeadLetterRecord::new("x", "x", "x", b"")
            .payload_bytes()
            .unwrap();
        assert!(decoded.is_empty());
        assert_eq!(record.payload_bytes().unwrap(), b"{\"id\":\"sb-1\"}");
    }

    #[tokio::test]
    async fn detached_write_lands_in_sink() {
        let sink = InMemoryDeadLetterSink::new();
        write_detached(
            sink.clone(),
            DeadLetterRecord::new("sb-1", "sb-1", "launch failed", b"payload"),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "launch failed");
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dead-letters/records.jsonl");
        let sink = FileDeadLetterSink::new(path.clone()).unwrap();

        sink.write(DeadLetterRecord::new("sb-1", "sb-1", "launch failed", b"a"))
            .await
            .unwrap();
        sink.write(DeadLetterRecord::new("sb-2", "sb-2", "image pull failed", b"b"))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: DeadLetterRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.run_id, "sb-1");
    }

    #[tokio::test]
    async fn slow_sink_does_not_block_the_caller() {
        let sink = InMemoryDeadLetterSink::new();
        sink.set_delay(Duration::from_secs(60));

        let start = tokio::time::Instant::now();
        write_detached(
            sink.clone(),
            DeadLetterRecord::new("sb-1", "sb-1", "launch failed", b"payload"),
        );
        // The caller returns immediately; the write is detached.
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
