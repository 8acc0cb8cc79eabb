//! Control channel.
//!
//! Out-of-band commands reach the agent over a publish/subscribe
//! transport. Payloads on the control topic are ASCII lines of the form
//! `TYPE SANDBOX_ID [ARG…]`; log and exec topics carry raw bytes.
//! Delivery is at-least-once, best-effort; consumers tolerate drops.
//! Ordering per topic is FIFO.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::SandboxId;

// ── Topics ──────────────────────────────────────────────────────────

pub fn control_topic(node_id: &str) -> String {
    format!("control:{node_id}")
}

pub fn logs_topic(sandbox_id: &str) -> String {
    format!("logs:{sandbox_id}")
}

pub fn exec_topic(sandbox_id: &str, req_id: &str) -> String {
    format!("exec:{sandbox_id}:{req_id}")
}

pub fn response_topic(req_id: &str) -> String {
    format!("response:{req_id}")
}

pub fn stdin_topic(req_id: &str) -> String {
    format!("stdin:{req_id}")
}

// ── Messages ────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer than two tokens; the message is discarded.
    #[error("message too short")]
    TooShort,

    #[error("unknown control type: {0}")]
    UnknownType(String),

    #[error("missing argument: {0}")]
    MissingArg(&'static str),

    #[error("bad argument: {0}")]
    BadArg(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Kill {
        sandbox_id: SandboxId,
    },
    Logs {
        sandbox_id: SandboxId,
        follow: bool,
    },
    Hibernate {
        sandbox_id: SandboxId,
    },
    Wake {
        sandbox_id: SandboxId,
    },
    Terminate {
        sandbox_id: SandboxId,
        grace: Option<Duration>,
    },
    Snapshot {
        sandbox_id: SandboxId,
    },
    Exec {
        sandbox_id: SandboxId,
        req_id: String,
        argv: Vec<String>,
    },
    ListSandboxes {
        req_id: String,
    },
}

impl ControlMessage {
    /// Decode one control-topic line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
        if tokens.len() < 2 {
            return Err(ParseError::TooShort);
        }
        let target = tokens[1].to_string();

        match tokens[0] {
            "KILL" => Ok(ControlMessage::Kill { sandbox_id: target }),
            "LOGS" => Ok(ControlMessage::Logs {
                sandbox_id: target,
                follow: tokens.get(2).copied() == Some("follow"),
            }),
            "HIBERNATE" => Ok(ControlMessage::Hibernate { sandbox_id: target }),
            "WAKE" => Ok(ControlMessage::Wake { sandbox_id: target }),
            "TERMINATE" => {
                let grace = match tokens.get(2) {
                    Some(raw) => Some(Duration::from_secs(
                        raw.parse()
                            .map_err(|_| ParseError::BadArg(format!("grace: {raw}")))?,
                    )),
                    None => None,
                };
                Ok(ControlMessage::Terminate {
                    sandbox_id: target,
                    grace,
                })
            }
            "SNAPSHOT" => Ok(ControlMessage::Snapshot { sandbox_id: target }),
            "EXEC" => {
                let req_id = tokens
                    .get(2)
                    .ok_or(ParseError::MissingArg("req_id"))?
                    .to_string();
                let argv: Vec<String> = tokens[3..].iter().map(|t| t.to_string()).collect();
                if argv.is_empty() {
                    return Err(ParseError::MissingArg("argv"));
                }
                Ok(ControlMessage::Exec {
                    sandbox_id: target,
                    req_id,
                    argv,
                })
            }
            "LIST_SANDBOXES" => Ok(ControlMessage::ListSandboxes { req_id: target }),
            other => Err(ParseError::UnknownType(other.to_string())),
        }
    }
}

// ── Transport ───────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Publish/subscribe transport for control, log, exec, and response
/// topics. The in-process implementation below serves single-host
/// deployments and tests; a networked broker implements the same seam.
#[async_trait]
pub trait ControlBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Vec<u8>>, BusError>;
}

const TOPIC_CAPACITY: usize = 256;

pub struct InMemoryControlBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl InMemoryControlBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl ControlBus for InMemoryControlBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // No subscribers is fine: best-effort delivery.
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<Vec<u8>>, BusError> {
        Ok(self.sender(topic).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_wire_naming() {
        assert_eq!(control_topic("node-a"), "control:node-a");
        assert_eq!(logs_topic("sb-1"), "logs:sb-1");
        assert_eq!(exec_topic("sb-1", "r-9"), "exec:sb-1:r-9");
        assert_eq!(response_topic("r-9"), "response:r-9");
        assert_eq!(stdin_topic("r-9"), "stdin:r-9");
    }

    #[test]
    fn parse_kill() {
        assert_eq!(
            ControlMessage::parse("KILL sb-1").unwrap(),
            ControlMessage::Kill {
                sandbox_id: "sb-1".into()
            }
        );
    }

    #[test]
    fn parse_logs_with_and_without_follow() {
        assert_eq!(
            ControlMessage::parse("LOGS sb-1 follow").unwrap(),
            ControlMessage::Logs {
                sandbox_id: "sb-1".into(),
                follow: true
            }
        );
        assert_eq!(
            ControlMessage::parse("LOGS sb-1").unwrap(),
            ControlMessage::Logs {
                sandbox_id: "sb-1".into(),
                follow: false
            }
        );
    }

    #[test]
    fn parse_terminate_grace() {
        assert_eq!(
            ControlMessage::parse("TERMINATE sb-1 10").unwrap(),
            ControlMessage::Terminate {
                sandbox_id: "sb-1".into(),
                grace: Some(Duration::from_secs(10))
            }
        );
        assert_eq!(
            ControlMessage::parse("TERMINATE sb-1").unwrap(),
            ControlMessage::Terminate {
                sandbox_id: "sb-1".into(),
                grace: None
            }
        );
        assert!(matches!(
            ControlMessage::parse("TERMINATE sb-1 soon").unwrap_err(),
            ParseError::BadArg(_)
        ));
    }

    #[test]
    fn parse_exec_carries_req_id_and_argv() {
        assert_eq!(
            ControlMessage::parse("EXEC sb-1 r-42 ls -la /tmp").unwrap(),
            ControlMessage::Exec {
                sandbox_id: "sb-1".into(),
                req_id: "r-42".into(),
                argv: vec!["ls".into(), "-la".into(), "/tmp".into()],
            }
        );
        assert_eq!(
            ControlMessage::parse("EXEC sb-1").unwrap_err(),
            ParseError::MissingArg("req_id")
        );
        assert_eq!(
            ControlMessage::parse("EXEC sb-1 r-42").unwrap_err(),
            ParseError::MissingArg("argv")
        );
    }

    #[test]
    fn parse_list_sandboxes_target_is_req_id() {
        assert_eq!(
            ControlMessage::parse("LIST_SANDBOXES r-7").unwrap(),
            ControlMessage::ListSandboxes {
                req_id: "r-7".into()
            }
        );
    }

    #[test]
    fn short_and_unknown_messages_are_rejected() {
        assert_eq!(
            ControlMessage::parse("KILL").unwrap_err(),
            ParseError::TooShort
        );
        assert_eq!(ControlMessage::parse("").unwrap_err(), ParseError::TooShort);
        assert!(matches!(
            ControlMessage::parse("REBOOT sb-1").unwrap_err(),
            ParseError::UnknownType(_)
        ));
    }

    #[test]
    fn repeated_spaces_are_tolerated() {
        assert_eq!(
            ControlMessage::parse("KILL  sb-1").unwrap(),
            ControlMessage::Kill {
                sandbox_id: "sb-1".into()
            }
        );
    }

    #[tokio::test]
    async fn bus_delivers_in_fifo_order() {
        let bus = InMemoryControlBus::new();
        let mut rx = bus.subscribe("control:node-a").await.unwrap();
        bus.publish("control:node-a", b"KILL sb-1".to_vec())
            .await
            .unwrap();
        bus.publish("control:node-a", b"KILL sb-2".to_vec())
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"KILL sb-1");
        assert_eq!(rx.recv().await.unwrap(), b"KILL sb-2");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_best_effort() {
        let bus = InMemoryControlBus::new();
        bus.publish("logs:sb-1", b"boot".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryControlBus::new();
        let mut a = bus.subscribe("logs:sb-a").await.unwrap();
        let mut b = bus.subscribe("logs:sb-b").await.unwrap();
        bus.publish("logs:sb-a", b"only-a".to_vec()).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), b"only-a");
        assert!(matches!(
            b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
