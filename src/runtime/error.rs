use std::io;

/// Errors from runtime-backend operations.
///
/// Backends map their internal failures into these variants. `Unsupported`
/// is the expected return for capability-gated operations a backend does
/// not implement (e.g. pause on the WASM backend).
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("backend unavailable: {0}")]
    BackendDown(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// True for errors the queue should redeliver after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::BackendDown(_)
                | RuntimeError::ImagePull(_)
                | RuntimeError::ResourceExhausted(_)
        )
    }
}
