use thiserror::Error;

use crate::message::StdioStream;

/// Rejected worker targets. Reported synchronously by `spawn` and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("worker target `{0}` must be an absolute path or start with `./` or `../`")]
    InvalidPath(String),

    #[error("worker target has an unsupported extension `{0}`")]
    UnsupportedExtension(String),

    #[error("no script is registered under `{0}`")]
    UnknownScript(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("protocol violation on the control channel: {0}")]
    ProtocolViolation(String),

    #[error("message port was transferred and can no longer be used here")]
    UseAfterTransfer,

    #[error("invalid transfer list: {0}")]
    InvalidTransfer(String),

    #[error("not attached to a running event loop or worker")]
    Detached,

    #[error("worker has already exited")]
    Disposed,

    #[error("write after end on {0}")]
    WriteAfterEnd(StdioStream),

    #[error("thrown value cannot be serialized across the thread boundary")]
    Unserializable,

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;
