use thiserror::Error;

/// Errors raised by the streaming engine and its collaborators
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Device already connected, disconnect before reconnecting")]
    AlreadyConnected,

    #[error("Session not prepared, send the initiation command first")]
    NotPrepared,

    #[error("Producer already running")]
    AlreadyRunning,

    #[error("Producer thread panicked")]
    ProducerPanicked,

    #[error("Failed to open channel: {0}")]
    OpenFailed(String),

    #[error("Ring buffer allocation failed ({bytes} bytes)")]
    AllocationFailed { bytes: usize },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    RecvFailed(String),

    #[error("Read timed out after {0} ms")]
    Timeout(u64),

    #[error("Data incomplete: packet at {offset} needs {size} bytes, only {available} written")]
    DataIncomplete {
        offset: usize,
        size: usize,
        available: usize,
    },

    #[error("Backlog overflow: {pending} unread packets (limit {max})")]
    BacklogOverflow { pending: usize, max: usize },

    #[error("Destination buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Packet rejected: {0}")]
    PacketRejected(String),

    #[error("Write slot mismatch: committed {offset}+{size} without a matching reservation")]
    SlotMismatch { offset: usize, size: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamError {
    /// Only read timeouts are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Timeout(_))
    }

    /// Backlog overflow is expected backpressure, not a defect
    pub fn is_backpressure(&self) -> bool {
        matches!(self, StreamError::BacklogOverflow { .. })
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
