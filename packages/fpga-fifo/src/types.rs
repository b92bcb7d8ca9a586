// Common types shared by the producer, consumer and session controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle of a streaming session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", content = "data")]
pub enum StreamState {
    /// No initiation command sent yet
    #[default]
    Idle,

    /// Initiation command accepted by the hardware
    Prepared,

    /// Producer loop is receiving packets
    Streaming,

    /// Producer halted on request or on backlog overflow; may be resumed
    Stopped { reason: StopReason },

    /// Producer halted on a transport or validation failure
    Failed { message: String },
}

impl StreamState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamState::Streaming)
    }

    /// Whether the producer may (re)enter the streaming loop from this state
    pub fn can_stream(&self) -> bool {
        matches!(
            self,
            StreamState::Prepared | StreamState::Streaming | StreamState::Stopped { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    BacklogOverflow,
}

/// One completed packet as published to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketDescriptor {
    pub offset: usize,
    pub size: usize,
    pub sequence: u64,
}

/// Statistics about a streaming session
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StreamStats {
    pub packets_received: u64,
    pub packets_read: u64,
    pub bytes_received: u64,
    pub wraparounds: u64,
    pub backlog: usize,
    pub peak_backlog: usize,
    pub write_position: usize,
    pub read_position: usize,
    pub last_loop_micros: u64,
    pub send_count: u64,
    pub recv_count: u64,
    /// When the producer first entered `Streaming` since connect
    pub started_at: Option<DateTime<Utc>>,
}

/// Events emitted by a session to its observer
#[derive(Debug, Clone)]
pub enum StreamEvent {
    StateChanged {
        session_id: String,
        state: StreamState,
    },
    PacketCommitted {
        session_id: String,
        sequence: u64,
        offset: usize,
        size: usize,
        wrapped: bool,
    },
    BacklogOverflow {
        session_id: String,
        pending: usize,
    },
    Error {
        session_id: String,
        error: String,
    },
    StatsUpdate {
        session_id: String,
        stats: StreamStats,
    },
}

/// Observer callback injected at session construction
pub type EventCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;
