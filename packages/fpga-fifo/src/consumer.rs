// Consumer side of the stream: drains committed packets out of the ring

use crate::config::DiagnosticsConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{StreamError, StreamResult};
use crate::pacing::Pacer;
use crate::ring::RingBuffer;
use crate::session::SessionShared;
use crate::types::{PacketDescriptor, StopReason, StreamState};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Poll timeout used by `run` between liveness checks
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Receives every packet drained by `StreamConsumer::run`
pub trait PacketSink {
    fn accept(&mut self, descriptor: &PacketDescriptor, data: &[u8]) -> StreamResult<()>;
}

impl<F> PacketSink for F
where
    F: FnMut(&PacketDescriptor, &[u8]) -> StreamResult<()>,
{
    fn accept(&mut self, descriptor: &PacketDescriptor, data: &[u8]) -> StreamResult<()> {
        self(descriptor, data)
    }
}

/// Why a consumer loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStop {
    Cancelled,
    Disconnected,
    /// The producer halted and every committed packet was read
    Drained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSummary {
    pub packets: u64,
    pub bytes: u64,
    pub stop: ConsumerStop,
}

/// Handle for reading packets; may be moved to its own thread
#[derive(Clone)]
pub struct StreamConsumer {
    ring: Arc<RingBuffer>,
    shared: Arc<SessionShared>,
    pacer: Pacer,
    cancel: CancellationToken,
    poll_timeout_ms: u64,
    stop_when_drained: bool,
    diagnostics: Diagnostics,
}

impl StreamConsumer {
    pub fn new(
        ring: Arc<RingBuffer>,
        shared: Arc<SessionShared>,
        pacer: Pacer,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ring,
            shared,
            pacer,
            cancel,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            stop_when_drained: false,
            diagnostics: Diagnostics::new(DiagnosticsConfig::default()),
        }
    }

    /// End `run` once the producer has stopped for good and the backlog is empty
    pub fn stop_when_drained(mut self, enabled: bool) -> Self {
        self.stop_when_drained = enabled;
        self
    }

    pub fn with_poll_timeout(mut self, timeout_ms: u64) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    /// Sample read packets into the log with `config`
    pub fn with_diagnostics(mut self, config: DiagnosticsConfig) -> Self {
        self.diagnostics = Diagnostics::new(config);
        self
    }

    /// Token that ends this consumer's waits and loop
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Copy the next committed packet into `dst`
    ///
    /// `Timeout` means nothing arrived in time and is worth retrying;
    /// `NotConnected` and `DataIncomplete` are terminal.
    pub fn read_next(&self, dst: &mut [u8], timeout_ms: u64) -> StreamResult<PacketDescriptor> {
        if !self.shared.is_connected() {
            return Err(StreamError::NotConnected);
        }

        match self.ring.try_read_cancellable(
            dst,
            Duration::from_millis(timeout_ms),
            Some(&self.cancel),
        ) {
            Ok(descriptor) => {
                let read_index = self.ring.released_count().saturating_sub(1);
                self.diagnostics.read(
                    read_index,
                    &descriptor,
                    &dst[..descriptor.size],
                    self.ring.pending_count(),
                );
                Ok(descriptor)
            }
            Err(e @ StreamError::DataIncomplete { .. }) => {
                self.shared.set_last_error(e.to_string());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Read packets into `sink` until cancelled, disconnected or drained
    pub fn run<S: PacketSink>(&self, sink: &mut S) -> StreamResult<ConsumerSummary> {
        let mut buffer = vec![0u8; self.ring.last_package_size()];
        let mut packets = 0u64;
        let mut bytes = 0u64;

        log::info!("Consumer loop started for session {}", self.shared.id());

        let stop = loop {
            if self.cancel.is_cancelled() {
                break ConsumerStop::Cancelled;
            }

            match self.read_next(&mut buffer, self.poll_timeout_ms) {
                Ok(descriptor) => {
                    sink.accept(&descriptor, &buffer[..descriptor.size])?;
                    packets += 1;
                    bytes += descriptor.size as u64;
                }
                Err(StreamError::BufferTooSmall { needed, .. }) => {
                    buffer.resize(needed, 0);
                    continue;
                }
                Err(StreamError::NotConnected) => break ConsumerStop::Disconnected,
                Err(e) if e.is_retryable() => {
                    if self.stop_when_drained && self.producer_drained() {
                        break ConsumerStop::Drained;
                    }
                }
                Err(e) => {
                    log::error!("Consumer loop failed: {}", e);
                    return Err(e);
                }
            }

            if !self.pacer.wait(&self.cancel) {
                break ConsumerStop::Cancelled;
            }
        };

        log::info!(
            "Consumer loop ended ({:?}) after {} packets, {} bytes",
            stop,
            packets,
            bytes
        );
        Ok(ConsumerSummary {
            packets,
            bytes,
            stop,
        })
    }

    /// A producer stopped on backpressure is waiting for this consumer, so it does not count
    fn producer_drained(&self) -> bool {
        // state first: a halted producer commits nothing more
        let halted = matches!(
            self.shared.state(),
            StreamState::Stopped {
                reason: StopReason::Requested
            } | StreamState::Failed { .. }
        );
        halted && self.ring.pending_count() == 0
    }
}
