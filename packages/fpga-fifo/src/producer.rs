// Producer side of the stream: drives the hardware loop
//
// Each iteration reserves a slot in the ring, receives one packet straight
// into it, commits it for the consumer, and immediately sends the continue
// command so the FPGA never stalls waiting for the host. Cancellation is
// only observed before a slot is reserved: once a packet is committed its
// continue command always goes out. Transport failures are never retried
// here: the producer halts and records the error.

use crate::config::SessionConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{StreamError, StreamResult};
use crate::pacing::{self, Pacer};
use crate::ring::RingBuffer;
use crate::session::SessionShared;
use crate::transport::TransportChannel;
use crate::types::{PacketDescriptor, StopReason, StreamEvent, StreamState};
use crate::validation::{create_validator, AcceptAll, PacketValidator, ValidationPolicy};
use crate::wire::{self, PacketLayout, CONTINUE_COMMAND};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one producer iteration that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Packet(PacketDescriptor),
    /// Cancellation was observed before a slot was reserved
    Cancelled,
}

pub struct StreamProducer {
    channel: Box<dyn TransportChannel>,
    ring: Arc<RingBuffer>,
    shared: Arc<SessionShared>,
    config: SessionConfig,
    layout: Option<PacketLayout>,
    validator: Box<dyn PacketValidator>,
    diagnostics: Diagnostics,
    pacer: Pacer,
    iteration: u64,
}

impl StreamProducer {
    pub fn new(
        channel: Box<dyn TransportChannel>,
        ring: Arc<RingBuffer>,
        shared: Arc<SessionShared>,
        config: SessionConfig,
    ) -> Self {
        let diagnostics = Diagnostics::new(config.diagnostics.clone());
        let pacer = Pacer::new(config.pacing_mode, config.pacing());
        Self {
            channel,
            ring,
            shared,
            config,
            layout: None,
            validator: Box::new(AcceptAll),
            diagnostics,
            pacer,
            iteration: 0,
        }
    }

    /// Packet geometry negotiated by the last successful `prepare`
    pub fn layout(&self) -> Option<PacketLayout> {
        self.layout
    }

    pub fn requested_word_count(&self) -> Option<u32> {
        self.layout.map(|layout| layout.requested_word_count)
    }

    /// Send the initiation command for `value` and move to `Prepared`
    pub fn prepare(&mut self, value: u32) -> StreamResult<()> {
        if value == 0 {
            return Err(StreamError::InvalidConfig(
                "requested word count must be greater than zero".to_string(),
            ));
        }

        let layout = self.config.packet_layout(value);
        if layout.bytes() > self.ring.capacity() {
            return Err(StreamError::InvalidConfig(format!(
                "packet of {} bytes does not fit a ring of {} bytes",
                layout.bytes(),
                self.ring.capacity()
            )));
        }

        let command = wire::init_command(value);
        log::info!(
            "Sending initiation command for value {}: {}",
            value,
            wire::format_words(&command)
        );

        let sent = self
            .channel
            .send(&command, 0, true, self.config.send_timeout());
        self.shared.count_send();
        if sent == 0 {
            return Err(self.fail(StreamError::SendFailed(format!(
                "initiation command for value {} not accepted",
                value
            ))));
        }

        self.layout = Some(layout);
        self.validator = create_validator(&self.config.validation, value);
        self.iteration = 0;

        log::info!(
            "Prepared stream: {} words ({} bytes) per packet",
            layout.words(),
            layout.bytes()
        );
        self.shared.set_state(StreamState::Prepared);
        Ok(())
    }

    /// Run one iteration of the hardware loop
    pub fn step(&mut self, cancel: &CancellationToken) -> StreamResult<StepOutcome> {
        if !self.shared.is_connected() {
            return Err(StreamError::NotConnected);
        }
        let layout = match self.layout {
            Some(layout) if self.shared.state().can_stream() => layout,
            _ => return Err(StreamError::NotPrepared),
        };

        let started = Instant::now();
        if !self.shared.state().is_streaming() {
            self.shared.set_state(StreamState::Streaming);
        }

        if cancel.is_cancelled() {
            return Ok(StepOutcome::Cancelled);
        }

        let slot = match self.ring.reserve_write_slot(layout.bytes()) {
            Ok(slot) => slot,
            Err(e) if e.is_backpressure() => return Err(self.halt_on_backlog(e)),
            Err(e) => return Err(self.fail(e)),
        };

        let iteration = self.iteration;
        let recv_timeout = self.config.recv_timeout();
        let check_words = self.config.validation != ValidationPolicy::AcceptAll;
        let channel = &mut self.channel;
        let validator = &mut self.validator;
        let diagnostics = &self.diagnostics;

        let (received, verdict) = self.ring.fill_slot(slot, |bytes| {
            let received = channel.receive(bytes, recv_timeout);
            if received == 0 {
                return (0, Ok(()));
            }
            diagnostics.packet(iteration, bytes);
            let verdict = if check_words {
                validator.accept(&wire::words_from_le_bytes(bytes))
            } else {
                Ok(())
            };
            (received, verdict)
        })?;
        self.shared.count_recv();

        if received == 0 {
            return Err(self.fail(StreamError::RecvFailed(format!(
                "no words received within {} ms",
                self.config.recv_timeout_ms
            ))));
        }
        if received < layout.words() {
            return Err(self.fail(StreamError::RecvFailed(format!(
                "short transfer: {} of {} words",
                received,
                layout.words()
            ))));
        }
        if let Err(reason) = verdict {
            return Err(self.fail(StreamError::PacketRejected(reason)));
        }

        let descriptor = match self.ring.commit_write(slot.offset, slot.size) {
            Ok(descriptor) => descriptor,
            Err(e) if e.is_backpressure() => return Err(self.halt_on_backlog(e)),
            Err(e) => return Err(self.fail(e)),
        };
        self.shared.add_bytes_received(descriptor.size as u64);
        self.shared.emit(StreamEvent::PacketCommitted {
            session_id: self.shared.id().to_string(),
            sequence: descriptor.sequence,
            offset: descriptor.offset,
            size: descriptor.size,
            wrapped: slot.wrapped,
        });

        pacing::hold(self.config.pacing_mode, self.config.continue_holdoff());
        self.send_continue()?;

        let loop_micros = started.elapsed().as_micros() as u64;
        self.shared.set_last_loop_micros(loop_micros);
        self.diagnostics.status(iteration, &self.ring, loop_micros);
        if self.diagnostics.enabled_for(iteration) {
            self.shared.emit(StreamEvent::StatsUpdate {
                session_id: self.shared.id().to_string(),
                stats: self.shared.stats(&self.ring),
            });
        }
        self.iteration += 1;

        Ok(StepOutcome::Packet(descriptor))
    }

    /// Step until cancelled, halted by backpressure, or failed
    pub fn run(&mut self, cancel: &CancellationToken) -> StreamResult<StopReason> {
        log::info!("Producer loop started for session {}", self.shared.id());

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.step(cancel) {
                Ok(StepOutcome::Packet(_)) => {}
                Ok(StepOutcome::Cancelled) => break,
                Err(e) if e.is_backpressure() => {
                    log::info!("Producer loop stopped on backlog overflow");
                    return Ok(StopReason::BacklogOverflow);
                }
                Err(e) => {
                    log::error!("Producer loop failed: {}", e);
                    return Err(e);
                }
            }
            if !self.pacer.wait(cancel) {
                break;
            }
        }

        log::info!(
            "Producer loop stopped on request after {} packets",
            self.iteration
        );
        self.shared.set_state(StreamState::Stopped {
            reason: StopReason::Requested,
        });
        Ok(StopReason::Requested)
    }

    /// Release the transport channel
    pub fn close(&mut self) {
        self.channel.close();
        self.layout = None;
    }

    fn send_continue(&mut self) -> StreamResult<()> {
        let sent = self
            .channel
            .send(&CONTINUE_COMMAND, 0, true, self.config.send_timeout());
        self.shared.count_send();
        if sent == 0 {
            // the committed packet stays readable
            return Err(self.fail(StreamError::SendFailed(
                "continue command not accepted".to_string(),
            )));
        }
        Ok(())
    }

    fn halt_on_backlog(&self, error: StreamError) -> StreamError {
        if let StreamError::BacklogOverflow { pending, max } = &error {
            log::warn!(
                "Backlog full ({} of {} packets unread), stopping producer",
                pending,
                max
            );
            self.shared.emit(StreamEvent::BacklogOverflow {
                session_id: self.shared.id().to_string(),
                pending: *pending,
            });
        }
        self.shared.set_last_error(error.to_string());
        self.shared.set_state(StreamState::Stopped {
            reason: StopReason::BacklogOverflow,
        });
        error
    }

    fn fail(&self, error: StreamError) -> StreamError {
        self.shared.fail(&error);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedDriver, SimulatorConfig, TransportDriver};

    fn producer_with(
        sim: SimulatorConfig,
        config: SessionConfig,
    ) -> (StreamProducer, Arc<RingBuffer>, Arc<SessionShared>) {
        let ring = Arc::new(RingBuffer::new(config.ring_capacity, config.max_pending).unwrap());
        let shared = Arc::new(SessionShared::new("test".to_string(), None));
        shared.set_connected(true);
        let channel = SimulatedDriver::new(sim).open(0, 0).unwrap();
        let producer = StreamProducer::new(channel, Arc::clone(&ring), Arc::clone(&shared), config);
        (producer, ring, shared)
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            ring_capacity: 4096,
            max_pending: 16,
            recv_timeout_ms: 20,
            pacing_us: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_step_requires_prepare() {
        let (mut producer, _, _) = producer_with(SimulatorConfig::default(), small_config());
        let token = CancellationToken::new();
        assert!(matches!(producer.step(&token), Err(StreamError::NotPrepared)));
    }

    #[test]
    fn test_prepare_rejects_zero_and_oversized() {
        let (mut producer, _, shared) = producer_with(SimulatorConfig::default(), small_config());
        assert!(matches!(producer.prepare(0), Err(StreamError::InvalidConfig(_))));
        // 200 * 24 bytes does not fit 4096
        assert!(producer.prepare(200).is_err());
        assert_eq!(shared.state(), StreamState::Idle);
    }

    #[test]
    fn test_steps_commit_packets() {
        let (mut producer, ring, shared) = producer_with(SimulatorConfig::default(), small_config());
        let token = CancellationToken::new();
        producer.prepare(2).unwrap();
        assert_eq!(shared.state(), StreamState::Prepared);

        for expected in 0..3u64 {
            match producer.step(&token).unwrap() {
                StepOutcome::Packet(desc) => {
                    assert_eq!(desc.sequence, expected);
                    assert_eq!(desc.size, 48);
                    assert_eq!(desc.offset, expected as usize * 48);
                }
                StepOutcome::Cancelled => panic!("not cancelled"),
            }
        }
        assert_eq!(shared.state(), StreamState::Streaming);
        assert_eq!(ring.pending_count(), 3);
        // init + 3 continues
        assert_eq!(shared.stats(&ring).send_count, 4);
    }

    #[test]
    fn test_recv_failure_marks_failed() {
        let (mut producer, ring, shared) = producer_with(
            SimulatorConfig {
                fail_recv_after: Some(1),
                ..Default::default()
            },
            small_config(),
        );
        let token = CancellationToken::new();
        producer.prepare(1).unwrap();
        producer.step(&token).unwrap();

        let err = producer.step(&token).unwrap_err();
        assert!(matches!(err, StreamError::RecvFailed(_)));
        assert!(matches!(shared.state(), StreamState::Failed { .. }));
        assert!(shared.last_error().is_some());
        // the first packet is still there for the consumer
        assert_eq!(ring.pending_count(), 1);
        assert!(matches!(producer.step(&token), Err(StreamError::NotPrepared)));
    }

    #[test]
    fn test_send_failure_keeps_packet() {
        let (mut producer, ring, shared) = producer_with(
            SimulatorConfig {
                fail_send_after: Some(1),
                ..Default::default()
            },
            small_config(),
        );
        let token = CancellationToken::new();
        producer.prepare(1).unwrap();

        let err = producer.step(&token).unwrap_err();
        assert!(matches!(err, StreamError::SendFailed(_)));
        assert!(matches!(shared.state(), StreamState::Failed { .. }));
        assert_eq!(ring.pending_count(), 1);
    }

    #[test]
    fn test_backlog_stops_without_failing() {
        let mut config = small_config();
        config.max_pending = 2;
        let (mut producer, ring, shared) = producer_with(SimulatorConfig::default(), config);
        let token = CancellationToken::new();
        producer.prepare(1).unwrap();

        producer.step(&token).unwrap();
        producer.step(&token).unwrap();
        let err = producer.step(&token).unwrap_err();
        assert!(err.is_backpressure());
        assert_eq!(
            shared.state(),
            StreamState::Stopped {
                reason: StopReason::BacklogOverflow
            }
        );

        // draining one packet lets the producer resume
        let mut out = vec![0u8; 24];
        ring.try_read(&mut out, std::time::Duration::from_millis(10))
            .unwrap();
        assert!(matches!(producer.step(&token), Ok(StepOutcome::Packet(_))));
        assert_eq!(shared.state(), StreamState::Streaming);
    }

    #[test]
    fn test_sequence_validation_rejects_corrupt_packet() {
        let mut config = small_config();
        config.validation = ValidationPolicy::sequence_field();
        let (mut producer, ring, shared) = producer_with(
            SimulatorConfig {
                corrupt_sequence_at: Some(2),
                ..Default::default()
            },
            config,
        );
        let token = CancellationToken::new();
        producer.prepare(3).unwrap();

        producer.step(&token).unwrap();
        producer.step(&token).unwrap();
        let err = producer.step(&token).unwrap_err();
        assert!(matches!(err, StreamError::PacketRejected(_)));
        assert!(matches!(shared.state(), StreamState::Failed { .. }));
        assert_eq!(ring.pending_count(), 2);
    }

    #[test]
    fn test_run_stops_on_cancel() {
        let (mut producer, _, shared) = producer_with(SimulatorConfig::default(), small_config());
        let token = CancellationToken::new();
        producer.prepare(1).unwrap();
        token.cancel();

        assert_eq!(producer.run(&token).unwrap(), StopReason::Requested);
        assert_eq!(
            shared.state(),
            StreamState::Stopped {
                reason: StopReason::Requested
            }
        );
    }

    #[test]
    fn test_run_halts_on_backlog() {
        let mut config = small_config();
        config.max_pending = 4;
        let (mut producer, ring, _) = producer_with(SimulatorConfig::default(), config);
        let token = CancellationToken::new();
        producer.prepare(1).unwrap();

        assert_eq!(producer.run(&token).unwrap(), StopReason::BacklogOverflow);
        assert_eq!(ring.pending_count(), 4);
    }

    #[test]
    fn test_step_without_connection() {
        let (mut producer, _, shared) = producer_with(SimulatorConfig::default(), small_config());
        producer.prepare(1).unwrap();
        shared.set_connected(false);
        assert!(matches!(
            producer.step(&CancellationToken::new()),
            Err(StreamError::NotConnected)
        ));
    }
}
