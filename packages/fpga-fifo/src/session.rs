// Session controller - owns one streaming session end to end
//
// The session manages:
// - The ring buffer, allocated once at construction
// - Transport lifecycle (connect, disconnect)
// - The initiation handshake (prepare)
// - The producer, stepped inline or moved onto its own thread
// - Consumer handles for draining packets
// - Event emission to an optional observer
// - Cancellation via CancellationToken for cooperative shutdown

use crate::config::SessionConfig;
use crate::consumer::StreamConsumer;
use crate::error::{StreamError, StreamResult};
use crate::pacing::Pacer;
use crate::producer::{StepOutcome, StreamProducer};
use crate::ring::RingBuffer;
use crate::transport::TransportDriver;
use crate::types::{EventCallback, StopReason, StreamEvent, StreamState, StreamStats};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Name of the thread started by `Session::start_streaming`
pub const PRODUCER_THREAD_NAME: &str = "fpga-fifo-producer";

/// Status shared by the session, its producer and its consumers
pub struct SessionShared {
    id: String,
    state: RwLock<StreamState>,
    last_error: RwLock<Option<String>>,
    connected: AtomicBool,

    send_count: AtomicU64,
    recv_count: AtomicU64,
    bytes_received: AtomicU64,
    last_loop_micros: AtomicU64,
    started_at: RwLock<Option<DateTime<Utc>>>,

    event_callback: Option<EventCallback>,
}

impl SessionShared {
    pub fn new(id: String, event_callback: Option<EventCallback>) -> Self {
        Self {
            id,
            state: RwLock::new(StreamState::Idle),
            last_error: RwLock::new(None),
            connected: AtomicBool::new(false),
            send_count: AtomicU64::new(0),
            recv_count: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_loop_micros: AtomicU64::new(0),
            started_at: RwLock::new(None),
            event_callback,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(callback) = self.event_callback.as_ref() {
            callback(event);
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.read().clone()
    }

    pub fn set_state(&self, state: StreamState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        if state.is_streaming() {
            self.started_at.write().get_or_insert_with(Utc::now);
        }
        log::debug!("Session {} state: {:?}", self.id, state);
        self.emit(StreamEvent::StateChanged {
            session_id: self.id.clone(),
            state,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn set_last_error(&self, message: String) {
        log::error!("Session {}: {}", self.id, message);
        *self.last_error.write() = Some(message);
    }

    /// Record `error` and move to `Failed`
    pub fn fail(&self, error: &StreamError) {
        let message = error.to_string();
        self.set_last_error(message.clone());
        self.emit(StreamEvent::Error {
            session_id: self.id.clone(),
            error: message.clone(),
        });
        self.set_state(StreamState::Failed { message });
    }

    pub fn count_send(&self) {
        self.send_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_recv(&self) {
        self.recv_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_last_loop_micros(&self, micros: u64) {
        self.last_loop_micros.store(micros, Ordering::Relaxed);
    }

    fn reset_counters(&self) {
        self.send_count.store(0, Ordering::Relaxed);
        self.recv_count.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.last_loop_micros.store(0, Ordering::Relaxed);
        *self.started_at.write() = None;
    }

    pub fn stats(&self, ring: &RingBuffer) -> StreamStats {
        StreamStats {
            packets_received: ring.committed_count(),
            packets_read: ring.released_count(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            wraparounds: ring.wraparounds(),
            backlog: ring.pending_count(),
            peak_backlog: ring.peak_pending(),
            write_position: ring.write_position(),
            read_position: ring.read_position(),
            last_loop_micros: self.last_loop_micros.load(Ordering::Relaxed),
            send_count: self.send_count.load(Ordering::Relaxed),
            recv_count: self.recv_count.load(Ordering::Relaxed),
            started_at: *self.started_at.read(),
        }
    }
}

type ProducerThread = JoinHandle<(StreamProducer, StreamResult<StopReason>)>;

/// Main session controller
pub struct Session {
    config: SessionConfig,
    ring: Arc<RingBuffer>,
    shared: Arc<SessionShared>,

    // Present while connected and not lent to the producer thread
    producer: Option<StreamProducer>,
    worker: Option<ProducerThread>,
    requested_word_count: Option<u32>,

    // Producer loops and consumer handles are cancelled independently
    producer_token: CancellationToken,
    consumer_token: CancellationToken,
    reader: StreamConsumer,
}

impl Session {
    /// Allocate the ring buffer and create an idle, disconnected session
    pub fn new(config: SessionConfig, event_callback: Option<EventCallback>) -> StreamResult<Self> {
        config.validate()?;
        let ring = Arc::new(RingBuffer::new(config.ring_capacity, config.max_pending)?);
        let shared = Arc::new(SessionShared::new(
            uuid::Uuid::new_v4().to_string(),
            event_callback,
        ));
        let consumer_token = CancellationToken::new();
        let reader = Self::make_consumer(&config, &ring, &shared, consumer_token.child_token());

        log::info!("Created session {}", shared.id());

        Ok(Self {
            config,
            ring,
            shared,
            producer: None,
            worker: None,
            requested_word_count: None,
            producer_token: CancellationToken::new(),
            consumer_token,
            reader,
        })
    }

    fn make_consumer(
        config: &SessionConfig,
        ring: &Arc<RingBuffer>,
        shared: &Arc<SessionShared>,
        token: CancellationToken,
    ) -> StreamConsumer {
        StreamConsumer::new(
            Arc::clone(ring),
            Arc::clone(shared),
            Pacer::new(config.pacing_mode, config.pacing()),
            token,
        )
        .with_diagnostics(config.diagnostics.clone())
    }

    pub fn id(&self) -> &str {
        self.shared.id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open the configured device channel
    pub fn connect(&mut self, driver: &dyn TransportDriver) -> StreamResult<()> {
        if self.shared.is_connected() {
            return Err(StreamError::AlreadyConnected);
        }

        log::info!(
            "Connecting session {} to device {} channel {} ({} devices present)",
            self.id(),
            self.config.device_id,
            self.config.channel,
            driver.list_devices()
        );

        let channel = match driver.open(self.config.device_id, self.config.channel) {
            Ok(channel) => channel,
            Err(e) => {
                self.shared.set_last_error(e.to_string());
                return Err(e);
            }
        };

        self.producer = Some(StreamProducer::new(
            channel,
            Arc::clone(&self.ring),
            Arc::clone(&self.shared),
            self.config.clone(),
        ));
        self.shared.set_connected(true);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Negotiate packets of `value * 6` words with the hardware
    pub fn prepare(&mut self, value: u32) -> StreamResult<()> {
        let producer = self.idle_producer()?;
        producer.prepare(value)?;
        self.requested_word_count = Some(value);
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.requested_word_count.is_some() && self.shared.state().can_stream()
    }

    pub fn requested_word_count(&self) -> Option<u32> {
        self.requested_word_count
    }

    /// Run one producer iteration on the calling thread
    pub fn run_producer_step(&mut self) -> StreamResult<StepOutcome> {
        let token = self.producer_token.clone();
        self.idle_producer()?.step(&token)
    }

    /// Run the producer loop on the calling thread until stopped
    ///
    /// Cancel it from elsewhere through `producer_token()`.
    pub fn run_producer_loop(&mut self) -> StreamResult<StopReason> {
        if self.producer_token.is_cancelled() {
            self.producer_token = CancellationToken::new();
        }
        let token = self.producer_token.clone();
        self.idle_producer()?.run(&token)
    }

    pub fn producer_token(&self) -> CancellationToken {
        self.producer_token.clone()
    }

    /// Move the producer loop onto its own thread
    pub fn start_streaming(&mut self) -> StreamResult<()> {
        if !self.shared.state().can_stream() {
            return Err(StreamError::NotPrepared);
        }
        let mut producer = self.idle_producer_owned()?;

        if self.producer_token.is_cancelled() {
            self.producer_token = CancellationToken::new();
        }
        let token = self.producer_token.clone();

        let handle = std::thread::Builder::new()
            .name(PRODUCER_THREAD_NAME.to_string())
            .spawn(move || {
                let result = producer.run(&token);
                (producer, result)
            });

        match handle {
            Ok(handle) => {
                log::info!("Started producer thread for session {}", self.id());
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                // the producer and its channel went down with the closure
                self.shared.set_connected(false);
                self.shared.set_last_error(format!("failed to spawn producer thread: {}", e));
                Err(StreamError::Io(e))
            }
        }
    }

    /// Whether a producer thread is still running
    pub fn is_streaming(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Stop the producer, joining its thread if one was started
    ///
    /// Returns how the loop ended, or `None` if no thread was running.
    pub fn stop(&mut self) -> Option<StreamResult<StopReason>> {
        self.producer_token.cancel();

        let outcome = match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok((producer, result)) => {
                    self.producer = Some(producer);
                    Some(result)
                }
                Err(_) => {
                    let error = StreamError::ProducerPanicked;
                    self.shared.fail(&error);
                    self.shared.set_connected(false);
                    Some(Err(error))
                }
            },
            None => None,
        };

        if self.shared.state().is_streaming() {
            self.shared.set_state(StreamState::Stopped {
                reason: StopReason::Requested,
            });
        }
        self.producer_token = CancellationToken::new();

        log::info!("Stopped producer for session {}", self.id());
        outcome
    }

    /// Stop everything, release the transport and reset the ring
    pub fn disconnect(&mut self) {
        if !self.shared.is_connected() && self.producer.is_none() && self.worker.is_none() {
            return;
        }

        self.stop();
        self.shared.set_connected(false);
        self.consumer_token.cancel();

        if let Some(mut producer) = self.producer.take() {
            producer.close();
        }

        self.ring.reset();
        self.shared.reset_counters();
        self.requested_word_count = None;
        self.shared.set_state(StreamState::Idle);

        self.consumer_token = CancellationToken::new();
        self.reader = Self::make_consumer(
            &self.config,
            &self.ring,
            &self.shared,
            self.consumer_token.child_token(),
        );

        log::info!("Disconnected session {}", self.id());
    }

    /// Copy the next committed packet into `buffer`
    pub fn read_packet(&self, buffer: &mut [u8], timeout_ms: u64) -> StreamResult<usize> {
        self.reader
            .read_next(buffer, timeout_ms)
            .map(|descriptor| descriptor.size)
    }

    /// A consumer handle that can be moved to another thread
    ///
    /// It stops on its own token, on `disconnect`, or when the session drops.
    pub fn consumer(&self) -> StreamConsumer {
        Self::make_consumer(
            &self.config,
            &self.ring,
            &self.shared,
            self.consumer_token.child_token(),
        )
    }

    pub fn backlog_count(&self) -> usize {
        self.ring.pending_count()
    }

    pub fn write_position(&self) -> usize {
        self.ring.write_position()
    }

    pub fn read_position(&self) -> usize {
        self.ring.read_position()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.stats(&self.ring)
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    fn idle_producer(&mut self) -> StreamResult<&mut StreamProducer> {
        if self.worker.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        if !self.shared.is_connected() {
            return Err(StreamError::NotConnected);
        }
        self.producer.as_mut().ok_or(StreamError::NotConnected)
    }

    fn idle_producer_owned(&mut self) -> StreamResult<StreamProducer> {
        self.idle_producer()?;
        self.producer.take().ok_or(StreamError::NotConnected)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.producer_token.cancel();
        self.consumer_token.cancel();
        if let Some(worker) = self.worker.take() {
            if let Ok((mut producer, _)) = worker.join() {
                producer.close();
            }
        }
        if let Some(mut producer) = self.producer.take() {
            producer.close();
        }
        self.shared.set_connected(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedDriver, SimulatorConfig};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn test_config() -> SessionConfig {
        SessionConfig {
            ring_capacity: 64 * 1024,
            max_pending: 64,
            recv_timeout_ms: 20,
            pacing_us: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = Session::new(test_config(), None).unwrap();
        assert_eq!(session.state(), StreamState::Idle);
        assert!(!session.is_connected());
        assert_eq!(session.backlog_count(), 0);
        assert!(session.last_error().is_none());
    }

    #[test]
    fn test_operations_require_connection() {
        let mut session = Session::new(test_config(), None).unwrap();
        assert!(matches!(session.prepare(4), Err(StreamError::NotConnected)));
        assert!(matches!(
            session.run_producer_step(),
            Err(StreamError::NotConnected)
        ));
        let mut buffer = vec![0u8; 96];
        assert!(matches!(
            session.read_packet(&mut buffer, 5),
            Err(StreamError::NotConnected)
        ));
    }

    #[test]
    fn test_connect_twice() {
        let driver = SimulatedDriver::default();
        let mut session = Session::new(test_config(), None).unwrap();
        session.connect(&driver).unwrap();
        assert!(matches!(
            session.connect(&driver),
            Err(StreamError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_connect_unknown_device_records_error() {
        let driver = SimulatedDriver::default();
        let mut config = test_config();
        config.device_id = 3;
        let mut session = Session::new(config, None).unwrap();
        assert!(matches!(
            session.connect(&driver),
            Err(StreamError::OpenFailed(_))
        ));
        assert!(session.last_error().is_some());
        assert!(!session.is_connected());
    }

    #[test]
    fn test_step_and_read() {
        let driver = SimulatedDriver::default();
        let mut session = Session::new(test_config(), None).unwrap();
        session.connect(&driver).unwrap();
        session.prepare(4).unwrap();
        assert!(session.is_prepared());

        session.run_producer_step().unwrap();
        session.run_producer_step().unwrap();
        assert_eq!(session.backlog_count(), 2);
        assert_eq!(session.write_position(), 192);

        let mut buffer = vec![0u8; 96];
        assert_eq!(session.read_packet(&mut buffer, 10).unwrap(), 96);
        assert_eq!(session.read_position(), 96);
        assert_eq!(session.backlog_count(), 1);

        let stats = session.stats();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.packets_read, 1);
        assert_eq!(stats.bytes_received, 192);
        assert!(stats.started_at.is_some());
    }

    #[test]
    fn test_disconnect_resets_ring() {
        let driver = SimulatedDriver::default();
        let mut session = Session::new(test_config(), None).unwrap();
        session.connect(&driver).unwrap();
        session.prepare(1).unwrap();
        session.run_producer_step().unwrap();

        session.disconnect();
        assert!(!session.is_connected());
        assert_eq!(session.state(), StreamState::Idle);
        assert_eq!(session.write_position(), 0);
        assert_eq!(session.backlog_count(), 0);
        assert!(session.requested_word_count().is_none());

        // reconnecting starts a fresh handshake
        session.connect(&driver).unwrap();
        assert!(matches!(
            session.run_producer_step(),
            Err(StreamError::NotPrepared)
        ));
    }

    #[test]
    fn test_events_reach_observer() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: EventCallback = Arc::new(move |event: StreamEvent| sink.lock().push(event));

        let driver = SimulatedDriver::default();
        let mut session = Session::new(test_config(), Some(callback)).unwrap();
        session.connect(&driver).unwrap();
        session.prepare(2).unwrap();
        session.run_producer_step().unwrap();

        let events = events.lock();
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::StateChanged {
                state: StreamState::Prepared,
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::PacketCommitted { sequence: 0, .. })));
    }

    #[test]
    fn test_start_and_stop_thread() {
        let driver = SimulatedDriver::new(SimulatorConfig {
            receive_latency: Some(Duration::from_millis(1)),
            ..Default::default()
        });
        let mut config = test_config();
        config.max_pending = 10_000;
        config.ring_capacity = 10 * 1024 * 1024;
        let mut session = Session::new(config, None).unwrap();
        session.connect(&driver).unwrap();
        session.prepare(1).unwrap();

        session.start_streaming().unwrap();
        assert!(matches!(session.prepare(1), Err(StreamError::AlreadyRunning)));
        std::thread::sleep(Duration::from_millis(30));

        let outcome = session.stop().unwrap();
        assert_eq!(outcome.unwrap(), StopReason::Requested);
        assert!(!session.is_streaming());
        assert!(session.backlog_count() > 0);
        assert_eq!(
            session.state(),
            StreamState::Stopped {
                reason: StopReason::Requested
            }
        );

        // the producer came back and can step again
        assert!(session.run_producer_step().is_ok());
    }

    #[test]
    fn test_start_streaming_requires_prepare() {
        let driver = SimulatedDriver::default();
        let mut session = Session::new(test_config(), None).unwrap();
        session.connect(&driver).unwrap();
        assert!(matches!(
            session.start_streaming(),
            Err(StreamError::NotPrepared)
        ));
    }
}
