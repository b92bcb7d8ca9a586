//! Threaded producer/consumer tests over the simulated FPGA

use fpga_fifo::transport::sim::{SEQUENCE_ROLLOVER, SEQUENCE_WORD};
use fpga_fifo::wire::words_from_le_bytes;
use fpga_fifo::{
    ConsumerStop, EventCallback, PacketDescriptor, Session, SessionConfig, SimulatedDriver,
    SimulatorConfig, StopReason, StreamError, StreamEvent, StreamResult, StreamState,
    ValidationPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(capacity: usize, max_pending: usize) -> SessionConfig {
    SessionConfig {
        ring_capacity: capacity,
        max_pending,
        recv_timeout_ms: 50,
        pacing_us: 10,
        ..Default::default()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn prepared_session(
    config: SessionConfig,
    driver: &SimulatedDriver,
    value: u32,
) -> Session {
    let mut session = Session::new(config, None).unwrap();
    session.connect(driver).unwrap();
    session.prepare(value).unwrap();
    session
}

/// First word of a packet is the simulator's delivery index
fn packet_index(data: &[u8]) -> u32 {
    words_from_le_bytes(data)[0]
}

// ============================================================================
// Full pipeline
// ============================================================================

#[test]
fn test_threaded_stream_delivers_every_packet_in_order() {
    init_logging();
    let driver = SimulatedDriver::default();
    let mut cfg = config(4096, 16);
    cfg.validation = ValidationPolicy::sequence_field();
    // 2 * 6 words * 4 bytes = 48 bytes; 4096 is not a multiple, so the ring pads and wraps
    let mut session = prepared_session(cfg, &driver, 2);

    let consumer = session.consumer().stop_when_drained(true).with_poll_timeout(20);
    let reader = thread::spawn(move || {
        let mut packets: Vec<(u64, u32, u32)> = Vec::new();
        let mut sink = |desc: &PacketDescriptor, data: &[u8]| -> StreamResult<()> {
            let words = words_from_le_bytes(data);
            packets.push((desc.sequence, words[0], words[SEQUENCE_WORD]));
            Ok(())
        };
        let summary = consumer.run(&mut sink).unwrap();
        (summary, packets)
    });

    session.start_streaming().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while session.stats().packets_read < 500 {
        assert!(Instant::now() < deadline, "stream stalled: {:?}", session.stats());
        if !session.is_streaming() {
            // halted on backpressure; the consumer catches up, then we resume
            assert!(matches!(session.stop(), Some(Ok(StopReason::BacklogOverflow))));
            session.start_streaming().unwrap();
        }
        thread::sleep(Duration::from_millis(1));
    }
    let outcome = session.stop().unwrap();
    assert!(outcome.is_ok());

    let (summary, packets) = reader.join().unwrap();
    assert_eq!(summary.stop, ConsumerStop::Drained);
    assert_eq!(summary.packets as usize, packets.len());
    assert!(packets.len() >= 500);

    let mut expected_sequence = 0u32;
    for (i, (sequence, index, hw_sequence)) in packets.iter().enumerate() {
        assert_eq!(*sequence, i as u64);
        assert_eq!(*index, i as u32);
        assert_eq!(*hw_sequence, expected_sequence);
        expected_sequence += 2;
        if expected_sequence >= SEQUENCE_ROLLOVER {
            expected_sequence = expected_sequence + 2 - SEQUENCE_ROLLOVER;
        }
    }

    let stats = session.stats();
    assert_eq!(stats.backlog, 0);
    assert!(stats.wraparounds > 0);
    assert_eq!(stats.packets_received, stats.packets_read);
    assert_eq!(stats.bytes_received, stats.packets_received * 48);
}

#[test]
fn test_observer_sees_lifecycle() {
    init_logging();
    let committed = Arc::new(AtomicUsize::new(0));
    let states = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let committed_events = Arc::clone(&committed);
    let state_events = Arc::clone(&states);
    let callback: EventCallback = Arc::new(move |event: StreamEvent| match event {
        StreamEvent::PacketCommitted { .. } => {
            committed_events.fetch_add(1, Ordering::Relaxed);
        }
        StreamEvent::StateChanged { state, .. } => state_events.lock().push(state),
        _ => {}
    });

    let driver = SimulatedDriver::default();
    let mut session = Session::new(config(64 * 1024, 8), Some(callback)).unwrap();
    session.connect(&driver).unwrap();
    session.prepare(1).unwrap();
    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_streaming()));
    session.stop();

    assert_eq!(committed.load(Ordering::Relaxed), 8);
    let states = states.lock();
    assert_eq!(
        *states,
        vec![
            StreamState::Prepared,
            StreamState::Streaming,
            StreamState::Stopped {
                reason: StopReason::BacklogOverflow
            },
        ]
    );
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_backlog_overflow_stops_and_resumes_without_loss() {
    init_logging();
    let driver = SimulatedDriver::default();
    let mut session = prepared_session(config(64 * 1024, 8), &driver, 1);

    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_streaming()));

    match session.stop() {
        Some(Ok(reason)) => assert_eq!(reason, StopReason::BacklogOverflow),
        other => panic!("unexpected producer outcome: {:?}", other.map(|r| r.is_ok())),
    }
    assert_eq!(
        session.state(),
        StreamState::Stopped {
            reason: StopReason::BacklogOverflow
        }
    );
    assert_eq!(session.backlog_count(), 8);
    assert!(session.last_error().is_some());

    let mut buffer = vec![0u8; 24];
    for expected in 0..8u32 {
        assert_eq!(session.read_packet(&mut buffer, 50).unwrap(), 24);
        assert_eq!(packet_index(&buffer), expected);
    }
    assert!(session.read_packet(&mut buffer, 5).unwrap_err().is_retryable());

    // resume from Stopped: the hardware already has the next packet armed
    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || session.backlog_count() > 0));
    session.stop();

    session.read_packet(&mut buffer, 50).unwrap();
    assert_eq!(packet_index(&buffer), 8);
}

#[test]
fn test_ring_never_overwrites_unread_packets() {
    init_logging();
    // small ring, generous backlog limit: the byte guard has to stop the producer
    let driver = SimulatedDriver::default();
    let mut session = prepared_session(config(1000, 1000), &driver, 4);

    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_streaming()));
    session.stop();

    // 96-byte packets: ten fit in 1000 bytes
    assert_eq!(session.backlog_count(), 10);
    let mut buffer = vec![0u8; 96];
    for expected in 0..10u32 {
        session.read_packet(&mut buffer, 50).unwrap();
        assert_eq!(packet_index(&buffer), expected);
    }
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_receive_failure_leaves_backlog_readable() {
    init_logging();
    let driver = SimulatedDriver::new(SimulatorConfig {
        fail_recv_after: Some(5),
        ..Default::default()
    });
    let mut session = prepared_session(config(64 * 1024, 64), &driver, 1);

    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_streaming()));

    match session.stop() {
        Some(Err(StreamError::RecvFailed(_))) => {}
        other => panic!("expected a receive failure, got ok={:?}", other.map(|r| r.is_ok())),
    }
    assert!(matches!(session.state(), StreamState::Failed { .. }));
    assert!(session
        .last_error()
        .is_some_and(|e| e.contains("Receive failed")));

    let mut buffer = vec![0u8; 24];
    for _ in 0..5 {
        session.read_packet(&mut buffer, 50).unwrap();
    }
    assert_eq!(session.backlog_count(), 0);

    // a failed stream needs a new handshake
    assert!(matches!(
        session.start_streaming(),
        Err(StreamError::NotPrepared)
    ));
    session.prepare(1).unwrap();
    assert!(session.is_prepared());
}

#[test]
fn test_send_failure_after_receive_keeps_packet() {
    init_logging();
    let driver = SimulatedDriver::new(SimulatorConfig {
        fail_send_after: Some(3),
        ..Default::default()
    });
    let mut session = prepared_session(config(64 * 1024, 64), &driver, 1);

    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_streaming()));
    assert!(matches!(
        session.stop(),
        Some(Err(StreamError::SendFailed(_)))
    ));

    // init + 2 continues accepted, the third packet's continue failed
    assert_eq!(session.backlog_count(), 3);
    assert_eq!(driver.counters().continue_commands(), 2);
}

#[test]
fn test_stop_during_receive_still_sends_continue() {
    init_logging();
    let driver = SimulatedDriver::new(SimulatorConfig {
        receive_latency: Some(Duration::from_millis(40)),
        ..Default::default()
    });
    let mut cfg = config(64 * 1024, 64);
    cfg.recv_timeout_ms = 500;
    let mut session = prepared_session(cfg, &driver, 1);

    session.start_streaming().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(matches!(session.stop(), Some(Ok(StopReason::Requested))));

    // every packet the hardware delivered was answered before the loop exited
    let counters = driver.counters();
    assert!(counters.packets_delivered() >= 1);
    assert_eq!(counters.packets_delivered(), counters.continue_commands());
    assert_eq!(session.backlog_count() as u64, counters.packets_delivered());

    // the hardware is armed, so a resumed stream receives again
    let before = counters.packets_delivered();
    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        counters.packets_delivered() > before
    }));
    assert!(matches!(session.stop(), Some(Ok(StopReason::Requested))));
    assert_eq!(counters.packets_delivered(), counters.continue_commands());
}

#[test]
fn test_corrupt_sequence_is_rejected() {
    init_logging();
    let driver = SimulatedDriver::new(SimulatorConfig {
        corrupt_sequence_at: Some(10),
        ..Default::default()
    });
    let mut cfg = config(64 * 1024, 64);
    cfg.validation = ValidationPolicy::sequence_field();
    let mut session = prepared_session(cfg, &driver, 3);

    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_streaming()));
    assert!(matches!(
        session.stop(),
        Some(Err(StreamError::PacketRejected(_)))
    ));
    assert_eq!(session.backlog_count(), 10);
}

// ============================================================================
// Disconnect
// ============================================================================

#[test]
fn test_disconnect_stops_consumer_and_resets() {
    init_logging();
    let driver = SimulatedDriver::new(SimulatorConfig {
        receive_latency: Some(Duration::from_millis(1)),
        ..Default::default()
    });
    let mut session = prepared_session(config(1024 * 1024, 10_000), &driver, 1);

    let consumer = session.consumer().with_poll_timeout(10);
    let reader = thread::spawn(move || {
        let mut sink = |_: &PacketDescriptor, _: &[u8]| -> StreamResult<()> { Ok(()) };
        consumer.run(&mut sink).unwrap()
    });

    session.start_streaming().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        session.stats().packets_read >= 5
    }));
    session.disconnect();

    let summary = reader.join().unwrap();
    assert!(matches!(
        summary.stop,
        ConsumerStop::Disconnected | ConsumerStop::Cancelled
    ));
    assert!(summary.packets >= 5);

    assert!(!session.is_connected());
    assert_eq!(session.state(), StreamState::Idle);
    assert_eq!(session.write_position(), 0);
    assert_eq!(session.read_position(), 0);
    assert_eq!(session.backlog_count(), 0);
    assert!(matches!(session.prepare(1), Err(StreamError::NotConnected)));
}
