use crate::cli::{RunArgs, ValidateMode};
use crate::exit_codes;
use crate::output;
use fpga_fifo::{
    ConsumerSummary, EventCallback, PacketDescriptor, Session, SessionConfig, SimulatedDriver,
    SimulatorConfig, StopReason, StreamEvent, StreamResult, StreamState, StreamStats,
    ValidationPolicy,
};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::{interval, sleep, Instant};

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Serialize)]
struct RunReport {
    session_id: String,
    value: u32,
    packet_bytes: usize,
    state: StreamState,
    interrupted: bool,
    backlog_stops: u64,
    consumer: Option<ConsumerSummary>,
    stats: StreamStats,
    last_error: Option<String>,
    output: Option<String>,
}

fn load_config(args: &RunArgs) -> Result<SessionConfig, String> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_file(Path::new(path))
            .map_err(|e| format!("Failed to load config '{}': {}", path, e))?,
        None => SessionConfig::default(),
    };

    if let Some(capacity) = args.capacity {
        config.ring_capacity = capacity;
    }
    if let Some(max_pending) = args.max_pending {
        config.max_pending = max_pending;
    }
    match args.validate {
        Some(ValidateMode::None) => config.validation = ValidationPolicy::AcceptAll,
        Some(ValidateMode::Sequence) => config.validation = ValidationPolicy::sequence_field(),
        None => {}
    }

    config.validate().map_err(|e| e.to_string())?;

    let packet_bytes = config.packet_layout(args.value).bytes();
    if packet_bytes > config.ring_capacity {
        return Err(format!(
            "A packet of {} bytes does not fit a ring of {} bytes",
            packet_bytes, config.ring_capacity
        ));
    }
    Ok(config)
}

fn open_output(path: Option<&str>) -> Result<Option<BufWriter<File>>, String> {
    path.map(|p| {
        File::create(p)
            .map(BufWriter::new)
            .map_err(|e| format!("Failed to create output file '{}': {}", p, e))
    })
    .transpose()
}

/// Wait until the consumer has emptied the ring, or it ended on its own
async fn drain(session: &Session, reader: &tokio::task::JoinHandle<StreamResult<ConsumerSummary>>) {
    while session.backlog_count() > 0 && !reader.is_finished() {
        sleep(Duration::from_millis(5)).await;
    }
}

pub async fn execute(args: RunArgs) -> i32 {
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };
    let packet_bytes = config.packet_layout(args.value).bytes();

    let mut writer = match open_output(args.output.as_deref()) {
        Ok(writer) => writer,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    let backlog_stops = Arc::new(AtomicU64::new(0));
    let stops = Arc::clone(&backlog_stops);
    let quiet = args.quiet;
    let callback: EventCallback = Arc::new(move |event: StreamEvent| {
        if let StreamEvent::BacklogOverflow { pending, .. } = event {
            stops.fetch_add(1, Ordering::Relaxed);
            if !quiet {
                eprintln!("Backlog full ({} packets), waiting for the consumer", pending);
            }
        }
    });

    let mut session = match Session::new(config, Some(callback)) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    let driver = SimulatedDriver::new(SimulatorConfig {
        fail_recv_after: args.fail_recv_after,
        ..Default::default()
    });
    if let Err(e) = session.connect(&driver).and_then(|_| session.prepare(args.value)) {
        eprintln!("Error: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }

    if !args.quiet {
        eprintln!(
            "Streaming {}-byte packets (value {}) through a {}-byte ring...",
            packet_bytes,
            args.value,
            session.config().ring_capacity
        );
    }

    // Consumer thread
    let consumer = session.consumer();
    let consumer_token = consumer.cancel_token();
    let limit_token = consumer.cancel_token();
    let packet_limit = args.packets;
    let consumer_delay = Duration::from_micros(args.consumer_delay_us);
    let mut reader = tokio::task::spawn_blocking(move || -> StreamResult<ConsumerSummary> {
        let mut drained = 0u64;
        let mut sink = |_: &PacketDescriptor, data: &[u8]| -> StreamResult<()> {
            if let Some(out) = writer.as_mut() {
                out.write_all(data)?;
            }
            if !consumer_delay.is_zero() {
                std::thread::sleep(consumer_delay);
            }
            drained += 1;
            if packet_limit.is_some_and(|limit| drained >= limit) {
                limit_token.cancel();
            }
            Ok(())
        };
        let summary = consumer.run(&mut sink)?;
        if let Some(out) = writer.as_mut() {
            out.flush()?;
        }
        Ok(summary)
    });

    if let Err(e) = session.start_streaming() {
        eprintln!("Error: {}", e);
        consumer_token.cancel();
        let _ = reader.await;
        return exit_codes::EXECUTION_ERROR;
    }

    // Supervise: resume after backpressure, stop on failure, limit or signal
    let deadline = args
        .duration_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let mut ticker = interval(SUPERVISE_INTERVAL);
    let mut interrupted = false;
    let mut reader_result = None;
    let mut producer_outcome = None;
    let mut waiting_for_drain = false;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Interrupted, stopping session");
                interrupted = true;
                break;
            }
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => break,
            result = &mut reader => {
                reader_result = Some(result);
                break;
            }
            _ = ticker.tick() => {
                if waiting_for_drain {
                    if session.backlog_count() == 0 {
                        waiting_for_drain = false;
                        if let Err(e) = session.start_streaming() {
                            eprintln!("Error: {}", e);
                            break;
                        }
                    }
                } else if !session.is_streaming() {
                    match session.stop() {
                        Some(Ok(StopReason::BacklogOverflow)) => waiting_for_drain = true,
                        outcome => {
                            producer_outcome = outcome;
                            break;
                        }
                    }
                }
            }
        }
    }

    if producer_outcome.is_none() {
        producer_outcome = session.stop();
    }
    if let Some(Err(e)) = &producer_outcome {
        eprintln!("Stream failed: {}", e);
    }

    // Drain what was already committed unless the operator interrupted
    if !interrupted && reader_result.is_none() {
        tokio::select! {
            _ = signal::ctrl_c() => interrupted = true,
            _ = drain(&session, &reader) => {}
        }
    }
    consumer_token.cancel();

    let consumer_result = match reader_result {
        Some(result) => result,
        None => reader.await,
    };

    let mut failed = matches!(session.state(), StreamState::Failed { .. });
    let consumer_summary = match consumer_result {
        Ok(Ok(summary)) => Some(summary),
        Ok(Err(e)) => {
            eprintln!("Consumer failed: {}", e);
            failed = true;
            None
        }
        Err(e) => {
            eprintln!("Consumer thread failed: {}", e);
            failed = true;
            None
        }
    };

    let report = RunReport {
        session_id: session.id().to_string(),
        value: args.value,
        packet_bytes,
        state: session.state(),
        interrupted,
        backlog_stops: backlog_stops.load(Ordering::Relaxed),
        consumer: consumer_summary,
        stats: session.stats(),
        last_error: session.last_error(),
        output: args.output.clone(),
    };

    let code = if args.json {
        output::print_json(&report, false)
    } else {
        print_report(&report);
        exit_codes::SUCCESS
    };

    if failed {
        exit_codes::EXECUTION_ERROR
    } else {
        code
    }
}

fn print_report(report: &RunReport) {
    let stats = &report.stats;
    println!("Session:      {}", report.session_id);
    println!("State:        {:?}", report.state);
    println!(
        "Received:     {} packets, {} bytes",
        stats.packets_received, stats.bytes_received
    );
    println!("Read:         {} packets", stats.packets_read);
    println!(
        "Backlog:      {} (peak {}, {} overflow stops)",
        stats.backlog, stats.peak_backlog, report.backlog_stops
    );
    println!("Wraparounds:  {}", stats.wraparounds);
    if let Some(error) = &report.last_error {
        println!("Last error:   {}", error);
    }
    if let Some(path) = &report.output {
        println!("Output:       {}", path);
    }
}
