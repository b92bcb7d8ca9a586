// Simulated FPGA channel
//
// Models the streaming handshake of the real hardware so the engine can run
// without a PCIe card:
// - an initiation command arms the first packet and fixes the packet size
// - every continue command arms one more packet
// - a receive without an armed packet times out and transfers nothing
//
// Packet word 5 carries a running sequence value advanced by the requested
// transfer value and rolled over near SEQUENCE_ROLLOVER, the way the
// hardware's counter behaves. Useful for:
// - Exercising producer/consumer threads in tests
// - Demos and soak runs from the CLI
// - Fault injection (failed sends, failed receives, corrupted sequence)

use super::{TransportChannel, TransportDriver, LOG_TARGET};
use crate::error::{StreamError, StreamResult};
use crate::wire::{self, WORDS_PER_UNIT, WORD_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use crate::wire::{SEQUENCE_ROLLOVER, SEQUENCE_WORD};

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub device_count: usize,
    /// Delay before an armed packet is delivered
    pub receive_latency: Option<Duration>,
    /// Upper bound on how long a receive without an armed packet blocks
    pub max_idle_wait: Duration,
    /// Every receive fails once this many packets were delivered
    pub fail_recv_after: Option<u64>,
    /// Every send fails once this many commands were accepted
    pub fail_send_after: Option<u64>,
    /// Deliver this packet (0-based) with a bogus sequence value
    pub corrupt_sequence_at: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            receive_latency: None,
            max_idle_wait: Duration::from_millis(50),
            fail_recv_after: None,
            fail_send_after: None,
            corrupt_sequence_at: None,
        }
    }
}

/// Counters shared between the driver and every channel it opened
#[derive(Debug, Default)]
pub struct SimCounters {
    pub init_commands: AtomicU64,
    pub continue_commands: AtomicU64,
    pub packets_delivered: AtomicU64,
    pub rejected_commands: AtomicU64,
}

impl SimCounters {
    pub fn init_commands(&self) -> u64 {
        self.init_commands.load(Ordering::Relaxed)
    }

    pub fn continue_commands(&self) -> u64 {
        self.continue_commands.load(Ordering::Relaxed)
    }

    pub fn packets_delivered(&self) -> u64 {
        self.packets_delivered.load(Ordering::Relaxed)
    }

    pub fn rejected_commands(&self) -> u64 {
        self.rejected_commands.load(Ordering::Relaxed)
    }
}

pub struct SimulatedDriver {
    config: SimulatorConfig,
    counters: Arc<SimCounters>,
}

impl SimulatedDriver {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            counters: Arc::new(SimCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<SimCounters> {
        Arc::clone(&self.counters)
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl TransportDriver for SimulatedDriver {
    fn list_devices(&self) -> usize {
        self.config.device_count
    }

    fn open(&self, device_id: u32, channel: u32) -> StreamResult<Box<dyn TransportChannel>> {
        if device_id as usize >= self.config.device_count {
            return Err(StreamError::OpenFailed(format!(
                "device {} not present ({} simulated)",
                device_id, self.config.device_count
            )));
        }

        log::info!(target: LOG_TARGET, "Opened simulated device {} channel {}", device_id, channel);
        Ok(Box::new(SimulatedChannel::new(
            self.config.clone(),
            Arc::clone(&self.counters),
        )))
    }
}

pub struct SimulatedChannel {
    config: SimulatorConfig,
    counters: Arc<SimCounters>,
    open: bool,
    requested: Option<u32>,
    armed: bool,
    sequence: u32,
    sends: u64,
    delivered: u64,
}

impl SimulatedChannel {
    pub fn new(config: SimulatorConfig, counters: Arc<SimCounters>) -> Self {
        Self {
            config,
            counters,
            open: true,
            requested: None,
            armed: false,
            sequence: 0,
            sends: 0,
            delivered: 0,
        }
    }

    /// Next value of the hardware sequence counter
    pub fn advance_sequence(current: u32, step: u32) -> u32 {
        let next = current.wrapping_add(step);
        if next >= SEQUENCE_ROLLOVER {
            next.wrapping_add(step).wrapping_sub(SEQUENCE_ROLLOVER)
        } else {
            next
        }
    }

    fn fill_packet(&self, words: &mut [u32]) {
        for (i, word) in words.iter_mut().enumerate() {
            *word = 0xA5A5_0000 | ((self.delivered as u32).wrapping_add(i as u32) & 0xFFFF);
        }
        if let Some(first) = words.first_mut() {
            *first = self.delivered as u32;
        }
        if let Some(seq) = words.get_mut(SEQUENCE_WORD) {
            *seq = if self.config.corrupt_sequence_at == Some(self.delivered) {
                self.sequence ^ 0x00FF_FF00
            } else {
                self.sequence
            };
        }
    }
}

impl TransportChannel for SimulatedChannel {
    fn send(&mut self, words: &[u32], _dest_offset: u32, _last: bool, _timeout: Duration) -> usize {
        if !self.open {
            log::warn!(target: LOG_TARGET, "Send on closed channel");
            return 0;
        }
        if self.config.fail_send_after.is_some_and(|n| self.sends >= n) {
            log::warn!(target: LOG_TARGET, "Injected send failure after {} sends", self.sends);
            return 0;
        }

        if let Some(value) = wire::decode_init_command(words) {
            log::debug!(target: LOG_TARGET, "Initiation command, requested value {}", value);
            self.requested = Some(value);
            self.sequence = 0;
            self.armed = true;
            self.counters.init_commands.fetch_add(1, Ordering::Relaxed);
        } else if wire::is_continue_command(words) && self.requested.is_some() {
            self.armed = true;
            self.counters.continue_commands.fetch_add(1, Ordering::Relaxed);
        } else {
            log::warn!(
                target: LOG_TARGET,
                "Rejected command: {}",
                wire::format_words(words)
            );
            self.counters.rejected_commands.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        self.sends += 1;
        words.len()
    }

    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> usize {
        if !self.open {
            log::warn!(target: LOG_TARGET, "Receive on closed channel");
            return 0;
        }
        if self.config.fail_recv_after.is_some_and(|n| self.delivered >= n) {
            log::warn!(
                target: LOG_TARGET,
                "Injected receive failure after {} packets",
                self.delivered
            );
            return 0;
        }

        let Some(requested) = self.requested.filter(|_| self.armed) else {
            std::thread::sleep(timeout.min(self.config.max_idle_wait));
            log::debug!(target: LOG_TARGET, "Receive timed out, no packet armed");
            return 0;
        };

        if let Some(latency) = self.config.receive_latency {
            std::thread::sleep(latency);
        }

        let packet_words = requested as usize * WORDS_PER_UNIT;
        let words = packet_words.min(buffer.len() / WORD_SIZE);
        let mut packet = vec![0u32; words];
        self.fill_packet(&mut packet);
        wire::write_words_le(&packet, buffer);

        self.armed = false;
        self.delivered += 1;
        self.sequence = Self::advance_sequence(self.sequence, requested);
        self.counters.packets_delivered.fetch_add(1, Ordering::Relaxed);
        words
    }

    fn close(&mut self) {
        if self.open {
            log::info!(target: LOG_TARGET, "Closed simulated channel");
        }
        self.open = false;
        self.armed = false;
    }
}
