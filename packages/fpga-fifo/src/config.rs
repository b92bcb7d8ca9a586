// Session configuration
//
// Defaults reproduce the hardware setup the engine was built for: a 500 MiB
// arena, at most 5000 unread packets, 2.5 s receive and 25 s send timeouts,
// and a 100 µs pacing delay between loop iterations.

use crate::error::{StreamError, StreamResult};
use crate::validation::ValidationPolicy;
use crate::wire::{PacketLayout, WORDS_PER_UNIT, WORD_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_RING_CAPACITY: usize = 500 * 1024 * 1024;
pub const DEFAULT_MAX_PENDING: usize = 5000;

/// How the loops wait out their inter-iteration pacing delay
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    /// Yield the processor until the deadline passes; lowest latency
    #[default]
    Spin,
    /// Blocking sleep; for targets where burning a core is not acceptable
    Sleep,
}

/// Which iterations get a full packet dump in the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Every iteration below this count is logged
    pub verbose_first: u64,
    /// After that, every n-th iteration is logged (0 disables)
    pub every: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            verbose_first: 1000,
            every: 10_000,
        }
    }
}

impl DiagnosticsConfig {
    pub fn should_log(&self, iteration: u64) -> bool {
        iteration < self.verbose_first || (self.every != 0 && iteration % self.every == 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub device_id: u32,
    pub channel: u32,
    pub ring_capacity: usize,
    pub max_pending: usize,
    pub word_size: usize,
    pub words_per_unit: usize,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub pacing_us: u64,
    pub pacing_mode: PacingMode,
    pub continue_holdoff_us: u64,
    pub validation: ValidationPolicy,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            channel: 0,
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_pending: DEFAULT_MAX_PENDING,
            word_size: WORD_SIZE,
            words_per_unit: WORDS_PER_UNIT,
            recv_timeout_ms: 2500,
            send_timeout_ms: 25_000,
            pacing_us: 100,
            pacing_mode: PacingMode::Spin,
            continue_holdoff_us: 0,
            validation: ValidationPolicy::AcceptAll,
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> StreamResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.ring_capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "ring_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_pending == 0 {
            return Err(StreamError::InvalidConfig(
                "max_pending must be greater than zero".to_string(),
            ));
        }
        if self.word_size == 0 || self.words_per_unit == 0 {
            return Err(StreamError::InvalidConfig(
                "word_size and words_per_unit must be greater than zero".to_string(),
            ));
        }
        if self.recv_timeout_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "recv_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn packet_layout(&self, requested_word_count: u32) -> PacketLayout {
        PacketLayout::with_geometry(requested_word_count, self.words_per_unit, self.word_size)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_micros(self.pacing_us)
    }

    pub fn continue_holdoff(&self) -> Duration {
        Duration::from_micros(self.continue_holdoff_us)
    }
}
