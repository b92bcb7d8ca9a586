// Inter-iteration pacing for the producer and consumer loops
//
// Waits are gated by the monotonic clock so a loop never oversleeps its
// cadence, and every wait gives up as soon as the cancellation token fires.

use crate::config::PacingMode;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Upper bound on a single blocking sleep so cancellation stays responsive
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    mode: PacingMode,
    interval: Duration,
}

impl Pacer {
    pub fn new(mode: PacingMode, interval: Duration) -> Self {
        Self { mode, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait one pacing interval; returns false if cancelled before it elapsed
    pub fn wait(&self, cancel: &CancellationToken) -> bool {
        wait_for(self.mode, self.interval, cancel)
    }
}

/// Wait `duration` in the given mode; returns false if `cancel` fired first
pub fn wait_for(mode: PacingMode, duration: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }

    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        if cancel.is_cancelled() {
            return false;
        }
        match mode {
            PacingMode::Spin => std::thread::yield_now(),
            PacingMode::Sleep => std::thread::sleep((deadline - now).min(MAX_SLEEP_SLICE)),
        }
    }
}

/// Wait `duration` in the given mode without observing cancellation
pub fn hold(mode: PacingMode, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        match mode {
            PacingMode::Spin => std::thread::yield_now(),
            PacingMode::Sleep => std::thread::sleep(deadline - now),
        }
    }
}
