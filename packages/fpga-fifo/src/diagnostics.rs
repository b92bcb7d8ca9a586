// Sampled diagnostics for the streaming loops
//
// Logging every packet at full rate would swamp the host, so dumps are only
// produced for the iterations selected by `DiagnosticsConfig`.

use crate::config::DiagnosticsConfig;
use crate::ring::RingBuffer;
use crate::types::PacketDescriptor;
use crate::wire;

const MIB: f64 = 1024.0 * 1024.0;

/// Snapshot of the ring for a status line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStatus {
    pub write_position_mib: f64,
    pub capacity_mib: f64,
    pub free_mib: f64,
    pub backlog: usize,
    pub loop_micros: u64,
}

impl BufferStatus {
    pub fn capture(ring: &RingBuffer, loop_micros: u64) -> Self {
        let capacity = ring.capacity();
        let write = ring.write_position();
        let read = ring.read_position();
        let used = if ring.pending_count() == 0 {
            0
        } else if write > read {
            write - read
        } else {
            capacity - read + write
        };

        Self {
            write_position_mib: write as f64 / MIB,
            capacity_mib: capacity as f64 / MIB,
            free_mib: capacity.saturating_sub(used) as f64 / MIB,
            backlog: ring.pending_count(),
            loop_micros,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "write {:.2} MiB / {:.2} MiB, free {:.2} MiB, backlog {}, loop {} µs",
            self.write_position_mib,
            self.capacity_mib,
            self.free_mib,
            self.backlog,
            self.loop_micros
        )
    }
}

/// Decides per iteration whether to log, and formats what gets logged
#[derive(Debug, Clone)]
pub struct Diagnostics {
    config: DiagnosticsConfig,
}

impl Diagnostics {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self { config }
    }

    pub fn enabled_for(&self, iteration: u64) -> bool {
        self.config.should_log(iteration)
    }

    /// Dump a received packet at debug level if `iteration` is sampled
    pub fn packet(&self, iteration: u64, packet: &[u8]) {
        if !self.enabled_for(iteration) || !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let words = wire::words_from_le_bytes(packet);
        log::debug!(
            "Packet #{} ({} words): {}",
            iteration,
            words.len(),
            wire::format_words(&words)
        );
    }

    /// Dump a packet the consumer just read, with where it came from
    ///
    /// `read_index` counts reads since the ring was last reset.
    pub fn read(&self, read_index: u64, descriptor: &PacketDescriptor, data: &[u8], backlog: usize) {
        if !self.enabled_for(read_index) || !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let words = wire::words_from_le_bytes(data);
        log::debug!(
            "Read #{} ({} words): {}",
            read_index,
            words.len(),
            wire::format_words(&words)
        );
        log::debug!("{}", read_location(descriptor, backlog));
    }

    /// Log a buffer status line at info level if `iteration` is sampled
    pub fn status(&self, iteration: u64, ring: &RingBuffer, loop_micros: u64) {
        if !self.enabled_for(iteration) {
            return;
        }
        let status = BufferStatus::capture(ring, loop_micros);
        log::info!("Iteration {}: {}", iteration, status.summary());
    }
}

fn read_location(descriptor: &PacketDescriptor, backlog: usize) -> String {
    format!(
        "Read {} bytes from ring offset {}, {} packets still unread",
        descriptor.size, descriptor.offset, backlog
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_of_empty_ring() {
        let ring = RingBuffer::new(2 * 1024 * 1024, 4).unwrap();
        let status = BufferStatus::capture(&ring, 42);
        assert_eq!(status.capacity_mib, 2.0);
        assert_eq!(status.free_mib, 2.0);
        assert_eq!(status.backlog, 0);
        assert_eq!(status.loop_micros, 42);
    }

    #[test]
    fn test_status_counts_unread_bytes() {
        let ring = RingBuffer::new(1024 * 1024, 4).unwrap();
        ring.write_packet(&vec![1u8; 512 * 1024]).unwrap();
        let status = BufferStatus::capture(&ring, 0);
        assert_eq!(status.write_position_mib, 0.5);
        assert_eq!(status.free_mib, 0.5);
        assert_eq!(status.backlog, 1);
        assert!(status.summary().contains("backlog 1"));
    }

    #[test]
    fn test_read_location_line() {
        let descriptor = PacketDescriptor {
            offset: 96,
            size: 48,
            sequence: 2,
        };
        assert_eq!(
            read_location(&descriptor, 7),
            "Read 48 bytes from ring offset 96, 7 packets still unread"
        );
    }

    #[test]
    fn test_sampling_follows_config() {
        let diagnostics = Diagnostics::new(DiagnosticsConfig {
            verbose_first: 2,
            every: 5,
        });
        let sampled: Vec<u64> = (0..12).filter(|i| diagnostics.enabled_for(*i)).collect();
        assert_eq!(sampled, vec![0, 1, 5, 10]);
    }
}
