// Transport contract consumed by the streaming engine
//
// The engine never talks to the PCIe driver directly. A `TransportDriver`
// opens channels to a device, and a `TransportChannel` moves 32-bit words with
// a caller-supplied timeout, reporting the number of words transferred
// (0 means the transfer failed).
//
// Implementations log under the `fpga_fifo::transport` target so hosts can
// silence transport chatter independently of the engine's own log.
//
// Current implementations:
// - sim: in-process FPGA model speaking the initiation/continue handshake

pub mod sim;

use crate::error::StreamResult;
use std::time::Duration;

pub use sim::{SimulatedChannel, SimulatedDriver, SimulatorConfig, SEQUENCE_ROLLOVER};

/// Log target for transport implementations
pub const LOG_TARGET: &str = "fpga_fifo::transport";

/// An open channel to the FPGA
pub trait TransportChannel: Send {
    /// Send `words` to the device, blocking for at most `timeout`
    ///
    /// Returns the number of words transferred; 0 means failure.
    fn send(&mut self, words: &[u32], dest_offset: u32, last: bool, timeout: Duration) -> usize;

    /// Receive `buffer.len() / 4` words into `buffer` (little-endian), blocking for at most `timeout`
    ///
    /// Returns the number of words transferred; 0 means failure.
    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> usize;

    /// Release the channel; further transfers fail
    fn close(&mut self);
}

/// Access point to the devices behind a driver
pub trait TransportDriver: Send + Sync {
    /// Number of devices present
    fn list_devices(&self) -> usize;

    /// Open `channel` on device `device_id`
    fn open(&self, device_id: u32, channel: u32) -> StreamResult<Box<dyn TransportChannel>>;
}
