pub mod config;
pub mod consumer;
pub mod diagnostics;
pub mod error;
pub mod pacing;
pub mod producer;
pub mod ring;
pub mod session;
pub mod transport;
pub mod types;
pub mod validation;
pub mod wire;

pub use config::{DiagnosticsConfig, PacingMode, SessionConfig};
pub use consumer::{ConsumerStop, ConsumerSummary, PacketSink, StreamConsumer};
pub use error::{StreamError, StreamResult};
pub use producer::{StepOutcome, StreamProducer};
pub use ring::RingBuffer;
pub use session::Session;
pub use transport::{SimulatedDriver, SimulatorConfig, TransportChannel, TransportDriver};
pub use types::*;
pub use validation::ValidationPolicy;
