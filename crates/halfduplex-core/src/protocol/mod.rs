//! Half-Duplex Serial Protocol
//!
//! Command/response engine for devices that answer with delimiter-terminated
//! lines over a channel where only one side may talk at a time.

mod engine;
mod error;
pub mod framer;
mod gate;
mod logging;
mod request;
mod router;
pub mod serial;
pub mod transport;

use std::time::Duration;

pub use engine::{EngineConfig, HalfDuplex};
pub use error::ProtocolError;
pub use framer::{frame_lines, Line, LineCodec, LineStream};
pub use gate::{Gate, GateGuard};
pub use logging::{escape_for_log, Logger, TracingLogger};
pub use router::Observer;
pub use serial::{
    find_port, find_suitable_port, is_default_device, list_ports, open_port, select_port, Parity,
    PortInfo, SerialSettings, SerialTransport,
};
pub use transport::{
    ByteStream, EventListener, EventListeners, EventedReader, Transport, TransportEvent,
};

/// Default baud rate for opened ports
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time to wait for an answer
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(20);

/// Default line delimiter
pub const DEFAULT_DELIMITER: &[u8] = b"\r\n";

/// USB vendor id selected by [`find_suitable_port`] (Silicon Labs)
pub const DEFAULT_VENDOR_ID: u16 = 0x10c4;

/// Buffered write size above which transports report backpressure
pub const WRITE_HIGH_WATER_MARK: usize = 16 * 1024;
