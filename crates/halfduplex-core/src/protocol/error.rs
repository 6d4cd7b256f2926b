//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to a half-duplex device
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Could not open port {port}: {message}")]
    TransportOpen { port: String, message: String },

    #[error("No UART devices found")]
    NoMatchingDevice,

    #[error("Timeout; no answer received")]
    Timeout,

    #[error("Serial write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Serial close failed: {0}")]
    Close(#[source] std::io::Error),

    #[error("Engine is closed")]
    Closed,

    #[error("Transport byte stream was already taken")]
    StreamUnavailable,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Request task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when a receive deadline elapsed without a single line
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout)
    }
}
