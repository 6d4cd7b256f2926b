//! # halfduplex Core Library
//!
//! Command/response communication with half-duplex serial devices.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Line framing of the incoming byte stream (configurable delimiter)
//! - Serialized command sending with timeout-bounded, multi-line answers
//! - Dispatch of unsolicited lines to registered observers
//! - Serial port discovery and opening
//! - An in-memory virtual port for tests and demos
//!
//! ## Example
//!
//! ```rust,ignore
//! use halfduplex_core::prelude::*;
//! use std::time::Duration;
//!
//! let port = find_suitable_port()?;
//! let transport = open_port(&port.name, &SerialSettings::default())?;
//! let engine = HalfDuplex::with_defaults(transport)?;
//!
//! engine.on_message(|line| println!("UART data received: {}", line));
//! let version = engine.send_and_receive(b"V\r", Duration::from_millis(50)).await?;
//! println!("Version: {}", version);
//! ```

pub mod protocol;
pub mod virtual_port;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        find_port, find_suitable_port, list_ports, open_port, EngineConfig, HalfDuplex, Line,
        Logger, PortInfo, ProtocolError, SerialSettings, Transport, TracingLogger,
        DEFAULT_RESPONSE_TIMEOUT,
    };
    pub use crate::virtual_port::{VirtualDevice, VirtualPort};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
