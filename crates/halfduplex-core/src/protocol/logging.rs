//! Logging capability
//!
//! The engine reports traffic and transport errors to an optional [`Logger`].
//! [`TracingLogger`] forwards everything to `tracing`.

/// Sink for engine traffic and transport errors
pub trait Logger: Send + Sync {
    /// Informational message (outgoing writes, incoming lines)
    fn info(&self, message: &str);

    /// Transport-level or observer failure
    fn error(&self, message: &str);
}

/// Logger forwarding to the `tracing` macros under the `halfduplex` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(target: "halfduplex", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "halfduplex", "{}", message);
    }
}

/// Render bytes for a single log line: CR, LF and other control or
/// non-ASCII bytes are escaped.
pub fn escape_for_log(data: &[u8]) -> String {
    data.escape_ascii().to_string()
}
