//! Half-duplex engine
//!
//! Owns an open transport and serializes every command sent over it. Replies
//! carry no request ids, so a reply is whatever lines arrive while the
//! command that caused them holds the gate.

use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::framer::{frame_lines, LineStream};
use super::gate::{Gate, GateGuard};
use super::logging::escape_for_log;
use super::request::race;
use super::router::Router;
use super::transport::{ByteStream, Transport, TransportEvent};
use super::{Line, LineCodec, Logger, ProtocolError, DEFAULT_DELIMITER};

/// Engine configuration
#[derive(Clone)]
pub struct EngineConfig {
    /// Bytes terminating every incoming line
    pub delimiter: Vec<u8>,
    /// Receives outgoing commands, incoming lines and transport errors
    pub logger: Option<Arc<dyn Logger>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_vec(),
            logger: None,
        }
    }
}

impl EngineConfig {
    /// Use a different line delimiter
    pub fn with_delimiter(mut self, delimiter: impl Into<Vec<u8>>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Report traffic to `logger`
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("delimiter", &escape_for_log(&self.delimiter))
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// State shared between the engine handle and its request tasks
struct Shared {
    gate: Gate,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    router: Arc<Router>,
    logger: Option<Arc<dyn Logger>>,
    closed: AtomicBool,
}

impl Shared {
    /// Write and drain one command. Only called with the gate held.
    async fn transmit(&self, cmd: &[u8]) -> Result<(), ProtocolError> {
        if let Some(logger) = &self.logger {
            logger.info(&format!("Serial → {}", escape_for_log(cmd)));
        }

        let mut transport = self.transport.lock().await;
        let accepted = transport.write(cmd).map_err(ProtocolError::Write)?;
        if !accepted {
            tracing::debug!(bytes = cmd.len(), "transport buffer above high-water mark");
        }
        transport.drain().await.map_err(ProtocolError::Write)
    }

    /// Full request lifecycle: arm, transmit, race the deadline, restore.
    ///
    /// The guard is consumed on every path, after the handler slot is back
    /// to spontaneous dispatch.
    async fn exchange(
        &self,
        guard: GateGuard,
        cmd: &[u8],
        timeout: Duration,
        expected: usize,
    ) -> Result<Vec<Line>, ProtocolError> {
        // Armed before writing so a fast reply cannot slip past
        let complete = self.router.arm(expected);

        if let Err(e) = self.transmit(cmd).await {
            self.router.disarm();
            guard.release();
            return Err(e);
        }

        let settlement = race(&self.router, complete, expected, timeout).await;
        tracing::debug!(
            outcome = settlement.kind(),
            expected,
            timeout = ?timeout,
            "request settled"
        );
        guard.release();
        settlement.into_result()
    }
}

/// Command/response engine over a half-duplex transport.
///
/// At most one command is on the wire at a time; callers queue in FIFO
/// order. Lines arriving while no request is pending go to the observers
/// registered with [`HalfDuplex::on_message`].
///
/// Must be created inside a Tokio runtime.
pub struct HalfDuplex {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Set once the transport closed successfully
    finished: tokio::sync::Mutex<bool>,
}

impl HalfDuplex {
    /// Take ownership of an open transport and start listening to it
    pub fn new<T: Transport>(transport: T, config: EngineConfig) -> Result<Self, ProtocolError> {
        let codec = LineCodec::new(config.delimiter)?;
        let logger = config.logger;

        let mut transport: Box<dyn Transport> = Box::new(transport);
        let stream = transport
            .byte_stream()
            .ok_or(ProtocolError::StreamUnavailable)?;
        {
            let logger = logger.clone();
            transport.subscribe(Box::new(move |event| {
                report_transport_event(logger.as_deref(), event)
            }));
        }

        let router = Arc::new(Router::new(logger.clone()));
        let reader = tokio::spawn(read_lines(
            frame_lines(stream, codec),
            router.clone(),
            logger.clone(),
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                gate: Gate::new(),
                transport: tokio::sync::Mutex::new(transport),
                router,
                logger,
                closed: AtomicBool::new(false),
            }),
            reader: Mutex::new(Some(reader)),
            finished: tokio::sync::Mutex::new(false),
        })
    }

    /// Create an engine with the default configuration
    pub fn with_defaults<T: Transport>(transport: T) -> Result<Self, ProtocolError> {
        Self::new(transport, EngineConfig::default())
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.shared.closed.load(Ordering::Acquire) {
            Err(ProtocolError::Closed)
        } else {
            Ok(())
        }
    }

    /// Send a command, ignoring any answer.
    ///
    /// Resolves once the transport acknowledged the drain. Replies fall
    /// through to whatever is routing lines afterwards.
    pub async fn send(&self, cmd: &[u8]) -> Result<(), ProtocolError> {
        self.ensure_open()?;
        let guard = self.shared.gate.acquire().await?;
        let result = self.shared.transmit(cmd).await;
        guard.release();
        result
    }

    /// Send a command and wait up to `timeout` for a single answer line
    pub async fn send_and_receive(
        &self,
        cmd: &[u8],
        timeout: Duration,
    ) -> Result<Line, ProtocolError> {
        self.send_and_receive_many(cmd, timeout, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(ProtocolError::Timeout)
    }

    /// Send a command and collect up to `expected_lines` answer lines.
    ///
    /// Resolves as soon as all lines arrived, or at the deadline with
    /// whatever arrived. Fails with [`ProtocolError::Timeout`] only when no
    /// line arrived at all. An `expected_lines` of 0 counts as 1.
    ///
    /// Once the gate is acquired the exchange runs on its own task: dropping
    /// the returned future does not cut the request short, and the gate is
    /// released at settlement.
    pub async fn send_and_receive_many(
        &self,
        cmd: &[u8],
        timeout: Duration,
        expected_lines: usize,
    ) -> Result<Vec<Line>, ProtocolError> {
        self.ensure_open()?;
        let guard = self.shared.gate.acquire().await?;

        let shared = self.shared.clone();
        let cmd = cmd.to_vec();
        let expected = expected_lines.max(1);
        let exchange = tokio::spawn(async move {
            shared.exchange(guard, &cmd, timeout, expected).await
        });

        exchange
            .await
            .map_err(|e| ProtocolError::TaskFailed(e.to_string()))?
    }

    /// Register an observer for lines that arrive while no request is pending.
    ///
    /// Observers run synchronously on the reader task, in registration order,
    /// and should not block. A panicking observer is reported to the logger
    /// and does not keep later observers from seeing the line.
    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(&Line) + Send + Sync + 'static,
    {
        self.shared.router.add_observer(Arc::new(observer));
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.shared.router.observer_count()
    }

    /// Whether [`HalfDuplex::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Drop all observers and close the transport.
    ///
    /// Waits for the in-flight request, and any queued ahead of the close,
    /// to settle first. Commands issued afterwards fail with
    /// [`ProtocolError::Closed`]. The transport's close result is returned
    /// unchanged. After a failed close, calling `close` again retries the
    /// transport; once it succeeded, further calls are no-ops.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        // Held for the whole close so concurrent callers see the final outcome
        let mut finished = self.finished.lock().await;
        if *finished {
            return Ok(());
        }
        self.shared.closed.store(true, Ordering::Release);
        self.shared.router.clear_observers();

        if !self.shared.gate.is_closed() {
            let guard = self.shared.gate.acquire().await?;
            self.shared.gate.close();
            guard.release();
        }

        if let Err(e) = self.shared.transport.lock().await.close().await {
            tracing::debug!(error = %e, "transport close failed");
            return Err(ProtocolError::Close(e));
        }
        *finished = true;

        self.stop_reader().await;
        tracing::debug!("engine closed");
        Ok(())
    }

    async fn stop_reader(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
            // Cancellation is the expected outcome
            let _ = reader.await;
        }
    }
}

impl Drop for HalfDuplex {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

/// Read failures in a row, without a line in between, after which the
/// transport is considered gone
const MAX_CONSECUTIVE_READ_ERRORS: usize = 16;

/// Reader task: frame incoming bytes and route every line
async fn read_lines(
    mut lines: LineStream<ByteStream>,
    router: Arc<Router>,
    logger: Option<Arc<dyn Logger>>,
) {
    // FramedRead yields one `None` right after an error, then resumes reading
    let mut errored = false;
    let mut consecutive_errors = 0usize;
    loop {
        match lines.next().await {
            Some(Ok(line)) => {
                consecutive_errors = 0;
                if let Some(logger) = &logger {
                    logger.info(&format!("Serial ← {}", line));
                }
                router.deliver(line);
            }
            // Read failures reach the logger as transport error events
            Some(Err(e)) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    tracing::warn!(error = %e, "transport keeps failing, reader stopped");
                    break;
                }
                tracing::debug!(error = %e, "line stream failed, resuming");
                errored = true;
            }
            None if errored => errored = false,
            None => break,
        }
    }
    tracing::debug!("transport byte stream ended");
}

fn report_transport_event(logger: Option<&dyn Logger>, event: &TransportEvent) {
    match event {
        TransportEvent::Open => {
            tracing::debug!("transport opened");
            if let Some(logger) = logger {
                logger.info("Serial port opened.");
            }
        }
        TransportEvent::Error(e) => {
            tracing::warn!(error = %e, "unhandled transport error");
            if let Some(logger) = logger {
                logger.error(&format!("Unhandled serial error: {}", e));
            }
        }
        TransportEvent::Close => {
            tracing::debug!("transport closed");
            if let Some(logger) = logger {
                logger.info("Serial port closed.");
            }
        }
    }
}
