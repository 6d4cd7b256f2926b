//! Virtual Port - in-memory serial device for testing
//!
//! [`VirtualPort`] is the transport half handed to the engine; [`VirtualDevice`]
//! plays the far side. The device sees every drained command and can answer
//! with arbitrary bytes at arbitrary times, which makes timing-sensitive
//! behavior reproducible without hardware.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use crate::protocol::{
    ByteStream, EventListener, EventListeners, EventedReader, Transport, TransportEvent,
    WRITE_HIGH_WATER_MARK,
};

/// Size of the in-memory pipe from device to port
const PIPE_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Faults {
    fail_next_read: AtomicBool,
    fail_writes: AtomicBool,
    fail_close: AtomicBool,
    closed: AtomicBool,
}

/// Transport side of a virtual serial link
pub struct VirtualPort {
    incoming: Option<DuplexStream>,
    pending: BytesMut,
    commands: mpsc::UnboundedSender<Bytes>,
    listeners: EventListeners,
    faults: Arc<Faults>,
}

/// Device side of a virtual serial link
pub struct VirtualDevice {
    outgoing: DuplexStream,
    commands: mpsc::UnboundedReceiver<Bytes>,
    listeners: EventListeners,
    faults: Arc<Faults>,
}

impl VirtualPort {
    /// Create a connected port/device pair
    pub fn pair() -> (VirtualPort, VirtualDevice) {
        let (port_side, device_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let listeners = EventListeners::new();
        let faults = Arc::new(Faults::default());

        let port = VirtualPort {
            incoming: Some(port_side),
            pending: BytesMut::new(),
            commands: command_tx,
            listeners: listeners.clone(),
            faults: faults.clone(),
        };
        let device = VirtualDevice {
            outgoing: device_side,
            commands: command_rx,
            listeners,
            faults,
        };
        (port, device)
    }
}

#[async_trait]
impl Transport for VirtualPort {
    fn subscribe(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    fn byte_stream(&mut self) -> Option<ByteStream> {
        let incoming = FaultyRead {
            inner: self.incoming.take()?,
            faults: self.faults.clone(),
        };
        Some(Box::new(EventedReader::new(incoming, self.listeners.clone())))
    }

    fn write(&mut self, data: &[u8]) -> io::Result<bool> {
        if self.faults.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port is closed"));
        }
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated write failure"));
        }
        self.pending.extend_from_slice(data);
        Ok(self.pending.len() < WRITE_HIGH_WATER_MARK)
    }

    async fn drain(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let command = self.pending.split().freeze();
        // Nobody listening on the device side is not an error for the port
        let _ = self.commands.send(command);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.faults.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated close failure"));
        }
        self.faults.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
        self.listeners.emit(&TransportEvent::Close);
        Ok(())
    }
}

/// Incoming pipe that can be told to fail one read
struct FaultyRead {
    inner: DuplexStream,
    faults: Arc<Faults>,
}

impl AsyncRead for FaultyRead {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.faults.fail_next_read.swap(false, Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::other("simulated read failure")));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl VirtualDevice {
    /// Wait for the next drained command. `None` once the port is gone.
    pub async fn next_command(&mut self) -> Option<Bytes> {
        self.commands.recv().await
    }

    /// Next drained command, if one is already waiting
    pub fn try_next_command(&mut self) -> Option<Bytes> {
        self.commands.try_recv().ok()
    }

    /// Write raw bytes towards the port
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.outgoing.write_all(data).await
    }

    /// Write raw bytes towards the port after `delay`
    pub async fn send_after(&mut self, delay: Duration, data: &[u8]) -> io::Result<()> {
        tokio::time::sleep(delay).await;
        self.send(data).await
    }

    /// Raise a lifecycle event on the port's subscribers
    pub fn emit(&self, event: TransportEvent) {
        self.listeners.emit(&event);
    }

    /// Make the port's next read fail once.
    ///
    /// Takes effect the next time the port reads, e.g. when bytes arrive.
    pub fn fail_next_read(&self) {
        self.faults.fail_next_read.store(true, Ordering::SeqCst);
    }

    /// Make every following write fail
    pub fn fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next close fail
    pub fn fail_close(&self, fail: bool) {
        self.faults.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Whether the port side has been closed
    pub fn is_closed(&self) -> bool {
        self.faults.closed.load(Ordering::SeqCst)
    }

    /// Answer commands until the port goes away.
    ///
    /// `respond` maps each command to the raw bytes to send back, written
    /// `delay` after the command was drained. Returning `None` stays silent.
    pub async fn serve<F>(mut self, delay: Duration, mut respond: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>>,
    {
        while let Some(command) = self.next_command().await {
            let Some(reply) = respond(&command) else {
                continue;
            };
            if let Err(e) = self.send_after(delay, &reply).await {
                tracing::debug!(error = %e, "virtual device stopped answering");
                break;
            }
        }
    }
}
