//! Transport capability
//!
//! The engine talks to an already-open, byte-oriented channel only through
//! [`Transport`]. Serial ports implement it in [`super::serial`], tests use
//! [`crate::virtual_port::VirtualPort`].

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Raw incoming bytes of a transport
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Lifecycle events reported by a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// The channel finished opening
    Open,
    /// Read or device failure not tied to a particular call
    Error(io::Error),
    /// The channel closed, locally or from the far side
    Close,
}

/// Callback for transport events
pub type EventListener = Box<dyn Fn(&TransportEvent) + Send + Sync>;

/// Abstraction over an open duplex byte channel
#[async_trait]
pub trait Transport: Send + 'static {
    /// Register a lifecycle listener
    fn subscribe(&mut self, listener: EventListener);

    /// Take the incoming byte stream. The stream can be taken only once.
    fn byte_stream(&mut self) -> Option<ByteStream>;

    /// Queue bytes for transmission.
    ///
    /// Returns `false` when the transport's buffer is above its high-water
    /// mark; the bytes are still queued.
    fn write(&mut self, data: &[u8]) -> io::Result<bool>;

    /// Wait until every queued byte has been handed to the device
    async fn drain(&mut self) -> io::Result<()>;

    /// Close the channel
    async fn close(&mut self) -> io::Result<()>;
}

/// Listener list shared between a transport and its byte stream
#[derive(Clone, Default)]
pub struct EventListeners {
    inner: Arc<Mutex<Vec<EventListener>>>,
}

impl EventListeners {
    /// Empty listener list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn push(&self, listener: EventListener) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Deliver `event` to every listener, in subscription order
    pub fn emit(&self, event: &TransportEvent) {
        let listeners = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(event);
        }
    }

    /// Number of listeners
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("len", &self.len())
            .finish()
    }
}

/// Reader wrapper that reports read failures as [`TransportEvent::Error`]
/// and end of stream as a single [`TransportEvent::Close`]
pub struct EventedReader<R> {
    inner: R,
    listeners: EventListeners,
    closed: bool,
}

impl<R> EventedReader<R> {
    /// Wrap `inner`, reporting to `listeners`
    pub fn new(inner: R, listeners: EventListeners) -> Self {
        Self {
            inner,
            listeners,
            closed: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EventedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let eof = buf.filled().len() == before && buf.remaining() > 0;
                if eof && !this.closed {
                    this.closed = true;
                    this.listeners.emit(&TransportEvent::Close);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                let event = TransportEvent::Error(io::Error::new(e.kind(), e.to_string()));
                this.listeners.emit(&event);
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
