//! The `Socket` abstraction exposed to embedders once a connection is established, and the event stream it emits.
//!
//! Reads are pushed onto a channel by a background task, writes go straight through, and closing
//! either half is cheap and idempotent.

use crate::error::{Error, Result};
use bytes::Bytes;
use scoped_task::ScopedJoinHandle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// One event on a [`Socket`]'s lifecycle.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Open,
    Connect,
    Data(Bytes),
    End,
    Close,
    Error(String),
}

const EVENT_BUFFER: usize = 128;

/// A live, end-to-end encrypted application stream to a remote peer.
///
/// `write`/`end`/`close` are plain async methods; inbound events arrive on [`Socket::events`], an
/// ordinary stream rather than a callback, the idiomatic Rust shape for what would otherwise be
/// `onopen`/`onconnect`/`ondata`/`onend`/`onclose`/`onerror` handlers.
pub struct Socket {
    sink: SocketSink,
    events: ReceiverStream<SocketEvent>,
    // Kept alive for as long as the socket is; dropping it aborts the background read loop that
    // feeds `events`.
    _reader: Option<ScopedJoinHandle<()>>,
}

impl Socket {
    pub(crate) fn new(sink: SocketSink, receiver: mpsc::Receiver<SocketEvent>) -> Self {
        Self {
            sink,
            events: ReceiverStream::new(receiver),
            _reader: None,
        }
    }

    pub(crate) fn with_reader(
        sink: SocketSink,
        receiver: mpsc::Receiver<SocketEvent>,
        reader: ScopedJoinHandle<()>,
    ) -> Self {
        Self {
            sink,
            events: ReceiverStream::new(receiver),
            _reader: Some(reader),
        }
    }

    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        self.sink.write(data).await
    }

    /// Half-closes the write side without tearing down the read side.
    pub async fn end(&mut self) -> Result<()> {
        self.sink.end().await
    }

    /// Closes both halves immediately.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await
    }

    pub fn events(&mut self) -> &mut ReceiverStream<SocketEvent> {
        &mut self.events
    }
}

/// The write half of a [`Socket`], generic over whatever [`crate::rpc::AsyncByteStream`] the
/// embedder's transport produced.
pub struct SocketSink {
    inner: Box<dyn WriteHalf>,
    closed: bool,
}

impl SocketSink {
    pub fn new(inner: Box<dyn WriteHalf>) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.inner.write(data).await
    }

    pub async fn end(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.inner.close().await
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close().await
    }
}

/// Object-safe write half, letting [`SocketSink`] hold any transport's stream behind one vtable.
#[async_trait::async_trait]
pub trait WriteHalf: Send + Sync + 'static {
    async fn write(&mut self, data: Bytes) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

pub(crate) fn event_channel() -> (mpsc::Sender<SocketEvent>, mpsc::Receiver<SocketEvent>) {
    mpsc::channel(EVENT_BUFFER)
}
