//! Raw transport abstraction.
//!
//! A [`Transport`] is the full-duplex message pipe underneath a
//! [`Connection`](super::Connection). It is not required to support
//! concurrent writers: the connection guarantees that only its writer loop
//! calls [`Transport::write_message`] and only its reader loop calls
//! [`Transport::read_message`].
//!
//! [`WsTransport`] implements the trait for any tungstenite
//! [`WebSocketStream`].

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::trace;

// ============================================================================
// Transport
// ============================================================================

/// Raw message transport.
///
/// Reads and writes may run concurrently with each other, but the caller
/// never issues two writes (or two reads) at once.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Waits for the next message from the peer.
    async fn read_message(&self) -> Result<Message, WsError>;

    /// Sends one message to the peer.
    async fn write_message(&self, message: Message) -> Result<(), WsError>;

    /// Releases the transport.
    ///
    /// Must not block. In-flight and later reads/writes fail afterwards.
    fn close(&self);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn read_message(&self) -> Result<Message, WsError> {
        (**self).read_message().await
    }

    async fn write_message(&self, message: Message) -> Result<(), WsError> {
        (**self).write_message(message).await
    }

    fn close(&self) {
        (**self).close();
    }
}

// ============================================================================
// WsTransport
// ============================================================================

/// [`Transport`] over a tungstenite WebSocket stream.
///
/// The stream is split into halves so a read and a write can be in flight
/// at the same time. Closing aborts in-flight I/O with
/// [`WsError::AlreadyClosed`] and drops both halves, which closes the
/// socket. A half that is busy is dropped as soon as its operation returns
/// or is cancelled.
pub struct WsTransport<S> {
    reader: Mutex<Option<SplitStream<WebSocketStream<S>>>>,
    writer: Mutex<Option<SplitSink<WebSocketStream<S>, Message>>>,
    closed: watch::Sender<bool>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket stream.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (writer, reader) = stream.split();
        let (closed, _) = watch::channel(false);

        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
        }
    }

    /// Resolves once [`Transport::close`] has been called.
    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Returns `true` once both halves have been dropped.
    pub fn is_released(&self) -> bool {
        let reader_gone = self.reader.try_lock().is_ok_and(|half| half.is_none());
        let writer_gone = self.writer.try_lock().is_ok_and(|half| half.is_none());
        reader_gone && writer_gone
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_message(&self) -> Result<Message, WsError> {
        if self.is_closed() {
            return Err(WsError::AlreadyClosed);
        }

        let mut lease = HalfLease::acquire(&self.reader, &self.closed).await;
        let Some(reader) = lease.half() else {
            return Err(WsError::AlreadyClosed);
        };

        tokio::select! {
            biased;

            () = self.wait_closed() => Err(WsError::AlreadyClosed),

            message = reader.next() => match message {
                Some(result) => result,
                None => Err(WsError::ConnectionClosed),
            },
        }
    }

    async fn write_message(&self, message: Message) -> Result<(), WsError> {
        if self.is_closed() {
            return Err(WsError::AlreadyClosed);
        }

        let mut lease = HalfLease::acquire(&self.writer, &self.closed).await;
        let Some(writer) = lease.half() else {
            return Err(WsError::AlreadyClosed);
        };

        tokio::select! {
            biased;

            () = self.wait_closed() => Err(WsError::AlreadyClosed),

            result = writer.send(message) => result,
        }
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            trace!("WebSocket transport closed");
        }

        release(&self.reader);
        release(&self.writer);
    }
}

// ============================================================================
// HalfLease
// ============================================================================

/// Exclusive use of one stream half for a single read or write.
///
/// On drop, including cancellation, the lock is released first and the
/// half is then dropped if the transport has been closed meanwhile. `close`
/// sets the flag before trying the lock, so one of the two sides always
/// sees the other.
struct HalfLease<'a, T> {
    slot: &'a Mutex<Option<T>>,
    closed: &'a watch::Sender<bool>,
    guard: Option<MutexGuard<'a, Option<T>>>,
}

impl<'a, T> HalfLease<'a, T> {
    async fn acquire(slot: &'a Mutex<Option<T>>, closed: &'a watch::Sender<bool>) -> Self {
        let guard = slot.lock().await;
        Self {
            slot,
            closed,
            guard: Some(guard),
        }
    }

    fn half(&mut self) -> Option<&mut T> {
        self.guard.as_deref_mut()?.as_mut()
    }
}

impl<T> Drop for HalfLease<'_, T> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if *self.closed.borrow() {
            release(self.slot);
        }
    }
}

/// Drops a half unless it is in use.
fn release<T>(slot: &Mutex<Option<T>>) {
    if let Ok(mut half) = slot.try_lock() {
        half.take();
    }
}

// ============================================================================
// Tests
// ============================================================================
