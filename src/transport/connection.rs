//! Concurrency-safe WebSocket connection.
//!
//! A [`Connection`] decouples application reads and writes from the raw
//! [`Transport`] through two background tasks:
//!
//! - The **writer loop** is the only caller of [`Transport::write_message`].
//!   It drains the outbound queue in FIFO order, so any number of tasks can
//!   call [`Connection::write_message`] without interleaving frames.
//! - The **reader loop** is the only caller of [`Transport::read_message`].
//!   It pushes every result, in arrival order, into the inbound queue that
//!   [`Connection::read_message`] pops from.
//!
//! # Shutdown
//!
//! An explicit [`Connection::close`], a read error and a write error all
//! converge on the same idempotent close: the transport is released once,
//! the shutdown signal fires once, and every blocked writer wakes with an
//! error. The first failure in either direction kills both directions.
//!
//! ```text
//! write_message ──► outbound queue ──► writer loop ──► Transport
//! read_message  ◄── inbound queue  ◄── reader loop ◄── Transport
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::MessageType;

use super::raw::Transport;

// ============================================================================
// Constants
// ============================================================================

/// Number of background loops per connection (reader + writer).
const LOOP_COUNT: usize = 2;

// ============================================================================
// Types
// ============================================================================

/// Result delivered to readers: a message or the terminal read error.
type ReadResult = Result<Message>;

/// A pending write.
struct WriteRequest {
    message: Message,
    /// Completion channel, present only for synchronous handoff.
    ack: Option<oneshot::Sender<Result<()>>>,
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both loops running, queues accepting.
    Open,
    /// Transport released and shutdown fired; loops are exiting.
    Closing,
    /// Both loops have exited.
    Closed,
}

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Queue sizing for a [`Connection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Capacity of the inbound queue.
    ///
    /// `0` is rounded up to `1`.
    pub read_queue_capacity: usize,

    /// Capacity of the outbound queue.
    ///
    /// `0` selects synchronous handoff: [`Connection::write_message`]
    /// returns only after the transport has accepted the message.
    pub write_queue_capacity: usize,
}

impl ConnectionOptions {
    /// Creates options with both capacities set.
    #[inline]
    #[must_use]
    pub const fn new(read_queue_capacity: usize, write_queue_capacity: usize) -> Self {
        Self {
            read_queue_capacity,
            write_queue_capacity,
        }
    }
}

// ============================================================================
// HandshakeInfo
// ============================================================================

/// Details of the opening handshake that produced a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Request target of the upgrade request (path and query).
    pub uri: String,
    /// Negotiated subprotocol, if any.
    pub subprotocol: Option<String>,
}

// ============================================================================
// Shared
// ============================================================================

/// State shared between connection handles and both loops.
struct Shared {
    id: ConnectionId,
    handshake: HandshakeInfo,
    transport: Box<dyn Transport>,
    state: Mutex<ConnectionState>,
    shutdown: watch::Sender<bool>,
    write_error: Mutex<Option<Arc<WsError>>>,
    live_loops: AtomicUsize,
}

impl Shared {
    /// Releases the transport and fires the shutdown signal, once.
    fn close(&self) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Open {
            return;
        }

        *state = ConnectionState::Closing;
        self.transport.close();
        self.shutdown.send_replace(true);

        if self.live_loops.load(Ordering::Acquire) == 0 {
            *state = ConnectionState::Closed;
        }

        debug!(conn = %self.id, "Connection closed");
    }

    /// Records that one loop has exited.
    fn loop_exited(&self) {
        if self.live_loops.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closing {
                *state = ConnectionState::Closed;
            }
            debug!(conn = %self.id, "Connection loops terminated");
        }
    }

    /// Error returned to writers once shutdown has fired.
    fn closed_error(&self) -> Error {
        match self.write_error.lock().as_ref() {
            Some(source) => Error::write_failed(Arc::clone(source)),
            None => Error::ConnectionClosed,
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Resolves once the shutdown signal has fired.
async fn shutdown_fired(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|fired| *fired).await;
}

// ============================================================================
// Connection
// ============================================================================

/// Concurrency-safe WebSocket connection.
///
/// Cloning is cheap and every clone refers to the same connection. Any
/// number of clones may write concurrently; reads are meant for a single
/// consumer and are serialized if several tasks read at once.
///
/// Dropping the last clone ends the writer loop, which closes the
/// connection.
///
/// # Example
///
/// ```ignore
/// let conn = upgrader.upgrade(stream, None).await?;
///
/// while let Ok(message) = conn.read_message().await {
///     conn.write_message(message).await?;
/// }
/// ```
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<WriteRequest>,
    inbound: Arc<AsyncMutex<mpsc::Receiver<ReadResult>>>,
    synchronous: bool,
}

impl Connection {
    /// Wraps a transport and starts the reader and writer loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T: Transport>(transport: T, options: ConnectionOptions) -> Self {
        Self::with_handshake(transport, options, HandshakeInfo::default())
    }

    /// Like [`Connection::new`], attaching handshake details.
    pub fn with_handshake<T: Transport>(
        transport: T,
        options: ConnectionOptions,
        handshake: HandshakeInfo,
    ) -> Self {
        let synchronous = options.write_queue_capacity == 0;
        let (outbound_tx, outbound_rx) = mpsc::channel(options.write_queue_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(options.read_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: ConnectionId::generate(),
            handshake,
            transport: Box::new(transport),
            state: Mutex::new(ConnectionState::Open),
            shutdown,
            write_error: Mutex::new(None),
            live_loops: AtomicUsize::new(LOOP_COUNT),
        });

        debug!(
            conn = %shared.id,
            read_capacity = options.read_queue_capacity,
            write_capacity = options.write_queue_capacity,
            "Connection opened"
        );

        tokio::spawn(Self::run_reader_loop(Arc::clone(&shared), inbound_tx));
        tokio::spawn(Self::run_writer_loop(Arc::clone(&shared), outbound_rx));

        Self {
            shared,
            outbound: outbound_tx,
            inbound: Arc::new(AsyncMutex::new(inbound_rx)),
            synchronous,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Returns the handshake details.
    #[inline]
    #[must_use]
    pub fn handshake(&self) -> &HandshakeInfo {
        &self.shared.handshake
    }

    /// Returns the negotiated subprotocol, if any.
    #[inline]
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.handshake.subprotocol.as_deref()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Returns `true` once shutdown has fired.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Waits until the connection has been closed, for any reason.
    pub async fn closed(&self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        shutdown_fired(&mut shutdown).await;
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// Queues a message for the writer loop.
    ///
    /// Waits for room in the outbound queue, or with a zero-capacity queue
    /// for the transport write itself. Messages accepted by concurrent
    /// callers reach the transport one at a time, in acceptance order.
    ///
    /// # Errors
    ///
    /// - [`Error::WriteFailed`] if the writer loop recorded a transport error
    /// - [`Error::ConnectionClosed`] if the connection closed otherwise
    pub async fn write_message(&self, message: Message) -> Result<()> {
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(self.shared.closed_error());
        }

        let kind = MessageType::of(&message);
        let (ack, acked) = if self.synchronous {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        tokio::select! {
            biased;

            () = shutdown_fired(&mut shutdown) => return Err(self.shared.closed_error()),

            sent = self.outbound.send(WriteRequest { message, ack }) => {
                if sent.is_err() {
                    return Err(self.shared.closed_error());
                }
            }
        }

        trace!(conn = %self.shared.id, ?kind, "Message queued");

        let Some(acked) = acked else {
            return Ok(());
        };

        tokio::select! {
            biased;

            result = acked => result.unwrap_or_else(|_| Err(self.shared.closed_error())),

            () = shutdown_fired(&mut shutdown) => Err(self.shared.closed_error()),
        }
    }

    /// Builds a message from a type tag and payload, then writes it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the payload does not fit the type
    /// - Any error from [`Connection::write_message`]
    pub async fn write_payload(&self, kind: MessageType, payload: Vec<u8>) -> Result<()> {
        let message = kind.message(payload)?;
        self.write_message(message).await
    }

    /// Waits for the next message from the peer.
    ///
    /// Messages are returned in arrival order. A read error is returned
    /// once and closes the connection before it is handed back.
    ///
    /// # Errors
    ///
    /// - [`Error::WebSocket`] with the transport's terminal read error
    /// - [`Error::ConnectionClosed`] once the reader loop has exited and
    ///   the inbound queue is drained
    pub async fn read_message(&self) -> Result<Message> {
        let mut inbound = self.inbound.lock().await;

        match inbound.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => {
                self.shared.close();
                Err(e)
            }
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Closes the connection.
    ///
    /// Idempotent and non-blocking. Releases the transport and wakes every
    /// waiting writer.
    pub fn close(&self) {
        self.shared.close();
    }

    // ========================================================================
    // Background Loops
    // ========================================================================

    /// Moves transport reads into the inbound queue until error or shutdown.
    async fn run_reader_loop(shared: Arc<Shared>, inbound: mpsc::Sender<ReadResult>) {
        let mut shutdown = shared.shutdown.subscribe();

        loop {
            let result = tokio::select! {
                biased;

                () = shutdown_fired(&mut shutdown) => break,

                result = shared.transport.read_message() => result,
            };

            let terminal = result.is_err();
            match &result {
                Ok(message) => {
                    trace!(conn = %shared.id, kind = ?MessageType::of(message), "Message received");
                }
                Err(e) => debug!(conn = %shared.id, error = %e, "Transport read failed"),
            }

            tokio::select! {
                biased;

                () = shutdown_fired(&mut shutdown) => break,

                sent = inbound.send(result.map_err(Error::from)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }

            if terminal {
                break;
            }
        }

        drop(inbound);
        debug!(conn = %shared.id, "Reader loop terminated");

        shared.close();
        shared.loop_exited();
    }

    /// Drains the outbound queue into the transport until error or shutdown.
    async fn run_writer_loop(shared: Arc<Shared>, mut outbound: mpsc::Receiver<WriteRequest>) {
        let mut shutdown = shared.shutdown.subscribe();

        loop {
            let request = tokio::select! {
                biased;

                () = shutdown_fired(&mut shutdown) => break,

                request = outbound.recv() => match request {
                    Some(request) => request,
                    None => {
                        debug!(conn = %shared.id, "All connection handles dropped");
                        break;
                    }
                },
            };

            let kind = MessageType::of(&request.message);

            match shared.transport.write_message(request.message).await {
                Ok(()) => {
                    trace!(conn = %shared.id, ?kind, "Message written");
                    if let Some(ack) = request.ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(e) => {
                    warn!(conn = %shared.id, error = %e, "Transport write failed");

                    let source = Arc::new(e);
                    *shared.write_error.lock() = Some(Arc::clone(&source));
                    shared.close();

                    if let Some(ack) = request.ack {
                        let _ = ack.send(Err(Error::write_failed(source)));
                    }
                    break;
                }
            }
        }

        drop(outbound);
        debug!(conn = %shared.id, "Writer loop terminated");

        shared.close();
        shared.loop_exited();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("synchronous", &self.synchronous)
            .field("handshake", &self.shared.handshake)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
