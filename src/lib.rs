//! safe-websocket - Concurrency-safe WebSocket connections.
//!
//! This library wraps a WebSocket so that any number of tasks can write to
//! it without racing on the socket, while reads arrive through a single
//! ordered queue.
//!
//! # Architecture
//!
//! Each [`Connection`] owns two background tasks:
//!
//! - **Writer loop**: the only task that ever writes to the socket. Writes
//!   from all callers are queued and sent one at a time, in order.
//! - **Reader loop**: the only task that ever reads from the socket.
//!   Messages are queued in arrival order for [`Connection::read_message`].
//!
//! Key design principles:
//!
//! - Closing is idempotent and can be triggered by the application, a read
//!   error or a write error
//! - A failure in either direction closes both (fate-sharing)
//! - Blocked callers always wake with an error when the connection closes
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//!
//! use safe_websocket::{Result, UpgradeListener, Upgrader};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let upgrader = Upgrader::builder()
//!         .subprotocols(["echo"])
//!         .write_queue_capacity(32)
//!         .build()?;
//!
//!     let listener =
//!         UpgradeListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 9001, Arc::new(upgrader)).await?;
//!
//!     loop {
//!         let pending = listener.accept().await?;
//!         tokio::spawn(async move {
//!             let Ok(conn) = pending.upgrade().await else {
//!                 return;
//!             };
//!             while let Ok(message) = conn.read_message().await {
//!                 if conn.write_message(message).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Message type tags |
//! | [`transport`] | Connection wrapper, transport trait, listener |
//! | [`upgrade`] | Handshake configuration and [`Upgrader`] |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Message type tags.
pub mod protocol;

/// WebSocket transport layer.
///
/// Connection wrapper, raw transport abstraction and TCP listener.
pub mod transport;

/// HTTP-to-WebSocket upgrade.
///
/// Use [`Upgrader::builder()`] to create a configured upgrader.
pub mod upgrade;

// ============================================================================
// Re-exports
// ============================================================================

// Transport types
pub use transport::{
    Connection, ConnectionOptions, ConnectionState, HandshakeInfo, PendingUpgrade, Transport,
    UpgradeListener, WsTransport,
};

// Upgrade types
pub use upgrade::{ErrorResponder, OriginCheck, Upgrader, UpgraderBuilder, UpgraderConfig};

// Protocol types
pub use protocol::MessageType;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::ConnectionId;

// Underlying message type
pub use tokio_tungstenite::tungstenite::Message;
