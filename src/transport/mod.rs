//! WebSocket transport layer.
//!
//! This module wraps a raw WebSocket into a connection that many tasks can
//! write to and one task reads from.
//!
//! # Architecture
//!
//! ```text
//!  producers ──write_message──►┌──────────────┐
//!                              │  Connection  │   writer loop ──► ┌───────────┐
//!                              │              │                   │ Transport │◄──► peer
//!  consumer ◄──read_message────│  queues +    │   reader loop ◄── └───────────┘
//!                              │  shutdown    │
//!                              └──────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `UpgradeListener::bind` - Bind a TCP listener
//! 2. `UpgradeListener::accept` - Accept a socket
//! 3. `PendingUpgrade::upgrade` - Run the handshake in its own task
//! 4. `Connection` - Read and write messages from any task
//! 5. `Connection::close` - Or any transport error; both directions end
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Connection wrapper and its reader/writer loops |
//! | `raw` | Transport trait and the tungstenite implementation |
//! | `server` | TCP listener that upgrades accepted sockets |

// ============================================================================
// Submodules
// ============================================================================

/// Connection wrapper and background loops.
pub mod connection;

/// Raw transport abstraction.
pub mod raw;

/// WebSocket listener.
pub mod server;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, ConnectionOptions, ConnectionState, HandshakeInfo};
pub use raw::{Transport, WsTransport};
pub use server::{PendingUpgrade, UpgradeListener};
