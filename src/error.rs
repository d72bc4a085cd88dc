//! Error types for safe-websocket.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use safe_websocket::{Connection, Result};
//!
//! async fn echo(conn: &Connection) -> Result<()> {
//!     let message = conn.read_message().await?;
//!     conn.write_message(message).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidArgument`] |
//! | Handshake | [`Error::HandshakeTimeout`], [`Error::WebSocket`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::WriteFailed`], [`Error::WebSocket`] |
//! | External | [`Error::Io`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when upgrader configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Invalid argument.
    ///
    /// Returned when a message payload does not fit its message type.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// The opening handshake did not complete in time.
    #[error("Handshake timeout after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection is closed.
    ///
    /// Returned by operations issued after shutdown when no transport
    /// write error was recorded.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A transport write failed and the connection was torn down.
    ///
    /// Every writer that observes the shutdown receives the same
    /// underlying error.
    #[error("Write failed: {source}")]
    WriteFailed {
        /// The recorded transport error.
        #[source]
        source: Arc<WsError>,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// WebSocket error from the underlying transport.
    ///
    /// Covers handshake failures and terminal read errors.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a handshake timeout error.
    #[inline]
    pub fn handshake_timeout(timeout_ms: u64) -> Self {
        Self::HandshakeTimeout { timeout_ms }
    }

    /// Creates a write failure error from a recorded transport error.
    #[inline]
    pub fn write_failed(source: Arc<WsError>) -> Self {
        Self::WriteFailed { source }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. })
    }

    /// Returns `true` if this error means the connection is unusable.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::WriteFailed { .. } | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
