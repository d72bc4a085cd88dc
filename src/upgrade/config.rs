//! Upgrader configuration.
//!
//! [`UpgraderConfig`] is plain data and can be loaded from JSON. Strategy
//! functions (origin check, error responder) are set on the
//! [`UpgraderBuilder`](super::UpgraderBuilder) instead.
//!
//! # Example
//!
//! ```ignore
//! use safe_websocket::UpgraderConfig;
//!
//! let config = UpgraderConfig::from_json(r#"{
//!     "handshake_timeout_ms": 10000,
//!     "subprotocols": ["chat.v2", "chat.v1"],
//!     "write_queue_capacity": 64
//! }"#)?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::error::{Error, Result};
use crate::transport::ConnectionOptions;

// ============================================================================
// UpgraderConfig
// ============================================================================

/// Configuration applied by an [`Upgrader`](super::Upgrader).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgraderConfig {
    /// Time allowed for the opening handshake. `None` or `0` waits forever.
    pub handshake_timeout_ms: Option<u64>,

    /// Read buffer size in bytes. `0` uses the library default.
    ///
    /// Buffer sizes do not limit message sizes.
    pub read_buffer_size: usize,

    /// Write buffer size in bytes. `0` uses the library default.
    pub write_buffer_size: usize,

    /// Upper bound of buffered outgoing bytes before writes fail.
    pub max_write_buffer_size: Option<usize>,

    /// Largest incoming message accepted, in bytes.
    pub max_message_size: Option<usize>,

    /// Supported subprotocols in order of preference.
    pub subprotocols: Vec<String>,

    /// Whether to attempt per-message compression (RFC 7692).
    ///
    /// Offers are currently logged and declined.
    pub enable_compression: bool,

    /// Capacity of each connection's inbound queue.
    pub read_queue_capacity: usize,

    /// Capacity of each connection's outbound queue. `0` is synchronous.
    pub write_queue_capacity: usize,
}

impl UpgraderConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if validation fails
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values the WebSocket library would otherwise panic on or
    /// reject at handshake time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if let Some(max) = self.max_write_buffer_size {
            let write_buffer = self.websocket_config().write_buffer_size;
            if write_buffer >= max {
                return Err(Error::config(format!(
                    "max_write_buffer_size ({max}) must be greater than write_buffer_size ({write_buffer})"
                )));
            }
        }

        if self.max_message_size == Some(0) {
            return Err(Error::config("max_message_size must be greater than 0"));
        }

        for protocol in &self.subprotocols {
            let is_token = !protocol.is_empty()
                && !protocol.contains(|c: char| c == ',' || c.is_whitespace())
                && HeaderValue::from_str(protocol).is_ok();
            if !is_token {
                return Err(Error::config(format!("invalid subprotocol: {protocol:?}")));
            }
        }

        Ok(())
    }

    /// Returns the handshake timeout, if one applies.
    #[must_use]
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Translates buffer settings into the tungstenite configuration.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();

        if self.read_buffer_size > 0 {
            config.read_buffer_size = self.read_buffer_size;
        }
        if self.write_buffer_size > 0 {
            config.write_buffer_size = self.write_buffer_size;
        }
        if let Some(max) = self.max_write_buffer_size {
            config.max_write_buffer_size = max;
        }
        if let Some(max) = self.max_message_size {
            config.max_message_size = Some(max);
        }

        config
    }

    /// Returns queue sizing for connections created by the upgrader.
    #[inline]
    #[must_use]
    pub const fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::new(self.read_queue_capacity, self.write_queue_capacity)
    }
}

// ============================================================================
// Tests
// ============================================================================
