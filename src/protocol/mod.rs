//! WebSocket message types.
//!
//! Messages themselves are tungstenite [`Message`](tokio_tungstenite::tungstenite::Message)
//! values; this module adds the integer type-tag view over them.
//!
//! | Tag | Type | Kind |
//! |-----|------|------|
//! | 1 | `Text` | data |
//! | 2 | `Binary` | data |
//! | 8 | `Close` | control |
//! | 9 | `Ping` | control |
//! | 10 | `Pong` | control |

// ============================================================================
// Submodules
// ============================================================================

/// Message type tags.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::MessageType;
