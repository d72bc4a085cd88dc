//! HTTP-to-WebSocket upgrade.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `config` | Serializable upgrader configuration |
//! | `policy` | Origin check, subprotocol selection, error responses |
//! | `upgrader` | Handshake and connection construction |

// ============================================================================
// Submodules
// ============================================================================

/// Upgrader configuration.
pub mod config;

/// Handshake policies and their defaults.
pub mod policy;

/// Upgrader and its builder.
pub mod upgrader;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::UpgraderConfig;
pub use policy::{ErrorResponder, OriginCheck};
pub use upgrader::{Upgrader, UpgraderBuilder};
