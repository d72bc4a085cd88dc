//! Echo server.
//!
//! Demonstrates:
//! - Building an Upgrader with subprotocols and queue sizing
//! - Accepting connections with UpgradeListener
//! - Reading and writing from separate tasks on one connection
//!
//! Usage:
//!   cargo run --example echo_server
//!   cargo run --example echo_server -- --debug
//!   cargo run --example echo_server -- --port 9001

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use safe_websocket::{Connection, Error, Message, UpgradeListener, Upgrader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Arguments
// ============================================================================

/// Command-line arguments.
#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    port: u16,
}

impl Args {
    /// Parse command-line arguments.
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let port = args
            .iter()
            .position(|a| a == "--port")
            .and_then(|i| args.get(i + 1))
            .and_then(|p| p.parse().ok())
            .unwrap_or(9001);

        Self {
            debug: args.iter().any(|a| a == "--debug"),
            port,
        }
    }
}

/// Initialize tracing/logging.
fn init_logging(debug: bool) {
    let filter = if debug {
        "safe_websocket=trace,echo_server=debug"
    } else {
        "safe_websocket=info,echo_server=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let upgrader = Upgrader::builder()
        .handshake_timeout(Duration::from_secs(10))
        .subprotocols(["echo"])
        .read_queue_capacity(16)
        .write_queue_capacity(16)
        .allow_any_origin()
        .build()?;

    let listener =
        UpgradeListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), args.port, Arc::new(upgrader))
            .await?;
    info!(url = %listener.ws_url(), "Echo server listening");

    loop {
        match listener.accept().await {
            Ok(pending) => {
                tokio::spawn(async move {
                    let peer = pending.peer_addr();
                    match pending.upgrade().await {
                        Ok(conn) => echo(conn).await,
                        Err(e) => warn!(%peer, error = %e, "Upgrade failed"),
                    }
                });
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
}

/// Echoes data messages back until the peer goes away.
///
/// A second task pings the peer on the same connection meanwhile.
async fn echo(conn: Connection) {
    let id = conn.id();

    let pinger = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                if conn.write_message(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        })
    };

    loop {
        match conn.read_message().await {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                if let Err(e) = conn.write_message(message).await {
                    warn!(conn = %id, error = %e, "Echo failed");
                    break;
                }
            }
            Ok(_) => {}
            Err(Error::ConnectionClosed) => break,
            Err(e) => {
                info!(conn = %id, error = %e, "Peer disconnected");
                break;
            }
        }
    }

    conn.close();
    let _ = pinger.await;
}
