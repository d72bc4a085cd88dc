//! WebSocket listener.
//!
//! Binds a TCP listener and hands out accepted sockets as
//! [`PendingUpgrade`]s, which run the handshake through an [`Upgrader`].
//!
//! # Connection Flow
//!
//! 1. [`UpgradeListener::bind`] binds to an address (port 0 picks one)
//! 2. [`UpgradeListener::accept`] takes a TCP connection, nothing is read yet
//! 3. [`PendingUpgrade::upgrade`] runs the handshake, usually in a spawned task
//! 4. The returned [`Connection`] has its reader and writer loops running
//!
//! Accepting never waits on a client's upgrade request, so a client that
//! connects and stays silent only holds up its own task.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tracing::{debug, info};

use crate::error::Result;
use crate::upgrade::Upgrader;

use super::Connection;

// ============================================================================
// UpgradeListener
// ============================================================================

/// A bound TCP listener that yields sockets awaiting their upgrade.
///
/// # Example
///
/// ```ignore
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::sync::Arc;
/// use safe_websocket::{UpgradeListener, Upgrader};
///
/// let upgrader = Arc::new(Upgrader::builder().build()?);
/// let listener = UpgradeListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, upgrader).await?;
/// println!("listening on {}", listener.ws_url());
///
/// loop {
///     let pending = listener.accept().await?;
///     tokio::spawn(async move {
///         let conn = pending.upgrade().await?;
///         /* use conn */
///     });
/// }
/// ```
pub struct UpgradeListener {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    /// Handshake configuration shared by all accepted sockets.
    upgrader: Arc<Upgrader>,
}

impl UpgradeListener {
    /// Binds to the specified address and port.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if binding fails.
    pub async fn bind(ip: IpAddr, port: u16, upgrader: Arc<Upgrader>) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        debug!(port = local_addr.port(), "WebSocket listener bound");

        Ok(Self {
            listener,
            local_addr,
            upgrader,
        })
    }

    /// Returns the port the listener is bound to.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL for this listener.
    ///
    /// Format: `ws://{ip}:{port}`
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Returns the upgrader used for handshakes.
    #[inline]
    #[must_use]
    pub fn upgrader(&self) -> &Arc<Upgrader> {
        &self.upgrader
    }

    /// Accepts one TCP connection without reading from it.
    ///
    /// Run the handshake with [`PendingUpgrade::upgrade`], typically in a
    /// spawned task so the accept loop keeps going.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if accepting fails.
    pub async fn accept(&self) -> Result<PendingUpgrade> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

        debug!(%peer_addr, "TCP connection accepted");

        Ok(PendingUpgrade {
            stream,
            peer_addr,
            upgrader: Arc::clone(&self.upgrader),
        })
    }
}

// ============================================================================
// PendingUpgrade
// ============================================================================

/// An accepted TCP connection whose handshake has not run yet.
pub struct PendingUpgrade {
    stream: TcpStream,
    peer_addr: SocketAddr,
    upgrader: Arc<Upgrader>,
}

impl PendingUpgrade {
    /// Returns the remote address.
    #[inline]
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Runs the handshake.
    ///
    /// # Errors
    ///
    /// Any error from [`Upgrader::upgrade`].
    pub async fn upgrade(self) -> Result<Connection> {
        self.run(None).await
    }

    /// Runs the handshake, adding headers to the success response.
    ///
    /// # Errors
    ///
    /// Any error from [`Upgrader::upgrade`].
    pub async fn upgrade_with_headers(self, headers: &HeaderMap) -> Result<Connection> {
        self.run(Some(headers)).await
    }

    async fn run(self, headers: Option<&HeaderMap>) -> Result<Connection> {
        let connection = self.upgrader.upgrade(self.stream, headers).await?;

        info!(
            peer = %self.peer_addr,
            conn = %connection.id(),
            "WebSocket connection established"
        );

        Ok(connection)
    }
}

impl std::fmt::Debug for PendingUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingUpgrade")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::ConnectionState;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    async fn bind_local() -> UpgradeListener {
        let upgrader = Arc::new(Upgrader::builder().build().expect("valid config"));
        UpgradeListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, upgrader)
            .await
            .expect("bind should succeed")
    }

    #[tokio::test]
    async fn test_bind_random_port() {
        let listener = bind_local().await;

        assert!(listener.port() > 0);
        assert_eq!(listener.local_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            listener.ws_url(),
            format!("ws://127.0.0.1:{}", listener.port())
        );
    }

    #[tokio::test]
    async fn test_accept_upgrades_connection() {
        let listener = bind_local().await;
        let url = listener.ws_url();

        let client = tokio::spawn(async move {
            let (mut ws, _) = connect_async(url).await.expect("client handshake");
            ws.send(Message::Binary(vec![7, 8, 9].into())).await.unwrap();
            ws.next().await.expect("reply").expect("ok")
        });

        let pending = listener.accept().await.expect("accept");
        assert_eq!(pending.peer_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let conn = pending.upgrade().await.expect("upgrade");
        let message = conn.read_message().await.expect("read");
        assert_eq!(message, Message::Binary(vec![7, 8, 9].into()));

        conn.write_message(Message::Text("ack".into())).await.expect("write");
        assert_eq!(client.await.unwrap(), Message::Text("ack".into()));
    }

    #[tokio::test]
    async fn test_upgrade_with_headers() {
        let listener = bind_local().await;
        let url = listener.ws_url();

        let client = tokio::spawn(async move {
            let (_ws, response) = connect_async(url).await.expect("client handshake");
            response.headers().get("x-session").cloned()
        });

        let mut headers = HeaderMap::new();
        headers.insert("x-session", HeaderValue::from_static("42"));
        let pending = listener.accept().await.expect("accept");
        let _conn = pending.upgrade_with_headers(&headers).await.expect("upgrade");

        assert_eq!(client.await.unwrap().unwrap(), "42");
    }

    #[tokio::test]
    async fn test_silent_client_does_not_block_accept() {
        let listener = bind_local().await;
        let url = listener.ws_url();

        let _silent = TcpStream::connect(listener.local_addr()).await.expect("connect");
        let stalled = listener.accept().await.expect("accept silent socket");
        let stalled = tokio::spawn(stalled.upgrade());

        let client = tokio::spawn(async move {
            let (mut ws, _) = connect_async(url).await.expect("client handshake");
            ws.send(Message::Text("hi".into())).await.unwrap();
        });

        let conn = tokio::time::timeout(Duration::from_secs(2), async {
            listener.accept().await?.upgrade().await
        })
        .await
        .expect("second client must not wait on the silent one")
        .expect("upgrade");

        assert_eq!(conn.read_message().await.unwrap(), Message::Text("hi".into()));
        client.await.unwrap();
        assert!(!stalled.is_finished());
        stalled.abort();
    }

    #[tokio::test]
    async fn test_close_releases_socket_while_handles_live() {
        let listener = bind_local().await;
        let url = listener.ws_url();

        let client = tokio::spawn(async move {
            let (ws, _) = connect_async(url).await.expect("client handshake");
            ws
        });

        let conn = listener.accept().await.unwrap().upgrade().await.expect("upgrade");
        let mut ws = client.await.unwrap();
        let other = conn.clone();

        conn.close();
        assert!(other.is_closed());

        let observed = tokio::time::timeout(Duration::from_secs(2), ws.next()).await;
        assert!(observed.is_ok(), "peer should see the socket close");
        assert!(!matches!(observed, Ok(Some(Ok(Message::Text(_) | Message::Binary(_))))));

        tokio::time::timeout(Duration::from_secs(2), async {
            while conn.state() != ConnectionState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loops should exit");
        drop(other);
    }
}
