//! HTTP-to-WebSocket upgrade.
//!
//! An [`Upgrader`] answers the opening handshake on an accepted stream,
//! then wraps the resulting WebSocket in a [`Connection`] whose reader and
//! writer loops are already running.
//!
//! The handshake itself (request validation, accept key, framing) is done
//! by tokio-tungstenite. The upgrader layers origin checking, subprotocol
//! selection and extra response headers on top.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use safe_websocket::Upgrader;
//!
//! let upgrader = Upgrader::builder()
//!     .handshake_timeout(Duration::from_secs(10))
//!     .subprotocols(["chat.v2", "chat.v1"])
//!     .write_queue_capacity(64)
//!     .build()?;
//!
//! let (stream, _) = listener.accept().await?;
//! let conn = upgrader.upgrade(stream, None).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::result::Result as StdResult;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{
    ORIGIN, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::{Connection, HandshakeInfo, WsTransport};

use super::config::UpgraderConfig;
use super::policy::{self, ErrorResponder, OriginCheck};

// ============================================================================
// Upgrader
// ============================================================================

/// Upgrades HTTP requests to WebSocket [`Connection`]s.
///
/// An upgrader is immutable once built and can serve any number of
/// handshakes concurrently.
pub struct Upgrader {
    config: UpgraderConfig,
    check_origin: OriginCheck,
    error_responder: ErrorResponder,
    /// Derived from `config` on first use.
    websocket_config: OnceLock<WebSocketConfig>,
}

impl Upgrader {
    /// Creates an upgrader with default policies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: UpgraderConfig) -> Result<Self> {
        UpgraderBuilder::new().config(config).build()
    }

    /// Returns a builder for configuring an upgrader.
    #[inline]
    #[must_use]
    pub fn builder() -> UpgraderBuilder {
        UpgraderBuilder::new()
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &UpgraderConfig {
        &self.config
    }

    /// Performs the opening handshake on `stream` and returns the connection.
    ///
    /// `response_headers` are added to the `101 Switching Protocols`
    /// response. A `Sec-WebSocket-Protocol` entry there overrides
    /// subprotocol negotiation.
    ///
    /// On failure an HTTP error response has already been written to the
    /// stream; the handshake is never retried.
    ///
    /// # Errors
    ///
    /// - [`Error::HandshakeTimeout`] if the handshake outlives the timeout
    /// - [`Error::WebSocket`] if the handshake fails or is rejected
    pub async fn upgrade<S>(
        &self,
        stream: S,
        response_headers: Option<&HeaderMap>,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handshake = HandshakeInfo::default();

        let callback = |request: &Request, response: Response| {
            self.negotiate(request, response, response_headers, &mut handshake)
        };
        let accept = accept_hdr_async_with_config(stream, callback, Some(self.websocket_config()));

        let ws_stream = match self.config.handshake_timeout() {
            Some(limit) => timeout(limit, accept)
                .await
                .map_err(|_| Error::handshake_timeout(whole_millis(limit)))??,
            None => accept.await?,
        };

        debug!(
            uri = %handshake.uri,
            subprotocol = ?handshake.subprotocol,
            "WebSocket upgrade completed"
        );

        Ok(Connection::with_handshake(
            WsTransport::new(ws_stream),
            self.config.connection_options(),
            handshake,
        ))
    }

    /// Returns the tungstenite configuration, deriving it once.
    fn websocket_config(&self) -> WebSocketConfig {
        *self
            .websocket_config
            .get_or_init(|| self.config.websocket_config())
    }

    /// Handshake callback: decides the `101` response or an error response.
    fn negotiate(
        &self,
        request: &Request,
        mut response: Response,
        response_headers: Option<&HeaderMap>,
        handshake: &mut HandshakeInfo,
    ) -> StdResult<Response, ErrorResponse> {
        handshake.uri = request.uri().to_string();

        if !(self.check_origin)(request) {
            warn!(
                uri = %handshake.uri,
                origin = ?request.headers().get(ORIGIN),
                "Upgrade rejected: origin not allowed"
            );
            return Err((self.error_responder)(
                request,
                StatusCode::FORBIDDEN,
                "websocket: request origin not allowed",
            ));
        }

        let extra = response_headers.cloned().unwrap_or_default();

        if extra.contains_key(SEC_WEBSOCKET_EXTENSIONS) {
            warn!(uri = %handshake.uri, "Upgrade rejected: application extensions header");
            return Err((self.error_responder)(
                request,
                StatusCode::INTERNAL_SERVER_ERROR,
                "websocket: application specific 'Sec-WebSocket-Extensions' headers are unsupported",
            ));
        }

        handshake.subprotocol = match extra.get(SEC_WEBSOCKET_PROTOCOL) {
            Some(value) => value.to_str().ok().map(str::to_owned),
            None => {
                let selected = policy::select_subprotocol(request, &self.config.subprotocols);
                if let Some(protocol) = &selected
                    && let Ok(value) = HeaderValue::from_str(protocol)
                {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
                selected
            }
        };

        if self.config.enable_compression && policy::offers_compression(request) {
            debug!(uri = %handshake.uri, "Compression offered but not negotiated");
        }

        response.headers_mut().extend(extra);

        Ok(response)
    }
}

impl fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// UpgraderBuilder
// ============================================================================

/// Builder for configuring an [`Upgrader`].
///
/// Use [`Upgrader::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct UpgraderBuilder {
    config: UpgraderConfig,
    check_origin: Option<OriginCheck>,
    error_responder: Option<ErrorResponder>,
}

impl UpgraderBuilder {
    /// Creates a builder with default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: UpgraderConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, limit: Duration) -> Self {
        self.config.handshake_timeout_ms = Some(whole_millis(limit));
        self
    }

    /// Sets the read buffer size in bytes.
    #[inline]
    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Sets the write buffer size in bytes.
    #[inline]
    #[must_use]
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Sets the maximum buffered outgoing bytes.
    #[inline]
    #[must_use]
    pub fn max_write_buffer_size(mut self, size: usize) -> Self {
        self.config.max_write_buffer_size = Some(size);
        self
    }

    /// Sets the largest incoming message accepted.
    #[inline]
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = Some(size);
        self
    }

    /// Sets supported subprotocols in order of preference.
    #[must_use]
    pub fn subprotocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.config.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Enables or disables compression negotiation.
    #[inline]
    #[must_use]
    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.config.enable_compression = enabled;
        self
    }

    /// Sets the inbound queue capacity of created connections.
    #[inline]
    #[must_use]
    pub fn read_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.read_queue_capacity = capacity;
        self
    }

    /// Sets the outbound queue capacity of created connections.
    ///
    /// `0` makes writes synchronous.
    #[inline]
    #[must_use]
    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.write_queue_capacity = capacity;
        self
    }

    /// Sets the origin predicate.
    ///
    /// Defaults to [`policy::same_origin`].
    #[must_use]
    pub fn check_origin<F>(mut self, check: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.check_origin = Some(Arc::new(check));
        self
    }

    /// Accepts requests from any origin.
    #[must_use]
    pub fn allow_any_origin(self) -> Self {
        self.check_origin(|_| true)
    }

    /// Sets the function building rejection responses.
    ///
    /// Defaults to [`policy::plain_text_error`].
    #[must_use]
    pub fn error_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Request, StatusCode, &str) -> ErrorResponse + Send + Sync + 'static,
    {
        self.error_responder = Some(Arc::new(responder));
        self
    }

    /// Builds the upgrader with validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn build(self) -> Result<Upgrader> {
        self.config.validate()?;

        Ok(Upgrader {
            config: self.config,
            check_origin: self
                .check_origin
                .unwrap_or_else(|| Arc::new(policy::same_origin)),
            error_responder: self
                .error_responder
                .unwrap_or_else(|| Arc::new(policy::plain_text_error)),
            websocket_config: OnceLock::new(),
        })
    }
}

impl fmt::Debug for UpgraderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgraderBuilder")
            .field("config", &self.config)
            .field("custom_check_origin", &self.check_origin.is_some())
            .field("custom_error_responder", &self.error_responder.is_some())
            .finish()
    }
}

/// Milliseconds in `limit`, saturating at `u64::MAX`.
fn whole_millis(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    /// Binds a listener and upgrades the first accepted socket.
    async fn serve_once(
        upgrader: Upgrader,
        headers: Option<HeaderMap>,
    ) -> (u16, JoinHandle<Result<Connection>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            upgrader.upgrade(stream, headers.as_ref()).await
        });

        (port, task)
    }

    fn client_request(
        port: u16,
        path: &str,
        headers: &[(&'static str, &'static str)],
    ) -> Request {
        let mut request = format!("ws://127.0.0.1:{port}{path}")
            .into_client_request()
            .expect("client request");
        for (name, value) in headers {
            request
                .headers_mut()
                .insert(*name, HeaderValue::from_static(*value));
        }
        request
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = Upgrader::builder()
            .write_buffer_size(1 << 16)
            .max_write_buffer_size(1024)
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_builder_collects_settings() {
        let upgrader = Upgrader::builder()
            .handshake_timeout(Duration::from_millis(750))
            .subprotocols(["b", "a"])
            .enable_compression(true)
            .read_queue_capacity(3)
            .write_queue_capacity(5)
            .build()
            .expect("valid config");

        let config = upgrader.config();
        assert_eq!(config.handshake_timeout(), Some(Duration::from_millis(750)));
        assert_eq!(config.subprotocols, vec!["b", "a"]);
        assert!(config.enable_compression);
        assert_eq!(config.read_queue_capacity, 3);
        assert_eq!(config.write_queue_capacity, 5);
    }

    #[test]
    fn test_huge_handshake_timeout_saturates() {
        let upgrader = Upgrader::builder()
            .handshake_timeout(Duration::MAX)
            .build()
            .expect("valid config");

        assert_eq!(upgrader.config().handshake_timeout_ms, Some(u64::MAX));
        assert_eq!(whole_millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_websocket_config_derived_once() {
        let upgrader = Upgrader::builder().read_buffer_size(4096).build().unwrap();
        assert!(upgrader.websocket_config.get().is_none());

        assert_eq!(upgrader.websocket_config().read_buffer_size, 4096);
        assert!(upgrader.websocket_config.get().is_some());
    }

    #[tokio::test]
    async fn test_upgrade_and_echo() {
        let upgrader = Upgrader::builder().write_queue_capacity(4).build().unwrap();
        let (port, server) = serve_once(upgrader, None).await;

        let (mut client, _) = connect_async(client_request(port, "/chat?room=1", &[]))
            .await
            .expect("client handshake");
        let conn = server.await.expect("join").expect("upgrade");

        assert_eq!(conn.handshake().uri, "/chat?room=1");
        assert!(conn.subprotocol().is_none());

        client.send(Message::Text("ping".into())).await.unwrap();
        let received = conn.read_message().await.expect("server read");
        assert_eq!(received, Message::Text("ping".into()));

        conn.write_message(received).await.expect("server write");
        let echoed = client.next().await.expect("message").expect("ok");
        assert_eq!(echoed, Message::Text("ping".into()));

        conn.close();
    }

    #[tokio::test]
    async fn test_subprotocol_follows_server_preference() {
        let upgrader = Upgrader::builder()
            .subprotocols(["superchat", "chat"])
            .build()
            .unwrap();
        let (port, server) = serve_once(upgrader, None).await;

        let request = client_request(port, "/", &[("sec-websocket-protocol", "chat, superchat")]);
        let (_client, response) = connect_async(request).await.expect("client handshake");
        let conn = server.await.unwrap().unwrap();

        assert_eq!(conn.subprotocol(), Some("superchat"));
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "superchat"
        );
    }

    #[tokio::test]
    async fn test_extra_response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-served-by", HeaderValue::from_static("safe-websocket"));

        let upgrader = Upgrader::builder().build().unwrap();
        let (port, server) = serve_once(upgrader, Some(headers)).await;

        let (_client, response) = connect_async(client_request(port, "/", &[]))
            .await
            .expect("client handshake");
        server.await.unwrap().unwrap();

        assert_eq!(response.headers().get("x-served-by").unwrap(), "safe-websocket");
    }

    #[tokio::test]
    async fn test_extensions_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static("permessage-deflate"),
        );

        let upgrader = Upgrader::builder().build().unwrap();
        let (port, server) = serve_once(upgrader, Some(headers)).await;

        match connect_async(client_request(port, "/", &[])).await {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            }
            other => panic!("expected HTTP error, got {other:?}"),
        }
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cross_origin_is_rejected() {
        let upgrader = Upgrader::builder().build().unwrap();
        let (port, server) = serve_once(upgrader, None).await;

        let request = client_request(port, "/", &[("origin", "http://evil.example")]);
        match connect_async(request).await {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::FORBIDDEN);
            }
            other => panic!("expected HTTP error, got {other:?}"),
        }

        let result = server.await.unwrap();
        assert!(matches!(result, Err(Error::WebSocket(_))));
    }

    #[tokio::test]
    async fn test_same_origin_is_accepted() {
        let upgrader = Upgrader::builder().build().unwrap();
        let (port, server) = serve_once(upgrader, None).await;

        let origin = format!("http://127.0.0.1:{port}");
        let mut request = client_request(port, "/", &[]);
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_str(&origin).unwrap());

        connect_async(request).await.expect("same origin accepted");
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_custom_origin_check_and_responder() {
        let upgrader = Upgrader::builder()
            .check_origin(|request| {
                request
                    .headers()
                    .get(ORIGIN)
                    .is_some_and(|origin| origin == "https://trusted.example")
            })
            .error_responder(|request, status, reason| {
                let mut response = policy::plain_text_error(request, status, reason);
                response
                    .headers_mut()
                    .insert("x-rejected", HeaderValue::from_static("origin"));
                response
            })
            .build()
            .unwrap();
        let (port, server) = serve_once(upgrader, None).await;

        let request = client_request(port, "/", &[("origin", "https://other.example")]);
        match connect_async(request).await {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::FORBIDDEN);
                assert_eq!(response.headers().get("x-rejected").unwrap(), "origin");
            }
            other => panic!("expected HTTP error, got {other:?}"),
        }
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_allow_any_origin() {
        let upgrader = Upgrader::builder().allow_any_origin().build().unwrap();
        let (port, server) = serve_once(upgrader, None).await;

        let request = client_request(port, "/", &[("origin", "http://evil.example")]);
        connect_async(request).await.expect("any origin accepted");
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let upgrader = Upgrader::builder()
            .handshake_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let (port, server) = serve_once(upgrader, None).await;

        // Connect but never send the upgrade request.
        let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(Error::HandshakeTimeout { timeout_ms: 50 })));
    }

    #[tokio::test]
    async fn test_plain_http_request_fails_handshake() {
        let upgrader = Upgrader::builder().build().unwrap();
        let (port, server) = serve_once(upgrader, None).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(Error::WebSocket(_))));
    }
}
