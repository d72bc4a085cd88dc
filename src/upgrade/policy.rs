//! Handshake policies.
//!
//! Strategy types an [`Upgrader`](super::Upgrader) consults while answering
//! an upgrade request, and their defaults.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::header::{
    CONTENT_TYPE, HOST, ORIGIN, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use url::Url;

// ============================================================================
// Types
// ============================================================================

/// Origin predicate.
///
/// Returns `true` if the request's `Origin` is acceptable.
pub type OriginCheck = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Builds the HTTP response sent when the upgrader rejects a request.
pub type ErrorResponder = Arc<dyn Fn(&Request, StatusCode, &str) -> ErrorResponse + Send + Sync>;

// ============================================================================
// Origin
// ============================================================================

/// Default origin check.
///
/// Accepts requests without an `Origin` header. Otherwise the origin's
/// `host[:port]`, exactly as written, must equal the `Host` header,
/// ignoring ASCII case. An explicit default port is not normalized away,
/// so `http://example.com:80` only matches `Host: example.com:80`.
#[must_use]
pub fn same_origin(request: &Request) -> bool {
    let Some(origin) = request.headers().get(ORIGIN) else {
        return true;
    };

    let Some(origin_host) = origin.to_str().ok().and_then(authority) else {
        return false;
    };

    request
        .headers()
        .get(HOST)
        .and_then(|host| host.to_str().ok())
        .is_some_and(|host| host.eq_ignore_ascii_case(origin_host))
}

/// Returns the `host[:port]` text of an absolute URL, without user info.
///
/// `Url` drops a scheme's default port when it normalizes, so the
/// authority is cut from the raw text once the URL is known to parse.
fn authority(origin: &str) -> Option<&str> {
    Url::parse(origin).ok()?;

    let (_, rest) = origin.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];

    Some(authority.rsplit_once('@').map_or(authority, |(_, host)| host))
}

// ============================================================================
// Negotiation
// ============================================================================

/// Subprotocols requested by the client, in request order.
pub fn requested_subprotocols(request: &Request) -> impl Iterator<Item = &str> {
    header_tokens(request, SEC_WEBSOCKET_PROTOCOL)
}

/// Picks the first supported subprotocol that the client also requested.
///
/// Server preference order wins over client order.
#[must_use]
pub fn select_subprotocol(request: &Request, supported: &[String]) -> Option<String> {
    supported
        .iter()
        .find(|protocol| requested_subprotocols(request).any(|offered| offered == protocol.as_str()))
        .cloned()
}

/// Returns `true` if the client offered `permessage-deflate`.
#[must_use]
pub fn offers_compression(request: &Request) -> bool {
    header_tokens(request, SEC_WEBSOCKET_EXTENSIONS).any(|extension| {
        extension
            .split(';')
            .next()
            .is_some_and(|name| name.trim().eq_ignore_ascii_case("permessage-deflate"))
    })
}

/// Comma-separated tokens across every value of a header.
fn header_tokens(request: &Request, name: HeaderName) -> impl Iterator<Item = &str> {
    request
        .headers()
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

// ============================================================================
// Error Responses
// ============================================================================

/// Default error responder: the status with a plain-text reason body.
#[must_use]
pub fn plain_text_error(_request: &Request, status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

// ============================================================================
// Tests
// ============================================================================
