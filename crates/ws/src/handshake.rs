//! Opening handshake helpers, RFC 6455 section 4.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::{HeaderMap, HeaderName};
use sha1::{Digest, Sha1};

use gale_http::protocol::headers::{contains_token, header_tokens};

/// Appended to the client key before hashing it into the accept value.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Versions served; everything else is answered with `426 Upgrade Required`.
pub const SUPPORTED_VERSIONS: &str = "7, 8, 13";

/// Sent by browsers speaking protocol version 8 instead of `Origin`.
pub static SEC_WEBSOCKET_ORIGIN: HeaderName = HeaderName::from_static("sec-websocket-origin");

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`: base64(SHA-1(key + GUID)).
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A client key: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

pub fn is_supported_version(version: &str) -> bool {
    matches!(version.trim(), "7" | "8" | "13")
}

/// `Upgrade: websocket`, compared without regard to case.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers.get(UPGRADE).is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"websocket"))
}

/// `Connection` lists `upgrade` among its tokens. Proxies tend to add more.
pub fn is_connection_upgrade(headers: &HeaderMap) -> bool {
    contains_token(headers, CONNECTION, "upgrade")
}

/// `Origin`, or `Sec-WebSocket-Origin` from version 8 clients.
pub fn origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(ORIGIN).or_else(|| headers.get(&SEC_WEBSOCKET_ORIGIN)).and_then(|value| value.to_str().ok())
}

/// The default origin policy: the origin's `host[:port]` must equal the `Host` header.
pub fn same_origin(origin: &str, headers: &HeaderMap) -> bool {
    let without_scheme = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let netloc = without_scheme.split(['/', '?', '#']).next().unwrap_or_default();
    let host = headers.get(HOST).and_then(|value| value.to_str().ok()).unwrap_or_default();
    !netloc.is_empty() && netloc.eq_ignore_ascii_case(host.trim())
}

/// Values of every `Sec-WebSocket-Protocol` header, in order.
pub fn subprotocols(headers: &HeaderMap) -> Vec<String> {
    header_tokens(headers, SEC_WEBSOCKET_PROTOCOL).map(str::to_owned).collect()
}
