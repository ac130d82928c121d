//! WebSocket opening handshake over header lists
//!
//! The transport exchanges handshake data as ordered lists of
//! `(name, value)` pairs with HTTP/3-style pseudo-headers (`:method`,
//! `:path`, `:scheme`, `:authority`, `:status`). Names are compared
//! case-insensitively and emitted in lower case.
//!
//! Both sides perform the real check:
//! - client: `:status` 101, `upgrade`, `connection` and a
//!   `sec-websocket-accept` equal to Base64(SHA-1(key + GUID))
//! - server: GET, `upgrade: websocket`, `connection` containing `upgrade`,
//!   version 13 and a non-empty key

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::mask::random_bytes;
use crate::{WS_GUID, WS_VERSION};

/// One header entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Lower-case header name
    pub name: String,
    /// Header value
    pub value: String,
}

impl Header {
    /// Create a header, lower-casing the name
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut name = name.into();
        name.make_ascii_lowercase();
        Self {
            name,
            value: value.into(),
        }
    }
}

/// Find the first header with `name` (case-insensitive)
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Whether a comma-separated header value contains `token`
fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept.trim()
}

/// Generate a random Sec-WebSocket-Key (16 random bytes, Base64)
pub fn generate_key() -> String {
    base64::engine::general_purpose::STANDARD.encode(random_bytes::<16>())
}

/// Client side of the handshake
///
/// Holds the nonce until the response arrives.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    authority: String,
    path: String,
    scheme: String,
    key: String,
    origin: Option<String>,
    protocol: Option<String>,
    user_agent: Option<String>,
}

impl ClientHandshake {
    /// Start a handshake with a fresh random key
    pub fn new(authority: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_key(authority, path, generate_key())
    }

    /// Start a handshake with a caller-chosen key
    pub fn with_key(
        authority: impl Into<String>,
        path: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            path: path.into(),
            scheme: "https".to_string(),
            key: key.into(),
            origin: None,
            protocol: None,
            user_agent: None,
        }
    }

    /// Set the `:scheme` pseudo-header
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Set the `origin` header
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Request a subprotocol
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Set the `user-agent` header
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// The Sec-WebSocket-Key sent with this handshake
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Header list for the upgrade request
    pub fn request_headers(&self) -> Vec<Header> {
        let mut headers = vec![
            Header::new(":method", "GET"),
            Header::new(":path", self.path.as_str()),
            Header::new(":scheme", self.scheme.as_str()),
            Header::new(":authority", self.authority.as_str()),
            Header::new("upgrade", "websocket"),
            Header::new("connection", "Upgrade"),
            Header::new("sec-websocket-key", self.key.as_str()),
            Header::new("sec-websocket-version", WS_VERSION),
        ];
        if let Some(origin) = &self.origin {
            headers.push(Header::new("origin", origin.as_str()));
        }
        if let Some(proto) = &self.protocol {
            headers.push(Header::new("sec-websocket-protocol", proto.as_str()));
        }
        if let Some(agent) = &self.user_agent {
            headers.push(Header::new("user-agent", agent.as_str()));
        }
        headers
    }

    /// Verify the server's response headers
    pub fn verify_response(&self, headers: &[Header]) -> Result<HandshakeResponse> {
        let status = find_header(headers, ":status").ok_or(Error::Handshake("missing :status"))?;
        if status.trim() != "101" {
            return Err(Error::Handshake("expected status 101"));
        }

        let upgrade = find_header(headers, "upgrade").ok_or(Error::Handshake("missing upgrade"))?;
        if !upgrade.trim().eq_ignore_ascii_case("websocket") {
            return Err(Error::Handshake("upgrade must be websocket"));
        }

        let connection =
            find_header(headers, "connection").ok_or(Error::Handshake("missing connection"))?;
        if !has_token(connection, "upgrade") {
            return Err(Error::Handshake("connection must contain upgrade"));
        }

        let accept = find_header(headers, "sec-websocket-accept")
            .ok_or(Error::Handshake("missing sec-websocket-accept"))?;
        if !validate_accept_key(&self.key, accept) {
            return Err(Error::Handshake("accept key mismatch"));
        }

        Ok(HandshakeResponse {
            protocol: find_header(headers, "sec-websocket-protocol").map(str::to_string),
        })
    }
}

/// Verified server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Subprotocol selected by the server
    pub protocol: Option<String>,
}

/// Validated upgrade request (server-side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// The request path
    pub path: String,
    /// The `:authority` pseudo-header
    pub authority: Option<String>,
    /// The Sec-WebSocket-Key header
    pub key: String,
    /// Requested subprotocols
    pub protocol: Option<String>,
    /// The Origin header
    pub origin: Option<String>,
}

impl HandshakeRequest {
    /// Accept key to send back
    pub fn accept_key(&self) -> String {
        generate_accept_key(&self.key)
    }
}

/// Validate an incoming upgrade request
pub fn parse_request(headers: &[Header]) -> Result<HandshakeRequest> {
    let method = find_header(headers, ":method").ok_or(Error::Handshake("missing :method"))?;
    if method != "GET" {
        return Err(Error::Handshake("method must be GET"));
    }

    let upgrade = find_header(headers, "upgrade").ok_or(Error::Handshake("missing upgrade"))?;
    if !upgrade.to_ascii_lowercase().contains("websocket") {
        return Err(Error::Handshake("upgrade must be websocket"));
    }

    let connection =
        find_header(headers, "connection").ok_or(Error::Handshake("missing connection"))?;
    if !has_token(connection, "upgrade") {
        return Err(Error::Handshake("connection must contain upgrade"));
    }

    let version = find_header(headers, "sec-websocket-version")
        .ok_or(Error::Handshake("missing sec-websocket-version"))?;
    if version.trim() != WS_VERSION {
        return Err(Error::Handshake("unsupported websocket version"));
    }

    let key = find_header(headers, "sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(Error::Handshake("missing sec-websocket-key"))?;

    Ok(HandshakeRequest {
        path: find_header(headers, ":path").unwrap_or("/").to_string(),
        authority: find_header(headers, ":authority").map(str::to_string),
        key: key.to_string(),
        protocol: find_header(headers, "sec-websocket-protocol").map(str::to_string),
        origin: find_header(headers, "origin").map(str::to_string),
    })
}

/// Header list accepting the upgrade
pub fn build_response(accept_key: &str, protocol: Option<&str>) -> Vec<Header> {
    let mut headers = vec![
        Header::new(":status", "101"),
        Header::new("upgrade", "websocket"),
        Header::new("connection", "Upgrade"),
        Header::new("sec-websocket-accept", accept_key),
    ];
    if let Some(proto) = protocol {
        headers.push(Header::new("sec-websocket-protocol", proto));
    }
    headers
}

/// Header list refusing the upgrade
pub fn build_rejection(status: u16) -> Vec<Header> {
    vec![
        Header::new(":status", status.to_string()),
        Header::new("sec-websocket-version", WS_VERSION),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn response(accept: &str) -> Vec<Header> {
        build_response(accept, None)
    }

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        assert_eq!(generate_accept_key(RFC_KEY), RFC_ACCEPT);
    }

    #[test]
    fn test_validate_accept_key() {
        assert!(validate_accept_key(RFC_KEY, RFC_ACCEPT));
        assert!(!validate_accept_key(RFC_KEY, "invalid"));
    }

    #[test]
    fn test_generate_key() {
        let key = generate_key();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(raw.len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_request_headers() {
        let hs = ClientHandshake::with_key("example.com:4433", "/websocket", RFC_KEY);
        let headers = hs.request_headers();
        assert_eq!(find_header(&headers, ":method"), Some("GET"));
        assert_eq!(find_header(&headers, ":path"), Some("/websocket"));
        assert_eq!(find_header(&headers, ":authority"), Some("example.com:4433"));
        assert_eq!(find_header(&headers, "Upgrade"), Some("websocket"));
        assert_eq!(find_header(&headers, "sec-websocket-key"), Some(RFC_KEY));
        assert_eq!(find_header(&headers, "sec-websocket-version"), Some("13"));
    }

    #[test]
    fn test_client_accepts_valid_response() {
        let hs = ClientHandshake::with_key("h", "/", RFC_KEY);
        assert!(hs.verify_response(&response(RFC_ACCEPT)).is_ok());
    }

    #[test]
    fn test_client_rejects_bad_accept() {
        let hs = ClientHandshake::with_key("h", "/", RFC_KEY);
        let err = hs
            .verify_response(&response("AAAAAAAAAAAAAAAAAAAAAAAAAAA="))
            .unwrap_err();
        assert!(matches!(err, Error::Handshake("accept key mismatch")));
    }

    #[test]
    fn test_client_rejects_wrong_status() {
        let hs = ClientHandshake::with_key("h", "/", RFC_KEY);
        let mut headers = response(RFC_ACCEPT);
        headers[0] = Header::new(":status", "200");
        assert!(hs.verify_response(&headers).is_err());
        assert!(hs.verify_response(&build_rejection(400)).is_err());
    }

    #[test]
    fn test_client_requires_upgrade_headers() {
        let hs = ClientHandshake::with_key("h", "/", RFC_KEY);
        let headers: Vec<Header> = response(RFC_ACCEPT)
            .into_iter()
            .filter(|h| h.name != "connection")
            .collect();
        assert!(hs.verify_response(&headers).is_err());
    }

    #[test]
    fn test_server_parses_request() {
        let hs = ClientHandshake::with_key("server.example.com", "/chat", RFC_KEY).origin("o");
        let req = parse_request(&hs.request_headers()).unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.key, RFC_KEY);
        assert_eq!(req.origin.as_deref(), Some("o"));
        assert_eq!(req.accept_key(), RFC_ACCEPT);
    }

    #[test]
    fn test_server_connection_token_list() {
        let mut headers = ClientHandshake::with_key("h", "/", RFC_KEY).request_headers();
        for h in headers.iter_mut() {
            if h.name == "connection" {
                h.value = "keep-alive, Upgrade".to_string();
            }
        }
        assert!(parse_request(&headers).is_ok());
    }

    #[test]
    fn test_server_rejects_invalid_requests() {
        let base = ClientHandshake::with_key("h", "/", RFC_KEY).request_headers();

        let replace = |name: &str, value: &str| -> Vec<Header> {
            base.iter()
                .map(|h| {
                    if h.name == name {
                        Header::new(name, value)
                    } else {
                        h.clone()
                    }
                })
                .collect()
        };

        assert!(parse_request(&replace(":method", "POST")).is_err());
        assert!(parse_request(&replace("upgrade", "h2c")).is_err());
        assert!(parse_request(&replace("connection", "close")).is_err());
        assert!(parse_request(&replace("sec-websocket-version", "8")).is_err());
        assert!(parse_request(&replace("sec-websocket-key", "")).is_err());
    }
}
