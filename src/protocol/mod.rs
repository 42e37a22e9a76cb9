//! Control Protocol Layer
//!
//! Responsibilities:
//! - Handshake schema: what a worker announces when it registers
//! - Wire codec for the handshake exchange (length-prefixed, big-endian)
//! - HTTP/1.1 message layer used for request-level routing
//!
//! A worker opens one TCP connection to the broker, sends a single
//! [`HandshakeRequest`] describing the socket it wants served, and receives a
//! single [`HandshakeResponse`]. After that exchange the connection is ceded
//! to the stream multiplexer and no further protocol frames appear on it.

pub mod codec;
pub mod http;

/// Status string of a successful handshake. Every other status is a
/// rejection; no richer status vocabulary is defined.
pub const STATUS_OK: &str = "OK";

/// HTTP routing predicate attached to a worker registration.
///
/// A request matches when its Host header ends with `domain_suffix` and its
/// path begins with `path_prefix`. Empty strings match everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpRule {
    pub domain_suffix: String,
    pub path_prefix: String,
}

/// TLS material attached to a worker registration. The broker terminates
/// TLS on the worker's behalf using this certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

/// What a worker asks the broker to listen on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SocketDefinition {
    /// Bind address for the public listener, e.g. `127.0.0.1`.
    pub address: String,
    /// Bind port for the public listener.
    pub port: u16,
    /// Optional HTTP routing predicate. Presence switches the listener into
    /// request-level routing once any registered worker carries one.
    pub http: Option<HttpRule>,
    /// Optional TLS material for inbound termination.
    pub tls: Option<TlsMaterial>,
}

impl SocketDefinition {
    /// Plain opaque-TCP definition with no HTTP or TLS attributes.
    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            http: None,
            tls: None,
        }
    }

    pub fn with_http(mut self, domain_suffix: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        self.http = Some(HttpRule {
            domain_suffix: domain_suffix.into(),
            path_prefix: path_prefix.into(),
        });
        self
    }

    pub fn with_tls(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.tls = Some(TlsMaterial {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        });
        self
    }
}

/// First and only message a worker sends on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub socket: SocketDefinition,
}

/// The broker's reply to a [`HandshakeRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: String,
}

impl HandshakeResponse {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}
