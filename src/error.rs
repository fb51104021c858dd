use crate::routing::BackendAddress;
use std::{io, time::Duration};

/// Failures to reach an internal backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to resolve backend {address}: {source}")]
    Resolve {
        address: BackendAddress,
        source: io::Error,
    },
    #[error("backend {address} resolved to no usable socket address")]
    NoAddress { address: BackendAddress },
    #[error("backend {address} has no QUIC parameters")]
    MissingQuicParams { address: BackendAddress },
    #[error("failed to connect to backend {address}: {source}")]
    Connect {
        address: BackendAddress,
        source: io::Error,
    },
    #[error("invalid QUIC client configuration for backend {address}: {reason}")]
    Config {
        address: BackendAddress,
        reason: String,
    },
    #[error("QUIC connection to backend {address} could not be started: {source}")]
    QuicConnect {
        address: BackendAddress,
        source: quinn::ConnectError,
    },
    #[error("QUIC handshake with backend {address} failed: {source}")]
    QuicHandshake {
        address: BackendAddress,
        source: quinn::ConnectionError,
    },
    #[error("QUIC handshake with backend {address} timed out after {timeout:?}")]
    HandshakeTimeout {
        address: BackendAddress,
        timeout: Duration,
    },
}

/// Failures of the listener and of individual proxied connections
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy listener is already running")]
    AlreadyStarted,
    #[error("failed to bind QUIC listener: {0}")]
    Bind(#[source] io::Error),
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid QUIC configuration: {0}")]
    Quic(String),
    #[error("no route for hostname {hostname:?}")]
    Routing { hostname: String },
    #[error("client for {hostname:?} failed authentication: {reason}")]
    Authentication { hostname: String, reason: String },
    #[error("client negotiated {negotiated:?} but {hostname:?} requires {expected:?}")]
    Alpn {
        hostname: String,
        expected: String,
        negotiated: String,
    },
    #[error("client handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("client connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("backend connection lost: {0}")]
    BackendLost(#[source] quinn::ConnectionError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
