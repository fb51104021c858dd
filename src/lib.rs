//! QUIC reverse proxy that routes each client connection by TLS SNI to an internal QUIC or TCP
//! backend, after checking the client's certificate chain against the hostname's trusted root.

pub mod backend;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod proxy;
pub mod routing;
pub mod shutdown;
pub mod tls;

pub use backend::{BackendConnection, BackendConnector};
pub use config::{ConfigError, ProxyConfig};
pub use connection::ProxiedConnection;
pub use endpoint::{ListenerSettings, ProxyListener};
pub use error::{BackendError, ProxyError};
pub use routing::{
    BackendAddress, BackendDescriptor, BackendProtocol, CertPolicy, QuicParams, RoutingTable,
    Thumbprint,
};
pub use tls::{CertificateResolver, CertificateStore};
