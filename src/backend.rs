use crate::{
    error::BackendError,
    routing::{BackendAddress, BackendDescriptor, BackendProtocol, QuicParams},
};
use quinn::{crypto::rustls::QuicClientConfig, IdleTimeout, VarInt};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tokio::net::TcpStream;

/// Outbound connection to an internal backend
#[derive(Debug)]
pub enum BackendConnection {
    Quic(QuicBackend),
    Tcp(TcpStream),
}

/// QUIC connection to a backend, together with the client endpoint that drives it.
///
/// The connection and endpoint are closed with the hostname's close code when this is dropped,
/// so every exit path of the connection task releases them.
#[derive(Debug)]
pub struct QuicBackend {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    close_code: VarInt,
}

impl QuicBackend {
    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }
}

impl Drop for QuicBackend {
    fn drop(&mut self) {
        self.connection.close(self.close_code, b"proxy closed");
        self.endpoint.close(self.close_code, b"proxy closed");
    }
}

/// Opens outbound connections described by a [`BackendDescriptor`]
#[derive(Debug, Clone)]
pub struct BackendConnector {
    provider: Arc<CryptoProvider>,
}

impl BackendConnector {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }

    /// Connect using whichever transport the backend speaks
    pub async fn connect(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<BackendConnection, BackendError> {
        match descriptor.backend_protocol {
            BackendProtocol::Quic => self
                .connect_quic(descriptor)
                .await
                .map(BackendConnection::Quic),
            BackendProtocol::Tcp => self
                .connect_tcp(descriptor)
                .await
                .map(BackendConnection::Tcp),
        }
    }

    /// Open a plain TCP connection. No TLS is applied on this hop.
    #[tracing::instrument(skip_all, fields(backend = %descriptor.backend_address), err)]
    pub async fn connect_tcp(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<TcpStream, BackendError> {
        let address = &descriptor.backend_address;
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|source| BackendError::Connect {
                address: address.clone(),
                source,
            })?;

        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(%error, "failed to disable Nagle on backend socket");
        }

        tracing::info!("connected to TCP backend");
        Ok(stream)
    }

    /// Open a QUIC connection using the hostname's [`QuicParams`].
    ///
    /// The backend's certificate is not validated: backends live on the same private network
    /// as the proxy.
    #[tracing::instrument(skip_all, fields(backend = %descriptor.backend_address), err)]
    pub async fn connect_quic(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<QuicBackend, BackendError> {
        let address = &descriptor.backend_address;
        let params = descriptor
            .quic_params
            .as_ref()
            .ok_or_else(|| BackendError::MissingQuicParams {
                address: address.clone(),
            })?;

        let remote = resolve(address).await?;
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let config = self.client_config(address, params)?;
        let endpoint = quinn::Endpoint::client(local).map_err(|source| BackendError::Connect {
            address: address.clone(),
            source,
        })?;

        let connecting = endpoint
            .connect_with(config, remote, &descriptor.hostname)
            .map_err(|source| BackendError::QuicConnect {
                address: address.clone(),
                source,
            })?;

        let connection = match tokio::time::timeout(params.handshake_timeout, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(source)) => {
                endpoint.close(VarInt::from_u32(params.default_close_error_code), b"");
                return Err(BackendError::QuicHandshake {
                    address: address.clone(),
                    source,
                });
            }
            Err(_) => {
                endpoint.close(VarInt::from_u32(params.default_close_error_code), b"");
                return Err(BackendError::HandshakeTimeout {
                    address: address.clone(),
                    timeout: params.handshake_timeout,
                });
            }
        };

        tracing::info!(remote = %connection.remote_address(), "connected to QUIC backend");
        Ok(QuicBackend {
            endpoint,
            connection,
            close_code: VarInt::from_u32(params.default_close_error_code),
        })
    }

    fn client_config(
        &self,
        address: &BackendAddress,
        params: &QuicParams,
    ) -> Result<quinn::ClientConfig, BackendError> {
        let invalid = |reason: String| BackendError::Config {
            address: address.clone(),
            reason,
        };

        let mut tls = rustls::ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|error| invalid(error.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustedNetworkVerifier(
                self.provider.clone(),
            )))
            .with_no_client_auth();
        tls.alpn_protocols = vec![params.alpn.clone()];

        let crypto = QuicClientConfig::try_from(tls).map_err(|error| invalid(error.to_string()))?;
        let idle_timeout =
            IdleTimeout::try_from(params.idle_timeout).map_err(|error| invalid(error.to_string()))?;

        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(idle_timeout));

        let mut config = quinn::ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::new(transport));
        Ok(config)
    }
}

async fn resolve(address: &BackendAddress) -> Result<SocketAddr, BackendError> {
    tokio::net::lookup_host((address.host.as_str(), address.port))
        .await
        .map_err(|source| BackendError::Resolve {
            address: address.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| BackendError::NoAddress {
            address: address.clone(),
        })
}

/// Accepts any backend certificate while still checking handshake signatures
#[derive(Debug)]
struct TrustedNetworkVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for TrustedNetworkVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
