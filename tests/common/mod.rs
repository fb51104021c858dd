#![allow(dead_code)]

use quic_sni_proxy::{
    BackendAddress, BackendDescriptor, BackendProtocol, CertPolicy, CertificateStore,
    ListenerSettings, ProxyListener, QuicParams, RoutingTable, Thumbprint,
};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    sign::CertifiedKey,
    DigitallySignedStruct, SignatureScheme,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::mpsc};

pub const TCP_HOST: &str = "api.internal";
pub const QUIC_HOST: &str = "echo.internal";
pub const PROXY_ALPN: &[u8] = b"h3-proxy";
pub const ECHO_ALPN: &[u8] = b"echo";

/// Bound on every network step of a test
pub const STEP: Duration = Duration::from_secs(10);

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().expect("address")
}

/// A throwaway certificate authority that issues client identities
pub struct TestCa {
    certificate: rcgen::Certificate,
    key: KeyPair,
}

/// Certificate chain `[leaf, root]` and key a client authenticates with
pub struct ClientIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().expect("ca key");
        let certificate = params.self_signed(&key).expect("ca certificate");
        Self { certificate, key }
    }

    pub fn thumbprint(&self) -> Thumbprint {
        Thumbprint::sha256_of(self.certificate.der())
    }

    pub fn issue_client(&self) -> ClientIdentity {
        let mut params =
            CertificateParams::new(vec!["client.test".to_string()]).expect("leaf params");
        params.distinguished_name.push(DnType::CommonName, "client");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let key = KeyPair::generate().expect("leaf key");
        let leaf = params
            .signed_by(&key, &self.certificate, &self.key)
            .expect("leaf certificate");

        ClientIdentity {
            chain: vec![leaf.der().clone(), self.certificate.der().clone()],
            key: PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
        }
    }
}

/// Self-signed server identity for a hostname, as (certificate, key)
fn self_signed(hostname: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let generated =
        rcgen::generate_simple_self_signed(vec![hostname.to_string()]).expect("server certificate");
    (
        generated.cert.der().clone(),
        PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()).into(),
    )
}

pub fn server_identity(hostname: &str) -> CertifiedKey {
    let (certificate, key) = self_signed(hostname);
    let key = provider()
        .key_provider
        .load_private_key(key)
        .expect("signing key");
    CertifiedKey::new(vec![certificate], key)
}

/// TCP echo server that counts accepted connections
pub struct TcpEchoBackend {
    pub address: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl TcpEchoBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(localhost()).await.expect("bind tcp backend");
        let address = listener.local_addr().expect("tcp backend address");
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    if tokio::io::copy(&mut reader, &mut writer).await.is_ok() {
                        let _ = writer.shutdown().await;
                    }
                });
            }
        });

        Self { address, accepted }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// QUIC echo server speaking the `echo` ALPN. Echoes every bidirectional stream, collects every
/// unidirectional stream and counts accepted connections.
pub struct QuicEchoBackend {
    pub address: SocketAddr,
    accepted: Arc<AtomicUsize>,
    unidirectional: mpsc::UnboundedReceiver<Result<Vec<u8>, String>>,
    endpoint: quinn::Endpoint,
}

impl QuicEchoBackend {
    pub fn start() -> Self {
        let (certificate, key) = self_signed("backend.internal");
        let mut tls = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("tls versions")
            .with_no_client_auth()
            .with_single_cert(vec![certificate], key)
            .expect("backend tls");
        tls.alpn_protocols = vec![ECHO_ALPN.to_vec()];

        let crypto = QuicServerConfig::try_from(tls).expect("backend quic crypto");
        let endpoint =
            quinn::Endpoint::server(quinn::ServerConfig::with_crypto(Arc::new(crypto)), localhost())
                .expect("bind quic backend");
        let address = endpoint.local_addr().expect("quic backend address");
        let accepted = Arc::new(AtomicUsize::new(0));

        let (delivered, unidirectional) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        let server = endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = server.accept().await {
                let counter = counter.clone();
                let delivered = delivered.clone();
                tokio::spawn(async move {
                    let Ok(connection) = incoming.await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    loop {
                        tokio::select! {
                            bi = connection.accept_bi() => {
                                let Ok((mut send, mut recv)) = bi else { break };
                                tokio::spawn(async move {
                                    if tokio::io::copy(&mut recv, &mut send).await.is_ok() {
                                        let _ = send.finish();
                                        let _ = send.stopped().await;
                                    }
                                });
                            }
                            uni = connection.accept_uni() => {
                                let Ok(mut recv) = uni else { break };
                                let delivered = delivered.clone();
                                tokio::spawn(async move {
                                    let received = recv
                                        .read_to_end(usize::MAX)
                                        .await
                                        .map_err(|error| error.to_string());
                                    let _ = delivered.send(received);
                                });
                            }
                        }
                    }
                });
            }
        });

        Self {
            address,
            accepted,
            unidirectional,
            endpoint,
        }
    }

    /// Contents of the next unidirectional stream the backend finished reading
    pub async fn next_unidirectional(&mut self) -> Option<Result<Vec<u8>, String>> {
        self.unidirectional.recv().await
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for QuicEchoBackend {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"test finished");
    }
}

pub fn tcp_route(backend: SocketAddr, ca: &TestCa) -> BackendDescriptor {
    BackendDescriptor {
        hostname: TCP_HOST.to_string(),
        backend_address: BackendAddress::new(backend.ip().to_string(), backend.port()),
        backend_protocol: BackendProtocol::Tcp,
        cert_policy: CertPolicy::new(ca.thumbprint()),
        quic_params: None,
    }
}

pub fn quic_route(backend: SocketAddr, ca: &TestCa) -> BackendDescriptor {
    BackendDescriptor {
        hostname: QUIC_HOST.to_string(),
        backend_address: BackendAddress::new(backend.ip().to_string(), backend.port()),
        backend_protocol: BackendProtocol::Quic,
        cert_policy: CertPolicy::new(ca.thumbprint()),
        quic_params: Some(QuicParams {
            alpn: ECHO_ALPN.to_vec(),
            default_close_error_code: 0,
            default_stream_error_code: 0,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }),
    }
}

/// Start a proxy on localhost serving the given routes, with a certificate for each hostname
pub fn start_proxy(routes: Vec<BackendDescriptor>) -> (ProxyListener, SocketAddr) {
    let mut table = RoutingTable::new();
    let mut certificates = CertificateStore::new();
    for route in routes {
        certificates.insert(route.hostname.clone(), server_identity(&route.hostname));
        table.add(route.hostname.clone(), route);
    }

    let mut listener = ProxyListener::new(
        table,
        Arc::new(certificates),
        ListenerSettings::new(vec![PROXY_ALPN.to_vec(), ECHO_ALPN.to_vec()]),
    );
    let address = listener.start(localhost()).expect("proxy starts");
    (listener, address)
}

/// QUIC client endpoint authenticating with `identity` and offering a single ALPN
pub fn client(identity: ClientIdentity, alpn: &[u8]) -> quinn::Endpoint {
    client_offering(identity, &[alpn])
}

/// QUIC client endpoint offering `alpn` in order of preference
pub fn client_offering(identity: ClientIdentity, alpn: &[&[u8]]) -> quinn::Endpoint {
    let provider = provider();
    let mut tls = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("tls versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyServer(provider)))
        .with_client_auth_cert(identity.chain, identity.key)
        .expect("client identity");
    tls.alpn_protocols = alpn.iter().map(|protocol| protocol.to_vec()).collect();

    let crypto = QuicClientConfig::try_from(tls).expect("client quic crypto");
    let mut endpoint = quinn::Endpoint::client(localhost()).expect("bind client");
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));
    endpoint
}

/// Connect through the proxy and echo `payload` over one bidirectional stream
pub async fn echo_once(
    client: &quinn::Endpoint,
    proxy: SocketAddr,
    hostname: &str,
    payload: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let connection = client.connect(proxy, hostname)?.await?;
    let echoed = echo(&connection, payload).await;
    connection.close(0u32.into(), b"done");
    echoed
}

/// Connect to `hostname` through the proxy
pub async fn connect(
    client: &quinn::Endpoint,
    proxy: SocketAddr,
    hostname: &str,
) -> quinn::Connection {
    tokio::time::timeout(STEP, async {
        client.connect(proxy, hostname).expect("connect").await
    })
    .await
    .expect("handshake finishes")
    .expect("handshake succeeds")
}

/// Echo `payload` over a new bidirectional stream of an established connection
pub async fn echo(connection: &quinn::Connection, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (mut send, mut recv) = connection.open_bi().await?;
    send.write_all(payload).await?;
    send.finish()?;
    Ok(recv.read_to_end(payload.len() + 1).await?)
}

#[derive(Debug)]
struct AnyServer(Arc<CryptoProvider>);

impl ServerCertVerifier for AnyServer {
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
