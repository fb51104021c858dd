use crate::routing::{CertPolicy, RoutingTable, Thumbprint};
use rustls::{
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, UnixTime},
    server::{
        danger::{ClientCertVerified, ClientCertVerifier},
        ClientHello, ResolvesServerCert, WebPkiClientVerifier,
    },
    sign::CertifiedKey,
    CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme,
};
use std::{collections::HashMap, fmt, iter, sync::Arc};

/// A problem with the client chain itself, found before any policy is consulted
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("certificate chain is invalid: {0}")]
    Invalid(rustls::Error),
    #[error("certificate chain could not be checked: {0}")]
    Verifier(String),
}

/// Why a client chain was refused by a hostname's policy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no client certificate chain was presented")]
    MissingChain,
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("chain root {presented} is not the trusted root {expected}")]
    UntrustedRoot {
        presented: Thumbprint,
        expected: Thumbprint,
    },
}

/// Decide whether a client certificate chain satisfies a hostname's policy.
///
/// `chain` is ordered from the end-entity certificate to the root. The root (last element) is
/// fingerprinted with the policy's algorithm and compared byte-for-byte with the trusted
/// thumbprint. Any `policy_error` already reported for the chain is a refusal.
pub fn check_client_chain(
    chain: Option<&[CertificateDer<'_>]>,
    policy_error: Option<&ChainError>,
    policy: &CertPolicy,
) -> Result<(), AuthFailure> {
    let root = chain
        .and_then(|chain| chain.last())
        .ok_or(AuthFailure::MissingChain)?;

    if let Some(error) = policy_error {
        return Err(error.clone().into());
    }

    let expected = policy.trusted_root_thumbprint;
    let presented = expected.of_same_algorithm(root.as_ref());
    if presented != expected {
        return Err(AuthFailure::UntrustedRoot {
            presented,
            expected,
        });
    }

    // TODO: consult trusted_tenant_id/trusted_group_ids once the claim-carrying
    // certificate extension is settled with the identity provider
    Ok(())
}

/// Boolean form of [`check_client_chain`]
pub fn authorize_client(
    chain: Option<&[CertificateDer<'_>]>,
    policy_error: Option<&ChainError>,
    policy: &CertPolicy,
) -> bool {
    check_client_chain(chain, policy_error, policy).is_ok()
}

/// Validate the path from `end_entity` to the last certificate the client presented.
///
/// The last certificate is used as the trust anchor, so this checks signatures, validity
/// periods and key usage along the chain but says nothing about whether that root is trusted.
pub fn validate_chain(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    now: UnixTime,
    provider: &Arc<CryptoProvider>,
) -> Result<(), ChainError> {
    let (anchor, path) = match intermediates.split_last() {
        Some((root, path)) => (root, path),
        None => (end_entity, intermediates),
    };

    let mut roots = RootCertStore::empty();
    roots.add(anchor.clone()).map_err(ChainError::Invalid)?;

    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|error| ChainError::Verifier(error.to_string()))?
        .verify_client_cert(end_entity, path, now)
        .map(|_| ())
        .map_err(ChainError::Invalid)
}

/// Source of the server identity presented for a hostname
pub trait CertificateResolver: fmt::Debug + Send + Sync {
    fn resolve(&self, hostname: &str) -> Option<Arc<CertifiedKey>>;
}

/// Immutable hostname -> server certificate map, filled at startup
#[derive(Default, Clone)]
pub struct CertificateStore {
    certificates: HashMap<String, Arc<CertifiedKey>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hostname: impl Into<String>, certificate: CertifiedKey) {
        self.certificates
            .insert(hostname.into(), Arc::new(certificate));
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.certificates.keys()).finish()
    }
}

impl CertificateResolver for CertificateStore {
    fn resolve(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.certificates.get(hostname).cloned()
    }
}

/// Per-handshake routing decision: pick the server identity for the SNI a client asked for,
/// or refuse the handshake when the hostname (or its ALPN) isn't routable.
///
/// The listener advertises one protocol list for every hostname, so a hostname's pinned ALPN is
/// only enforced here as "offered by the client". The negotiated value is checked again once the
/// handshake completes.
#[derive(Debug)]
pub struct SniCertResolver {
    routes: Arc<RoutingTable>,
    certificates: Arc<dyn CertificateResolver>,
}

impl SniCertResolver {
    pub fn new(routes: Arc<RoutingTable>, certificates: Arc<dyn CertificateResolver>) -> Self {
        Self {
            routes,
            certificates,
        }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(hostname) = client_hello.server_name() else {
            tracing::warn!("routing failure: client sent no server name");
            return None;
        };

        let Some(backend) = self.routes.resolve(hostname) else {
            tracing::warn!(hostname, "routing failure: no backend for hostname");
            return None;
        };

        if let Some(alpn) = backend.alpn() {
            let offered = client_hello
                .alpn()
                .is_some_and(|mut protocols| protocols.any(|protocol| protocol == alpn));
            if !offered {
                tracing::warn!(
                    hostname,
                    alpn = %String::from_utf8_lossy(alpn),
                    "routing failure: client did not offer the backend's application protocol"
                );
                return None;
            }
        }

        let certificate = self.certificates.resolve(hostname);
        match certificate {
            Some(_) => tracing::debug!(
                hostname,
                backend = %backend.backend_address,
                "routing resolved during handshake"
            ),
            None => tracing::error!(hostname, "no server certificate for routable hostname"),
        }
        certificate
    }
}

/// Handshake-time client certificate check.
///
/// rustls runs this without telling it which hostname was requested, so the chain is accepted
/// when it validates and its root satisfies *some* configured policy. The listener repeats
/// [`authorize_client`] against the negotiated hostname's own policy once the handshake ends.
#[derive(Debug)]
pub struct ClientChainVerifier {
    policies: Vec<CertPolicy>,
    provider: Arc<CryptoProvider>,
}

impl ClientChainVerifier {
    pub fn new(routes: &RoutingTable, provider: Arc<CryptoProvider>) -> Self {
        let mut policies: Vec<CertPolicy> = Vec::new();
        for descriptor in routes.descriptors() {
            if !policies.contains(&descriptor.cert_policy) {
                policies.push(descriptor.cert_policy.clone());
            }
        }
        Self { policies, provider }
    }
}

impl ClientCertVerifier for ClientChainVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let chain: Vec<CertificateDer<'_>> = iter::once(end_entity.clone())
            .chain(intermediates.iter().cloned())
            .collect();
        let policy_error = validate_chain(end_entity, intermediates, now, &self.provider).err();

        if self
            .policies
            .iter()
            .any(|policy| authorize_client(Some(chain.as_slice()), policy_error.as_ref(), policy))
        {
            tracing::debug!(chain_length = chain.len(), "client certificate chain accepted");
            return Ok(ClientCertVerified::assertion());
        }

        match policy_error {
            Some(ChainError::Invalid(error)) => {
                tracing::warn!(%error, "authentication failure: invalid client certificate chain");
                Err(error)
            }
            Some(error) => {
                tracing::warn!(
                    %error,
                    "authentication failure: client certificate chain unchecked"
                );
                Err(CertificateError::ApplicationVerificationFailure.into())
            }
            None => {
                let root = chain.last().map(|root| Thumbprint::sha1_of(root.as_ref()));
                tracing::warn!(
                    root = ?root,
                    "authentication failure: client chain root is not trusted for any hostname"
                );
                Err(CertificateError::UnknownIssuer.into())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the TLS 1.3 server configuration shared by every handshake on the listener
pub fn server_crypto(
    routes: Arc<RoutingTable>,
    certificates: Arc<dyn CertificateResolver>,
    alpn_protocols: Vec<Vec<u8>>,
    provider: Arc<CryptoProvider>,
) -> Result<rustls::ServerConfig, rustls::Error> {
    let verifier = ClientChainVerifier::new(&routes, provider.clone());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_cert_resolver(Arc::new(SniCertResolver::new(routes.clone(), certificates)));

    config.alpn_protocols = alpn_preference(&routes, alpn_protocols);
    Ok(config)
}

/// Order the advertised protocols so hostname-pinned values come first.
///
/// rustls picks the first server protocol the client also offers, so a client offering its
/// hostname's pinned protocol next to others still negotiates the pinned one. A client offering
/// the pinned protocols of two different hostnames may still negotiate the other hostname's and
/// be refused after the handshake.
fn alpn_preference(routes: &RoutingTable, alpn_protocols: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let (mut pinned, unpinned): (Vec<_>, Vec<_>) =
        alpn_protocols.into_iter().partition(|protocol| {
            routes
                .descriptors()
                .any(|descriptor| descriptor.alpn() == Some(protocol.as_slice()))
        });
    pinned.extend(unpinned);
    pinned
}
