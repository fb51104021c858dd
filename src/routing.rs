use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

/// Transport spoken by an internal backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendProtocol {
    Quic,
    Tcp,
}

/// Host (IP literal or DNS name) and port of an internal backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Fingerprint of a DER-encoded certificate.
///
/// Both the legacy SHA-1 form (what most certificate stores display as "thumbprint") and
/// SHA-256 are accepted. Matching always recomputes the digest with the same algorithm.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Thumbprint {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl Thumbprint {
    /// SHA-256 fingerprint of a certificate
    pub fn sha256_of(der: &[u8]) -> Self {
        Self::Sha256(Sha256::digest(der).into())
    }

    /// SHA-1 fingerprint of a certificate
    pub fn sha1_of(der: &[u8]) -> Self {
        Self::Sha1(Sha1::digest(der).into())
    }

    /// Fingerprint of a certificate computed with the same algorithm as `self`
    pub fn of_same_algorithm(&self, der: &[u8]) -> Self {
        match self {
            Self::Sha1(_) => Self::sha1_of(der),
            Self::Sha256(_) => Self::sha256_of(der),
        }
    }

    /// Check whether a DER-encoded certificate hashes to this thumbprint
    pub fn matches(&self, der: &[u8]) -> bool {
        self.of_same_algorithm(der) == *self
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(bytes) => bytes,
            Self::Sha256(bytes) => bytes,
        }
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.as_bytes()))
    }
}

impl fmt::Debug for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self {
            Self::Sha1(_) => "Sha1",
            Self::Sha256(_) => "Sha256",
        };
        write!(f, "{algorithm}({self})")
    }
}

/// Reasons a thumbprint string can't be parsed
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThumbprintError {
    #[error("thumbprint is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("thumbprint must be 20 (SHA-1) or 32 (SHA-256) bytes, got {0}")]
    Length(usize),
}

impl FromStr for Thumbprint {
    type Err = ThumbprintError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // tolerate the "AB:CD:..." and "ab cd ..." renderings
        let digits: String = value
            .chars()
            .filter(|c| !matches!(c, ':' | ' '))
            .collect();
        let bytes = hex::decode(digits)?;
        match bytes.len() {
            20 => Ok(Self::Sha1(bytes.try_into().map_err(|_| ThumbprintError::Length(20))?)),
            32 => Ok(Self::Sha256(bytes.try_into().map_err(|_| ThumbprintError::Length(32))?)),
            length => Err(ThumbprintError::Length(length)),
        }
    }
}

/// Client certificate trust policy of a single hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPolicy {
    /// Fingerprint of the root certificate a client chain must end in
    pub trusted_root_thumbprint: Thumbprint,
    /// Identity-provider tenant. Carried but not yet part of the acceptance decision.
    pub trusted_tenant_id: String,
    /// Identity-provider groups. Carried but not yet part of the acceptance decision.
    pub trusted_group_ids: BTreeSet<String>,
}

impl CertPolicy {
    pub fn new(trusted_root_thumbprint: Thumbprint) -> Self {
        Self {
            trusted_root_thumbprint,
            trusted_tenant_id: String::new(),
            trusted_group_ids: BTreeSet::new(),
        }
    }
}

/// QUIC connection parameters of a single hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicParams {
    pub alpn: Vec<u8>,
    pub default_close_error_code: u32,
    pub default_stream_error_code: u32,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Everything the proxy knows about the backend behind one hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub hostname: String,
    pub backend_address: BackendAddress,
    pub backend_protocol: BackendProtocol,
    pub cert_policy: CertPolicy,
    /// Always present for QUIC backends. TCP backends may carry it to pin the client-side ALPN.
    pub quic_params: Option<QuicParams>,
}

impl BackendDescriptor {
    /// Close code used for both the client and backend connections of this hostname
    pub fn close_error_code(&self) -> u32 {
        self.quic_params
            .as_ref()
            .map_or(0, |params| params.default_close_error_code)
    }

    /// Reset code used for streams of this hostname that can't be bridged
    pub fn stream_error_code(&self) -> u32 {
        self.quic_params
            .as_ref()
            .map_or(0, |params| params.default_stream_error_code)
    }

    /// ALPN value a client must negotiate to reach this hostname, if pinned
    pub fn alpn(&self) -> Option<&[u8]> {
        self.quic_params.as_ref().map(|params| params.alpn.as_slice())
    }
}

/// Hostname-keyed table of backends, built once at startup and read-only afterwards
#[derive(Debug, Default, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, Arc<BackendDescriptor>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a backend under a hostname, returning the descriptor it replaced (last write wins)
    pub fn add(
        &mut self,
        hostname: impl Into<String>,
        descriptor: BackendDescriptor,
    ) -> Option<Arc<BackendDescriptor>> {
        self.routes.insert(hostname.into(), Arc::new(descriptor))
    }

    /// Exact, case-sensitive lookup of a hostname
    pub fn resolve(&self, hostname: &str) -> Option<Arc<BackendDescriptor>> {
        self.routes.get(hostname).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.routes.values().map(AsRef::as_ref)
    }
}
