use crate::{
    endpoint::ListenerSettings,
    routing::{
        BackendAddress, BackendDescriptor, BackendProtocol, CertPolicy, QuicParams, RoutingTable,
        Thumbprint, ThumbprintError,
    },
    tls::CertificateStore,
};
use quinn::IdleTimeout;
use rustls::{crypto::CryptoProvider, sign::CertifiedKey};
use serde::Deserialize;
use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, BufReader},
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

/// Startup configuration errors. Any of these aborts the process before the listener binds.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("alpnList must name at least one protocol")]
    EmptyAlpnList,
    #[error("{hostname} is a QUIC backend but has no quicSettings")]
    MissingQuicSettings { hostname: String },
    #[error("{hostname} pins ALPN {alpn:?}, which is not in alpnList")]
    UnlistedAlpn { hostname: String, alpn: String },
    #[error("invalid rootCAThumbprint for {hostname}: {source}")]
    Thumbprint {
        hostname: String,
        source: ThumbprintError,
    },
    #[error("{setting} of {scope} must be a positive QUIC idle-timeout value, got {seconds}")]
    Timeout {
        scope: String,
        setting: &'static str,
        seconds: u64,
    },
    #[error("invalid listener ip {ip:?}: {source}")]
    ListenAddress {
        ip: String,
        source: std::net::AddrParseError,
    },
    #[error("failed to load certificate for {hostname} from {}: {reason}", path.display())]
    Certificate {
        hostname: String,
        path: PathBuf,
        reason: String,
    },
}

/// Contents of the JSON settings file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub alpn_list: Vec<String>,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub handshake_timeout_in_seconds: Option<u64>,
    #[serde(default)]
    pub idle_timeout_in_seconds: Option<u64>,
    #[serde(default)]
    pub keep_alive_interval_in_seconds: Option<u64>,
    pub servers: Vec<ServerEntry>,
}

/// One proxied hostname
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub host_name: String,
    pub ip: String,
    pub port: u16,
    pub cert_path: PathBuf,
    /// Private key file. The key is read from `cert_path` when absent.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    pub protocol_type: ProtocolType,
    pub cert_validation_settings: CertValidationSettings,
    #[serde(default)]
    pub quic_settings: Option<QuicSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProtocolType {
    Quic,
    Tcp,
}

impl From<ProtocolType> for BackendProtocol {
    fn from(protocol: ProtocolType) -> Self {
        match protocol {
            ProtocolType::Quic => Self::Quic,
            ProtocolType::Tcp => Self::Tcp,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertValidationSettings {
    #[serde(rename = "rootCAThumbprint")]
    pub root_ca_thumbprint: String,
    #[serde(default)]
    pub entra_tenant_id: String,
    #[serde(default)]
    pub entra_group_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuicSettings {
    pub alpn: String,
    #[serde(default)]
    pub default_close_error_code: u32,
    #[serde(default)]
    pub default_stream_error_code: u32,
    pub handshake_timeout_in_seconds: u64,
    pub idle_timeout_in_seconds: u64,
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Socket address the proxy listens on
    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|source| ConfigError::ListenAddress {
                ip: self.ip.clone(),
                source,
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn listener_settings(&self) -> Result<ListenerSettings, ConfigError> {
        if self.alpn_list.is_empty() {
            return Err(ConfigError::EmptyAlpnList);
        }

        let mut settings = ListenerSettings::new(
            self.alpn_list
                .iter()
                .map(|alpn| alpn.as_bytes().to_vec())
                .collect(),
        );
        let scope = "listener";
        if let Some(seconds) = self.handshake_timeout_in_seconds {
            settings.handshake_timeout = timeout(scope, "handshakeTimeoutInSeconds", seconds)?;
        }
        if let Some(seconds) = self.idle_timeout_in_seconds {
            settings.idle_timeout = timeout(scope, "idleTimeoutInSeconds", seconds)?;
        }
        if let Some(seconds) = self.keep_alive_interval_in_seconds {
            settings.keep_alive_interval =
                Some(timeout(scope, "keepAliveIntervalInSeconds", seconds)?);
        }
        Ok(settings)
    }

    /// Validate every server entry and build the routing table from them
    pub fn routing_table(&self) -> Result<RoutingTable, ConfigError> {
        let mut routes = RoutingTable::new();
        for server in &self.servers {
            let descriptor = self.descriptor(server)?;
            if routes.add(server.host_name.clone(), descriptor).is_some() {
                tracing::warn!(
                    hostname = %server.host_name,
                    "hostname configured more than once, the later entry wins"
                );
            }
        }
        Ok(routes)
    }

    /// Load the server certificate of every hostname. Relative paths are resolved against
    /// `base_dir`.
    pub fn certificate_store(
        &self,
        base_dir: &Path,
        provider: &CryptoProvider,
    ) -> Result<CertificateStore, ConfigError> {
        let mut store = CertificateStore::new();
        for server in &self.servers {
            let cert_path = base_dir.join(&server.cert_path);
            let key_path = base_dir.join(server.key_path.as_ref().unwrap_or(&server.cert_path));
            let certified = load_certified_key(&server.host_name, &cert_path, &key_path, provider)?;
            store.insert(server.host_name.clone(), certified);
        }
        Ok(store)
    }

    fn descriptor(&self, server: &ServerEntry) -> Result<BackendDescriptor, ConfigError> {
        let hostname = &server.host_name;
        let protocol = BackendProtocol::from(server.protocol_type);

        let quic_params = match (&server.quic_settings, protocol) {
            (None, BackendProtocol::Quic) => {
                return Err(ConfigError::MissingQuicSettings {
                    hostname: hostname.clone(),
                })
            }
            (None, BackendProtocol::Tcp) => None,
            (Some(settings), _) => {
                if !self.alpn_list.contains(&settings.alpn) {
                    return Err(ConfigError::UnlistedAlpn {
                        hostname: hostname.clone(),
                        alpn: settings.alpn.clone(),
                    });
                }
                Some(QuicParams {
                    alpn: settings.alpn.as_bytes().to_vec(),
                    default_close_error_code: settings.default_close_error_code,
                    default_stream_error_code: settings.default_stream_error_code,
                    handshake_timeout: timeout(
                        hostname,
                        "handshakeTimeoutInSeconds",
                        settings.handshake_timeout_in_seconds,
                    )?,
                    idle_timeout: timeout(
                        hostname,
                        "idleTimeoutInSeconds",
                        settings.idle_timeout_in_seconds,
                    )?,
                })
            }
        };

        let validation = &server.cert_validation_settings;
        let thumbprint: Thumbprint =
            validation
                .root_ca_thumbprint
                .parse()
                .map_err(|source| ConfigError::Thumbprint {
                    hostname: hostname.clone(),
                    source,
                })?;

        Ok(BackendDescriptor {
            hostname: hostname.clone(),
            backend_address: BackendAddress::new(server.ip.clone(), server.port),
            backend_protocol: protocol,
            cert_policy: CertPolicy {
                trusted_root_thumbprint: thumbprint,
                trusted_tenant_id: validation.entra_tenant_id.clone(),
                trusted_group_ids: validation.entra_group_ids.clone(),
            },
            quic_params,
        })
    }
}

fn timeout(scope: &str, setting: &'static str, seconds: u64) -> Result<Duration, ConfigError> {
    let duration = Duration::from_secs(seconds);
    if seconds == 0 || IdleTimeout::try_from(duration).is_err() {
        return Err(ConfigError::Timeout {
            scope: scope.to_string(),
            setting,
            seconds,
        });
    }
    Ok(duration)
}

/// Read a PEM certificate chain and private key into a signing identity
pub fn load_certified_key(
    hostname: &str,
    cert_path: &Path,
    key_path: &Path,
    provider: &CryptoProvider,
) -> Result<CertifiedKey, ConfigError> {
    let failed = |path: &Path, reason: String| ConfigError::Certificate {
        hostname: hostname.to_string(),
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = BufReader::new(
        File::open(cert_path).map_err(|error| failed(cert_path, error.to_string()))?,
    );
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| failed(cert_path, error.to_string()))?;
    if chain.is_empty() {
        return Err(failed(cert_path, "no certificates found".to_string()));
    }

    let mut reader =
        BufReader::new(File::open(key_path).map_err(|error| failed(key_path, error.to_string()))?);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|error| failed(key_path, error.to_string()))?
        .ok_or_else(|| failed(key_path, "no private key found".to_string()))?;
    let key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|error| failed(key_path, error.to_string()))?;

    Ok(CertifiedKey::new(chain, key))
}
