use crate::{
    backend::BackendConnector,
    connection::{log_task_outcome, ProxiedConnection},
    error::ProxyError,
    routing::{BackendDescriptor, RoutingTable},
    shutdown::{self, Shutdown, ShutdownTrigger},
    tls::{check_client_chain, server_crypto, CertificateResolver},
};
use futures::{Stream, StreamExt};
use quinn::{
    crypto::rustls::{HandshakeData, QuicServerConfig},
    IdleTimeout, VarInt,
};
use rustls::{crypto::CryptoProvider, pki_types::CertificateDer};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

/// Close code for connections refused after the handshake
const REFUSED: VarInt = VarInt::from_u32(0);

/// Upper bound on waiting for closed connections to drain during shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings of the client-facing QUIC endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    /// ALPN values advertised to clients
    pub alpn_protocols: Vec<Vec<u8>>,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
}

impl ListenerSettings {
    pub fn new(alpn_protocols: Vec<Vec<u8>>) -> Self {
        Self {
            alpn_protocols,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Some(Duration::from_secs(2)),
        }
    }
}

/// State shared by the accept loop and every connection task
#[derive(Debug)]
struct ListenerContext {
    routes: Arc<RoutingTable>,
    connector: BackendConnector,
    handshake_timeout: Duration,
}

#[derive(Debug)]
struct Running {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    trigger: ShutdownTrigger,
    accept_loop: JoinHandle<()>,
}

/// QUIC listener that routes each handshake by SNI and hands authenticated connections to a
/// [`ProxiedConnection`]
#[derive(Debug)]
pub struct ProxyListener {
    routes: Arc<RoutingTable>,
    certificates: Arc<dyn CertificateResolver>,
    settings: ListenerSettings,
    provider: Arc<CryptoProvider>,
    running: Option<Running>,
}

impl ProxyListener {
    pub fn new(
        routes: RoutingTable,
        certificates: Arc<dyn CertificateResolver>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            routes: Arc::new(routes),
            certificates,
            settings,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Bind the listening socket and start accepting connections on a background task
    #[tracing::instrument(skip(self), err)]
    pub fn start(&mut self, bind_address: SocketAddr) -> Result<SocketAddr, ProxyError> {
        if self.running.is_some() {
            return Err(ProxyError::AlreadyStarted);
        }

        let endpoint = quinn::Endpoint::server(self.server_config()?, bind_address)
            .map_err(ProxyError::Bind)?;
        let local_addr = endpoint.local_addr().map_err(ProxyError::Bind)?;

        let (trigger, shutdown) = shutdown::channel();
        let context = Arc::new(ListenerContext {
            routes: self.routes.clone(),
            connector: BackendConnector::new(self.provider.clone()),
            handshake_timeout: self.settings.handshake_timeout,
        });
        let accept_loop = tokio::spawn(accept_connections(endpoint.clone(), context, shutdown));

        tracing::info!(%local_addr, routes = self.routes.len(), "QUIC proxy listening");
        self.running = Some(Running {
            endpoint,
            local_addr,
            trigger,
            accept_loop,
        });
        Ok(local_addr)
    }

    /// Stop accepting, wait for the accept loop and its connection tasks, then release the
    /// socket. Calling this when the listener isn't running does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.trigger.trigger();
        match running.accept_loop.await {
            Ok(()) => {}
            Err(error) if error.is_cancelled() => {}
            Err(error) => tracing::error!(%error, "accept loop failed"),
        }

        running.endpoint.close(REFUSED, b"proxy shutting down");
        if tokio::time::timeout(DRAIN_TIMEOUT, running.endpoint.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!("connections did not drain before shutdown completed");
        }

        tracing::info!(local_addr = %running.local_addr, "QUIC proxy stopped");
    }

    fn server_config(&self) -> Result<quinn::ServerConfig, ProxyError> {
        let tls = server_crypto(
            self.routes.clone(),
            self.certificates.clone(),
            self.settings.alpn_protocols.clone(),
            self.provider.clone(),
        )?;
        let crypto =
            QuicServerConfig::try_from(tls).map_err(|error| ProxyError::Quic(error.to_string()))?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(self.settings.keep_alive_interval);
        transport.max_idle_timeout(Some(
            IdleTimeout::try_from(self.settings.idle_timeout)
                .map_err(|error| ProxyError::Quic(error.to_string()))?,
        ));

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport));
        Ok(server_config)
    }
}

impl Drop for ProxyListener {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.trigger.trigger();
            running.endpoint.close(REFUSED, b"proxy dropped");
        }
    }
}

/// Connection attempts arriving at the endpoint, until it is closed
fn incoming_connections(endpoint: quinn::Endpoint) -> impl Stream<Item = quinn::Incoming> {
    futures::stream::unfold(endpoint, |endpoint| async move {
        endpoint.accept().await.map(|incoming| (incoming, endpoint))
    })
}

async fn accept_connections(
    endpoint: quinn::Endpoint,
    context: Arc<ListenerContext>,
    mut shutdown: Shutdown,
) {
    let mut connections = JoinSet::new();
    let incoming = incoming_connections(endpoint);
    tokio::pin!(incoming);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = incoming.next() => match next {
                Some(attempt) => {
                    let remote = attempt.remote_address();
                    tracing::debug!(%remote, "new connection attempted");
                    connections.spawn(
                        handle_incoming(attempt, context.clone(), shutdown.clone())
                            .instrument(tracing::info_span!("connection", %remote)),
                    );
                }
                None => {
                    tracing::warn!("endpoint stopped accepting connections");
                    break;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                log_task_outcome("connection", finished);
            }
        }
    }

    // connection tasks watch the same signal, wait for them to release their resources
    while let Some(finished) = connections.join_next().await {
        log_task_outcome("connection", finished);
    }
    tracing::debug!("accept loop stopped");
}

/// Complete the handshake, re-check routing and authorization for the negotiated hostname,
/// then proxy the connection until it ends
async fn handle_incoming(
    attempt: quinn::Incoming,
    context: Arc<ListenerContext>,
    mut shutdown: Shutdown,
) -> Result<(), ProxyError> {
    let connecting = attempt.accept()?;
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        handshake = tokio::time::timeout(context.handshake_timeout, connecting) => handshake,
    };

    let connection = match handshake {
        Ok(Ok(connection)) => connection,
        Ok(Err(error)) => {
            tracing::warn!(%error, "handshake failed");
            return Ok(());
        }
        Err(_) => return Err(ProxyError::HandshakeTimeout(context.handshake_timeout)),
    };

    let backend = match admit(&connection, &context.routes) {
        Ok(backend) => backend,
        Err(error) => {
            tracing::warn!(%error, "connection refused");
            connection.close(REFUSED, b"refused");
            return Ok(());
        }
    };

    tracing::info!(
        hostname = %backend.hostname,
        backend = %backend.backend_address,
        protocol = ?backend.backend_protocol,
        "accepted connection"
    );

    let close_code = VarInt::from_u32(backend.close_error_code());
    let result = ProxiedConnection::new(connection.clone(), backend)
        .run(&context.connector, shutdown)
        .await;
    connection.close(close_code, b"");
    result
}

/// Resolve the negotiated hostname and hold the client to that hostname's own policy.
///
/// The handshake already refused unknown hostnames and chains no policy trusts. This narrows
/// acceptance to the policy and ALPN of the exact hostname that was negotiated.
fn admit(
    connection: &quinn::Connection,
    routes: &RoutingTable,
) -> Result<Arc<BackendDescriptor>, ProxyError> {
    let handshake = connection
        .handshake_data()
        .and_then(|data| data.downcast::<HandshakeData>().ok());
    let hostname = handshake
        .as_ref()
        .and_then(|handshake| handshake.server_name.clone())
        .unwrap_or_default();

    let backend = routes
        .resolve(&hostname)
        .ok_or_else(|| ProxyError::Routing {
            hostname: hostname.clone(),
        })?;

    let chain = connection
        .peer_identity()
        .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok());
    check_client_chain(chain.as_deref().map(Vec::as_slice), None, &backend.cert_policy).map_err(
        |failure| ProxyError::Authentication {
            hostname: hostname.clone(),
            reason: failure.to_string(),
        },
    )?;

    if let Some(expected) = backend.alpn() {
        let negotiated = handshake
            .as_ref()
            .and_then(|handshake| handshake.protocol.as_deref());
        if negotiated != Some(expected) {
            return Err(ProxyError::Alpn {
                hostname,
                expected: String::from_utf8_lossy(expected).into_owned(),
                negotiated: negotiated
                    .map(|protocol| String::from_utf8_lossy(protocol).into_owned())
                    .unwrap_or_default(),
            });
        }
    }

    Ok(backend)
}
