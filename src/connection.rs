use crate::{
    backend::{BackendConnection, BackendConnector, QuicBackend},
    error::ProxyError,
    proxy::{pump, relay, RelayOutcome, CLIENT_TO_BACKEND},
    routing::BackendDescriptor,
    shutdown::Shutdown,
};
use quinn::{ConnectionError, RecvStream, SendStream, StreamId, VarInt};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, task::JoinError, task::JoinSet};

/// Upper bound on relaying what is left of a client's streams once the client has gone
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A logical stream opened by the client
#[derive(Debug)]
pub enum ClientStream {
    Bidirectional(SendStream, RecvStream),
    Unidirectional(RecvStream),
}

impl ClientStream {
    pub fn id(&self) -> StreamId {
        match self {
            Self::Bidirectional(_, recv) | Self::Unidirectional(recv) => recv.id(),
        }
    }

    /// Wait for the next stream the client opens, of either directionality
    pub async fn accept(connection: &quinn::Connection) -> Result<Self, ConnectionError> {
        tokio::select! {
            bi = connection.accept_bi() => bi.map(|(send, recv)| Self::Bidirectional(send, recv)),
            uni = connection.accept_uni() => uni.map(Self::Unidirectional),
        }
    }
}

/// An authenticated client connection and the backend it was routed to
#[derive(Debug)]
pub struct ProxiedConnection {
    client: quinn::Connection,
    backend: Arc<BackendDescriptor>,
}

impl ProxiedConnection {
    pub fn new(client: quinn::Connection, backend: Arc<BackendDescriptor>) -> Self {
        Self { client, backend }
    }

    /// Connect to the backend and bridge bytes until either side goes away or shutdown is
    /// signalled. The client connection itself is left open for the caller to close.
    #[tracing::instrument(
        skip_all,
        fields(
            remote = %self.client.remote_address(),
            hostname = %self.backend.hostname,
            backend = %self.backend.backend_address,
        ),
        err
    )]
    pub async fn run(
        self,
        connector: &BackendConnector,
        mut shutdown: Shutdown,
    ) -> Result<(), ProxyError> {
        let backend = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            backend = connector.connect(&self.backend) => backend?,
        };

        match backend {
            BackendConnection::Quic(backend) => self.bridge_quic(&backend, shutdown).await,
            BackendConnection::Tcp(stream) => self.bridge_tcp(stream, shutdown).await,
        }
    }

    /// Mirror every client-opened stream onto the backend connection, one task per stream
    async fn bridge_quic(
        &self,
        backend: &QuicBackend,
        mut shutdown: Shutdown,
    ) -> Result<(), ProxyError> {
        let mut streams = JoinSet::new();
        let stream_error_code = VarInt::from_u32(self.backend.stream_error_code());
        let close_code = VarInt::from_u32(self.backend.close_error_code());

        let (result, client_left) = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("shutdown signalled, no longer accepting streams");
                    break (Ok(()), false);
                }
                accepted = ClientStream::accept(&self.client) => match accepted {
                    Ok(stream) => {
                        tracing::info!(stream = %stream.id(), "accepted stream from client");
                        streams.spawn(bridge_stream(
                            stream,
                            backend.connection().clone(),
                            stream_error_code,
                            shutdown.clone(),
                        ));
                    }
                    Err(error) => break (client_closed(error), true),
                },
                reason = backend.connection().closed() => {
                    // nothing left to relay client streams to
                    self.client.close(close_code, b"backend closed");
                    break (backend_closed(reason), false);
                }
                Some(finished) = streams.join_next(), if !streams.is_empty() => {
                    log_task_outcome("stream", finished);
                }
            }
        };

        if client_left {
            // bytes the client already handed over are still owed to the backend
            let drained = tokio::select! {
                _ = shutdown.cancelled() => false,
                drained = tokio::time::timeout(STREAM_DRAIN_TIMEOUT, drain(&mut streams)) => {
                    drained.is_ok()
                }
            };
            if !drained {
                tracing::debug!(remaining = streams.len(), "stopped waiting for streams to drain");
            }
        }

        // unblock stream tasks still waiting on backend reads
        backend.connection().close(close_code, b"client closed");
        drain(&mut streams).await;

        result
    }

    /// Relay the first client stream over a single TCP connection
    async fn bridge_tcp(
        &self,
        backend: TcpStream,
        mut shutdown: Shutdown,
    ) -> Result<(), ProxyError> {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = ClientStream::accept(&self.client) => accepted,
        };

        let stream = match accepted {
            Ok(stream) => stream,
            Err(error) => return client_closed(error),
        };
        tracing::info!(stream = %stream.id(), "accepted stream from client");

        let (mut backend_reader, mut backend_writer) = backend.into_split();
        match stream {
            ClientStream::Bidirectional(mut client_send, mut client_recv) => {
                let outcome = relay(
                    &mut client_recv,
                    &mut client_send,
                    &mut backend_reader,
                    &mut backend_writer,
                    &shutdown,
                )
                .await;
                log_relay(&outcome);
                settle(&mut client_send, &mut shutdown).await;
            }
            ClientStream::Unidirectional(mut client_recv) => {
                let outcome = pump(
                    &mut client_recv,
                    &mut backend_writer,
                    CLIENT_TO_BACKEND,
                    shutdown.clone(),
                )
                .await;
                tracing::debug!(bytes = outcome.bytes(), "unidirectional stream closed");
            }
        }

        Ok(())
    }
}

/// Open the backend counterpart of one client stream and relay between the two
#[tracing::instrument(skip_all, fields(stream = %stream.id()), err)]
async fn bridge_stream(
    stream: ClientStream,
    backend: quinn::Connection,
    stream_error_code: VarInt,
    mut shutdown: Shutdown,
) -> Result<(), ProxyError> {
    match stream {
        ClientStream::Bidirectional(mut client_send, mut client_recv) => {
            let opened = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                opened = backend.open_bi() => opened,
            };
            let (mut backend_send, mut backend_recv) = match opened {
                Ok(opened) => opened,
                Err(error) => {
                    let _ = client_send.reset(stream_error_code);
                    let _ = client_recv.stop(stream_error_code);
                    return Err(ProxyError::BackendLost(error));
                }
            };
            tracing::debug!(backend_stream = %backend_send.id(), "opened backend stream");

            let outcome = relay(
                &mut client_recv,
                &mut client_send,
                &mut backend_recv,
                &mut backend_send,
                &shutdown,
            )
            .await;
            log_relay(&outcome);
            settle(&mut client_send, &mut shutdown).await;
        }
        ClientStream::Unidirectional(mut client_recv) => {
            let opened = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                opened = backend.open_uni() => opened,
            };
            let mut backend_send = match opened {
                Ok(opened) => opened,
                Err(error) => {
                    let _ = client_recv.stop(stream_error_code);
                    return Err(ProxyError::BackendLost(error));
                }
            };
            tracing::debug!(backend_stream = %backend_send.id(), "opened backend stream");

            let outcome = pump(
                &mut client_recv,
                &mut backend_send,
                CLIENT_TO_BACKEND,
                shutdown.clone(),
            )
            .await;
            tracing::debug!(bytes = outcome.bytes(), "unidirectional stream closed");
            settle(&mut backend_send, &mut shutdown).await;
        }
    }

    Ok(())
}

async fn drain(streams: &mut JoinSet<Result<(), ProxyError>>) {
    while let Some(finished) = streams.join_next().await {
        log_task_outcome("stream", finished);
    }
}

/// Wait until the peer has received everything written to `send`, so closing the connection
/// afterwards doesn't discard relayed bytes
async fn settle(send: &mut SendStream, shutdown: &mut Shutdown) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = send.stopped() => {}
    }
}

fn log_relay(outcome: &RelayOutcome) {
    tracing::debug!(
        client_to_backend = outcome.client_to_backend.bytes(),
        backend_to_client = outcome.backend_to_client.bytes(),
        "stream closed"
    );
}

/// Map the end of the client connection to a clean stop or a connection-level failure
fn client_closed(error: ConnectionError) -> Result<(), ProxyError> {
    match error {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed
        | ConnectionError::TimedOut => {
            tracing::info!(reason = %error, "client connection closed");
            Ok(())
        }
        error => Err(ProxyError::Connection(error)),
    }
}

fn backend_closed(error: ConnectionError) -> Result<(), ProxyError> {
    match error {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::TimedOut => {
            tracing::info!(reason = %error, "backend connection closed");
            Ok(())
        }
        error => Err(ProxyError::BackendLost(error)),
    }
}

/// Log how a tracked task ended. Errors and panics stop here.
pub(crate) fn log_task_outcome(scope: &str, finished: Result<Result<(), ProxyError>, JoinError>) {
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!(%error, "{scope} failed"),
        Err(error) if error.is_cancelled() => tracing::debug!("{scope} task cancelled"),
        Err(error) => tracing::error!(%error, "unexpected {scope} task failure"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orderly_client_closes_are_not_errors() {
        let close = quinn::ApplicationClose {
            error_code: VarInt::from_u32(0),
            reason: Default::default(),
        };
        assert!(client_closed(ConnectionError::ApplicationClosed(close)).is_ok());
        assert!(client_closed(ConnectionError::LocallyClosed).is_ok());
        assert!(client_closed(ConnectionError::TimedOut).is_ok());
        assert!(matches!(
            client_closed(ConnectionError::Reset),
            Err(ProxyError::Connection(ConnectionError::Reset))
        ));
    }

    #[test]
    fn backend_resets_are_reported() {
        assert!(backend_closed(ConnectionError::TimedOut).is_ok());
        assert!(matches!(
            backend_closed(ConnectionError::Reset),
            Err(ProxyError::BackendLost(ConnectionError::Reset))
        ));
        // the proxy closes its own backend connections only after the bridge has returned
        assert!(matches!(
            backend_closed(ConnectionError::LocallyClosed),
            Err(ProxyError::BackendLost(_))
        ));
    }
}
