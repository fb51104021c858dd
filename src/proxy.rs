use crate::shutdown::Shutdown;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the read buffer each pump allocates once and reuses for every chunk
pub const BUFFER_SIZE: usize = 8 * 1024;

/// Direction label for bytes flowing from the client towards the backend
pub const CLIENT_TO_BACKEND: &str = "client -> backend";

/// Direction label for bytes flowing from the backend towards the client
pub const BACKEND_TO_CLIENT: &str = "backend -> client";

/// How a single pump direction ended, with the number of bytes it delivered
#[derive(Debug)]
pub enum PumpOutcome {
    /// The source reached end-of-stream and the destination was half-closed
    Finished { bytes: u64 },
    /// Shutdown was signalled while the pump was waiting on I/O
    Cancelled { bytes: u64 },
    /// A read or write failed. The destination was half-closed on a best-effort basis.
    Failed { bytes: u64, error: io::Error },
}

impl PumpOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Finished { bytes } | Self::Cancelled { bytes } | Self::Failed { bytes, .. } => {
                *bytes
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// Outcome of both directions of a relay
#[derive(Debug)]
pub struct RelayOutcome {
    pub client_to_backend: PumpOutcome,
    pub backend_to_client: PumpOutcome,
}

/// Copy bytes from `source` to `destination` until end-of-stream, an I/O error or shutdown.
///
/// Every chunk is written and flushed before the next read is issued, so nothing is coalesced
/// or reordered. At end-of-stream the destination's write side is shut down, which is a FIN
/// for QUIC send streams and TCP sockets alike. Errors are never retried.
#[tracing::instrument(level = "debug", skip(source, destination, shutdown))]
pub async fn pump<R, W>(
    source: &mut R,
    destination: &mut W,
    direction: &'static str,
    mut shutdown: Shutdown,
) -> PumpOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(bytes, "pump cancelled while reading");
                return PumpOutcome::Cancelled { bytes };
            }
            read = source.read(&mut buffer) => read,
        };

        let count = match read {
            Ok(0) => break,
            Ok(count) => count,
            Err(error) => return fail(destination, direction, bytes, error).await,
        };

        tracing::debug!(chunk = count, "{direction}: proxying {count} bytes");

        let written = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(bytes, "pump cancelled while writing");
                return PumpOutcome::Cancelled { bytes };
            }
            written = write_chunk(destination, &buffer[..count]) => written,
        };

        if let Err(error) = written {
            return fail(destination, direction, bytes, error).await;
        }

        bytes += count as u64;
    }

    // end-of-stream: signal "no more writes" on the other side
    if let Err(error) = destination.shutdown().await {
        tracing::debug!(%error, "{direction}: half-close failed");
    }

    tracing::debug!(bytes, "{direction}: stream closed");
    PumpOutcome::Finished { bytes }
}

/// Run two pumps in opposite directions and wait for both of them.
///
/// One side half-closing only ends its own direction; data still in flight the other way
/// keeps flowing until that direction finishes too.
pub async fn relay<CR, CW, BR, BW>(
    client_reader: &mut CR,
    client_writer: &mut CW,
    backend_reader: &mut BR,
    backend_writer: &mut BW,
    shutdown: &Shutdown,
) -> RelayOutcome
where
    CR: AsyncRead + Unpin + ?Sized,
    CW: AsyncWrite + Unpin + ?Sized,
    BR: AsyncRead + Unpin + ?Sized,
    BW: AsyncWrite + Unpin + ?Sized,
{
    let (client_to_backend, backend_to_client) = futures::future::join(
        pump(
            client_reader,
            backend_writer,
            CLIENT_TO_BACKEND,
            shutdown.clone(),
        ),
        pump(
            backend_reader,
            client_writer,
            BACKEND_TO_CLIENT,
            shutdown.clone(),
        ),
    )
    .await;

    RelayOutcome {
        client_to_backend,
        backend_to_client,
    }
}

async fn write_chunk<W>(destination: &mut W, chunk: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    destination.write_all(chunk).await?;
    destination.flush().await
}

async fn fail<W>(destination: &mut W, direction: &str, bytes: u64, error: io::Error) -> PumpOutcome
where
    W: AsyncWrite + Unpin + ?Sized,
{
    tracing::error!(%error, bytes, "{direction}: relay error");
    let _ = destination.shutdown().await;
    PumpOutcome::Failed { bytes, error }
}
