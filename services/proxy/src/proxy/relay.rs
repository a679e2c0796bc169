//! Connection relay.
//!
//! For each accepted client connection: dial the backend, then copy bytes
//! both ways until either side finishes, fails, or the connection is closed
//! by shutdown. Whatever happens, both streams are dropped when the relay
//! returns, so one side closing always closes the other.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use dbproxy_name::InstanceName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::dialer::{DialError, Dialer};
use crate::error::ProxyError;

const COPY_BUFFER_SIZE: usize = 8192;

/// Which event ended a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client reached end-of-stream.
    ClientClosed,
    /// The backend reached end-of-stream.
    BackendClosed,
    /// The connection was closed by shutdown.
    Shutdown,
}

/// Outcome of a relay that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    pub ended_by: RelayEnd,
}

/// Dial `instance` and splice `client` with the backend connection.
///
/// `close` cancels both the dial and the splice. A cancelled dial is
/// reported as a dial failure.
pub async fn relay<C>(
    client: C,
    instance: &InstanceName,
    dialer: &dyn Dialer,
    close: &CancellationToken,
) -> Result<RelaySummary, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let dialed = tokio::select! {
        biased;
        _ = close.cancelled() => Err(DialError::Cancelled),
        result = dialer.dial(close, instance) => result,
    };
    let backend = dialed.map_err(|source| ProxyError::DialFailure {
        instance: instance.to_string(),
        source,
    })?;

    splice(client, backend, close)
        .await
        .map_err(|source| ProxyError::RelayFailure {
            instance: instance.to_string(),
            source,
        })
}

/// Copy bytes between `client` and `backend` until one direction ends.
pub async fn splice<A, B>(
    client: A,
    backend: B,
    close: &CancellationToken,
) -> io::Result<RelaySummary>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let to_backend = AtomicU64::new(0);
    let from_backend = AtomicU64::new(0);

    let ended_by = tokio::select! {
        result = copy_half(&mut client_read, &mut backend_write, &to_backend) => {
            result.map(|_| RelayEnd::ClientClosed)
        }
        result = copy_half(&mut backend_read, &mut client_write, &from_backend) => {
            result.map(|_| RelayEnd::BackendClosed)
        }
        _ = close.cancelled() => Ok(RelayEnd::Shutdown),
    }?;

    Ok(RelaySummary {
        bytes_to_backend: to_backend.load(Ordering::Relaxed),
        bytes_from_backend: from_backend.load(Ordering::Relaxed),
        ended_by,
    })
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::dialer::BoxedStream;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::Mutex;

    fn name() -> InstanceName {
        "projects/p/locations/r/clusters/c/instances/i".parse().unwrap()
    }

    /// Hands out one pre-made backend stream.
    struct OneShotDialer(Mutex<Option<BoxedStream>>);

    #[async_trait]
    impl Dialer for OneShotDialer {
        async fn dial(
            &self,
            _cancel: &CancellationToken,
            _instance: &InstanceName,
        ) -> Result<BoxedStream, DialError> {
            self.0
                .lock()
                .await
                .take()
                .ok_or_else(|| DialError::Other("already dialed".into()))
        }

        async fn close(&self) -> Result<(), DialError> {
            Ok(())
        }
    }

    /// Never completes a dial until cancelled.
    struct HangingDialer;

    #[async_trait]
    impl Dialer for HangingDialer {
        async fn dial(
            &self,
            cancel: &CancellationToken,
            _instance: &InstanceName,
        ) -> Result<BoxedStream, DialError> {
            cancel.cancelled().await;
            Err(DialError::Cancelled)
        }

        async fn close(&self) -> Result<(), DialError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_splice_copies_both_directions() {
        let (client, mut client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);
        let close = CancellationToken::new();

        let task = tokio::spawn(async move { splice(client, backend, &close).await });

        client_peer.write_all(b"select 1").await.unwrap();
        let mut buf = [0u8; 8];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"select 1");

        backend_peer.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        drop(client_peer);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.ended_by, RelayEnd::ClientClosed);
        assert_eq!(summary.bytes_to_backend, 8);
        assert_eq!(summary.bytes_from_backend, 2);

        // The backend side sees end-of-stream once the client is gone.
        let mut rest = Vec::new();
        backend_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_backend_close_ends_relay() {
        let (client, mut client_peer) = duplex(64);
        let (backend, backend_peer) = duplex(64);
        let close = CancellationToken::new();

        let task = tokio::spawn(async move { splice(client, backend, &close).await });
        drop(backend_peer);

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.ended_by, RelayEnd::BackendClosed);

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_close_token_ends_idle_relay() {
        let (client, _client_peer) = duplex(64);
        let (backend, _backend_peer) = duplex(64);
        let close = CancellationToken::new();

        let task = tokio::spawn({
            let close = close.clone();
            async move { splice(client, backend, &close).await }
        });
        close.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("relay should stop promptly")
            .unwrap()
            .unwrap();
        assert_eq!(summary.ended_by, RelayEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_relay_dials_backend() {
        let (client, mut client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);
        let dialer = OneShotDialer(Mutex::new(Some(Box::new(backend))));
        let close = CancellationToken::new();

        let task = tokio::spawn(async move { relay(client, &name(), &dialer, &close).await });

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(backend_peer);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.bytes_to_backend, 4);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        let (client, mut client_peer) = duplex(64);
        let dialer = OneShotDialer(Mutex::new(None));

        let err = relay(client, &name(), &dialer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::DialFailure { .. }));

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_dial_is_dial_failure() {
        let (client, _client_peer) = duplex(64);
        let close = CancellationToken::new();

        let task = tokio::spawn({
            let close = close.clone();
            async move { relay(client, &name(), &HangingDialer, &close).await }
        });
        close.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProxyError::DialFailure {
                source: DialError::Cancelled,
                ..
            }
        ));
    }
}
