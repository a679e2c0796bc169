//! Backend dial capability.
//!
//! The proxy never connects to a backend itself. It asks a [`Dialer`] for a
//! stream per accepted client connection and closes the dialer once, on
//! shutdown. Real connectors (authentication, TLS) and test doubles both
//! plug in here.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dbproxy_name::InstanceName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default connect timeout for the direct dialer.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A bidirectional byte stream the relay can splice.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Type-erased stream returned by dialers.
pub type BoxedStream = Box<dyn ProxyStream>;

/// Dial errors.
#[derive(Debug, Error)]
pub enum DialError {
    /// The dial was cancelled before it completed.
    #[error("dial cancelled")]
    Cancelled,

    /// The backend did not answer in time.
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    /// The dialer does not know how to reach this instance.
    #[error("no upstream configured for {0}")]
    UnknownInstance(String),

    /// The dialer was already closed.
    #[error("dialer is closed")]
    Closed,

    /// Connection-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Any other connector failure.
    #[error("{0}")]
    Other(String),
}

/// Establishes backend connections for instances.
///
/// `dial` is called concurrently from every relay task. `close` is called at
/// most once, by the client, after every listener has shut down.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `instance`. Implementations must return promptly with
    /// [`DialError::Cancelled`] once `cancel` fires.
    async fn dial(
        &self,
        cancel: &CancellationToken,
        instance: &InstanceName,
    ) -> Result<BoxedStream, DialError>;

    /// Release any resources held by the dialer.
    async fn close(&self) -> Result<(), DialError>;
}

/// Dialer that connects over plain TCP to a fixed upstream per instance.
///
/// No authentication or encryption; intended for local development against
/// a reachable database.
pub struct DirectDialer {
    /// Upstream `host:port` keyed by canonical instance key.
    upstreams: HashMap<String, String>,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl DirectDialer {
    /// Create a dialer with no upstreams.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            upstreams: HashMap::new(),
            connect_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Register the upstream address for an instance.
    pub fn with_upstream(mut self, instance: &InstanceName, addr: impl Into<String>) -> Self {
        self.upstreams.insert(instance.key(), addr.into());
        self
    }

    /// Number of configured upstreams.
    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    /// True if no upstream is configured, so every dial will fail.
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        instance: &InstanceName,
    ) -> Result<BoxedStream, DialError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DialError::Closed);
        }
        let addr = self
            .upstreams
            .get(&instance.key())
            .ok_or_else(|| DialError::UnknownInstance(instance.to_string()))?;

        debug!(instance = %instance, upstream = %addr, "Connecting to upstream");

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            result = timeout(self.connect_timeout, TcpStream::connect(addr.as_str())) => {
                result.map_err(|_| DialError::Timeout(self.connect_timeout))??
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> Result<(), DialError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DialError::Closed);
        }
        Ok(())
    }
}
