//! Listeners and accept loops.
//!
//! One listener per instance. Each owns its socket (TCP or Unix), runs an
//! accept loop, and tracks the connections it has handed to the relay so
//! shutdown can close them.
//!
//! Shutdown order per listener:
//! 1. stop the accept loop (it hands the socket back)
//! 2. let in-flight connections finish within the drain timeout
//! 3. close whatever is left and wait for the relay tasks
//! 4. close the socket and remove the socket file

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dbproxy_name::InstanceName;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::dialer::{BoxedStream, Dialer};
use super::plan::{ListenAddr, ResolvedBinding};
use super::relay::relay;
use crate::error::ProxyError;

/// Pause after a transient accept error.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for force-closed relay tasks to exit.
pub const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// What to bind and for which instance.
    pub binding: ResolvedBinding,
    /// Maximum concurrent connections. `None` means unlimited.
    pub max_connections: Option<usize>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(binding: ResolvedBinding) -> Self {
        Self {
            binding,
            max_connections: None,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being relayed.
    pub connections_active: AtomicU64,
    /// Total connections finished.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Backend dial failures.
    pub dial_failures: AtomicU64,
    /// Relays that ended with an I/O error.
    pub relay_failures: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// Identifier of a connection, unique within its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live connections of one listener, keyed by id.
///
/// The accept loop registers, relay tasks deregister through their guard,
/// and shutdown closes everything still registered.
#[derive(Debug, Default)]
pub(crate) struct ConnectionRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<ConnectionId, CancellationToken>>,
}

impl ConnectionRegistry {
    fn live(&self) -> MutexGuard<'_, HashMap<ConnectionId, CancellationToken>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection. It stays registered until the guard drops.
    pub(crate) fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let token = CancellationToken::new();
        self.live().insert(id, token.clone());
        ConnectionGuard {
            id,
            token,
            registry: Arc::clone(self),
        }
    }

    /// Number of registered connections.
    pub(crate) fn len(&self) -> usize {
        self.live().len()
    }

    /// Signal every registered connection to close. Returns how many.
    pub(crate) fn close_all(&self) -> usize {
        let live = self.live();
        for token in live.values() {
            token.cancel();
        }
        live.len()
    }
}

/// Registration of one connection; deregisters on drop.
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    id: ConnectionId,
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    /// Fires when the connection must close.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.live().remove(&self.id);
    }
}

/// Where a listener gets its connections from.
///
/// Implemented by bound sockets; the accept loop only sees this trait.
#[async_trait]
pub(crate) trait Acceptor: Send + Sync {
    /// Accept one connection. Returns the stream and a printable peer.
    async fn accept(&self) -> io::Result<(BoxedStream, String)>;
}

/// A bound socket of either kind.
enum BoundSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl BoundSocket {
    async fn bind(address: &ListenAddr) -> io::Result<(Self, ListenAddr)> {
        match address {
            ListenAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                Ok((BoundSocket::Tcp(listener), ListenAddr::Tcp(local)))
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                prepare_socket_path(path).await?;
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok((BoundSocket::Unix(listener), address.clone()))
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

#[async_trait]
impl Acceptor for BoundSocket {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        match self {
            BoundSocket::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                }
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            BoundSocket::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
        }
    }
}

/// Create the socket directory and clear a stale socket left by an earlier
/// run. Anything at the path that is not a socket is left alone.
#[cfg(unix)]
async fn prepare_socket_path(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "Removing stale socket");
            tokio::fs::remove_file(path).await
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Accept errors that only affect the connection being accepted.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_fd_exhaustion(e)
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}

/// A listener for one instance.
pub struct Listener {
    instance: InstanceName,
    local_addr: ListenAddr,
    socket: Mutex<Option<Box<dyn Acceptor>>>,
    accept_task: Mutex<Option<JoinHandle<Option<Box<dyn Acceptor>>>>>,
    registry: Arc<ConnectionRegistry>,
    stop: CancellationToken,
    tracker: TaskTracker,
    conn_semaphore: Option<Arc<Semaphore>>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the socket for `config.binding`.
    pub async fn bind(config: ListenerConfig) -> Result<Self, ProxyError> {
        let ResolvedBinding { instance, address } = config.binding;

        let (socket, local_addr) = match BoundSocket::bind(&address).await {
            Ok(bound) => bound,
            Err(source) => {
                error!(
                    instance = %instance,
                    address = %address,
                    error = %source,
                    "Failed to bind listener"
                );
                return Err(ProxyError::BindFailure {
                    instance: instance.to_string(),
                    address,
                    source,
                });
            }
        };

        info!(
            instance = %instance,
            address = %local_addr,
            max_connections = ?config.max_connections,
            "Listener bound"
        );

        Ok(Self::with_acceptor(
            instance,
            local_addr,
            Box::new(socket),
            config.max_connections,
        ))
    }

    /// A listener over an already-bound accept source.
    pub(crate) fn with_acceptor(
        instance: InstanceName,
        local_addr: ListenAddr,
        acceptor: Box<dyn Acceptor>,
        max_connections: Option<usize>,
    ) -> Self {
        Self {
            instance,
            local_addr,
            socket: Mutex::new(Some(acceptor)),
            accept_task: Mutex::new(None),
            registry: Arc::new(ConnectionRegistry::default()),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
            conn_semaphore: max_connections.map(|max| Arc::new(Semaphore::new(max))),
            stats: Arc::new(ListenerStats::default()),
        }
    }

    /// Instance served by this listener.
    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    /// The address actually bound (with the OS-chosen port for port 0).
    pub fn local_addr(&self) -> &ListenAddr {
        &self.local_addr
    }

    /// Listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Number of connections currently registered.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Start the accept loop. Does nothing if it was already started or the
    /// listener is closed.
    ///
    /// `fault` is cancelled if the loop dies on an unrecoverable error.
    pub fn start(self: &Arc<Self>, dialer: Arc<dyn Dialer>, fault: CancellationToken) {
        if self.stop.is_cancelled() {
            return;
        }
        let Some(socket) = lock(&self.socket).take() else {
            return;
        };
        let listener = Arc::clone(self);
        let handle = tokio::spawn(async move { listener.run(socket, dialer, fault).await });
        *lock(&self.accept_task) = Some(handle);
    }

    async fn run(
        self: Arc<Self>,
        socket: Box<dyn Acceptor>,
        dialer: Arc<dyn Dialer>,
        fault: CancellationToken,
    ) -> Option<Box<dyn Acceptor>> {
        info!(instance = %self.instance, address = %self.local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                accepted = socket.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer, &dialer),
                Err(e) if is_transient(&e) => {
                    warn!(instance = %self.instance, error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                Err(e) => {
                    error!(
                        instance = %self.instance,
                        address = %self.local_addr,
                        error = %e,
                        "Accept loop failed"
                    );
                    fault.cancel();
                    break;
                }
            }
        }

        debug!(instance = %self.instance, "Accept loop stopped");
        Some(socket)
    }

    /// Register an accepted connection and spawn its relay.
    fn dispatch(self: &Arc<Self>, stream: BoxedStream, peer: String, dialer: &Arc<dyn Dialer>) {
        let permit = match &self.conn_semaphore {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats
                        .connections_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        instance = %self.instance,
                        peer = %peer,
                        "Connection rejected: max connections reached"
                    );
                    return;
                }
            },
            None => None,
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let guard = self.registry.register();
        let span = tracing::info_span!(
            "connection",
            instance = %self.instance,
            connection_id = %guard.id(),
            peer = %peer
        );
        debug!(parent: &span, "Connection accepted");

        let listener = Arc::clone(self);
        let dialer = Arc::clone(dialer);

        self.tracker.spawn(
            async move {
                let stats = &listener.stats;
                match relay(stream, &listener.instance, dialer.as_ref(), guard.token()).await {
                    Ok(summary) => {
                        stats
                            .bytes_to_backend
                            .fetch_add(summary.bytes_to_backend, Ordering::Relaxed);
                        stats
                            .bytes_from_backend
                            .fetch_add(summary.bytes_from_backend, Ordering::Relaxed);
                        debug!(
                            bytes_to_backend = summary.bytes_to_backend,
                            bytes_from_backend = summary.bytes_from_backend,
                            ended_by = ?summary.ended_by,
                            "Connection closed"
                        );
                    }
                    Err(e @ ProxyError::DialFailure { .. }) => {
                        stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Dial failed");
                    }
                    Err(e) => {
                        stats.relay_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Relay failed");
                    }
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(guard);
                drop(permit);
            }
            .instrument(span),
        );
    }

    /// Stop accepting, drain connections, and close the socket.
    ///
    /// Runs the shutdown phases for this listener alone. Every step runs
    /// even if an earlier one failed. Returns the failures in the order
    /// they happened.
    pub async fn close(&self, drain_timeout: Duration) -> Vec<ProxyError> {
        let mut errors = self.stop_accepting().await;
        self.drain(Instant::now() + drain_timeout).await;
        self.close_connections();
        errors.extend(self.wait_closed(Instant::now() + FORCE_CLOSE_TIMEOUT).await);
        errors.extend(self.release());
        errors
    }

    /// Stop the accept loop and take the socket back. Once this returns no
    /// new connection is handed to the relay. The socket stays bound until
    /// [`Listener::release`].
    pub(crate) async fn stop_accepting(&self) -> Vec<ProxyError> {
        let mut errors = Vec::new();

        self.stop.cancel();
        let handle = lock(&self.accept_task).take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(socket) => *lock(&self.socket) = socket,
                Err(e) => errors.push(ProxyError::close_failure(self.resource(), e)),
            }
        }
        self.tracker.close();

        debug!(instance = %self.instance, "Accepting stopped");
        errors
    }

    /// Wait until every in-flight connection has finished or `deadline`
    /// passes. Returns true if nothing is left.
    pub(crate) async fn drain(&self, deadline: Instant) -> bool {
        if tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_ok()
        {
            return true;
        }
        debug!(
            instance = %self.instance,
            remaining = self.registry.len(),
            "Drain timeout elapsed"
        );
        false
    }

    /// Signal every remaining connection to close.
    pub(crate) fn close_connections(&self) {
        let forced = self.registry.close_all();
        if forced > 0 {
            debug!(instance = %self.instance, connections = forced, "Closing connections");
        }
    }

    /// Wait for closed connections' relay tasks to exit.
    pub(crate) async fn wait_closed(&self, deadline: Instant) -> Option<ProxyError> {
        if tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_ok()
        {
            return None;
        }
        Some(ProxyError::close_failure(
            self.resource(),
            format!(
                "{} connections still open after {:?}",
                self.registry.len(),
                FORCE_CLOSE_TIMEOUT
            ),
        ))
    }

    /// Close the socket and remove the socket file.
    pub(crate) fn release(&self) -> Option<ProxyError> {
        drop(lock(&self.socket).take());

        let mut error = None;
        if let ListenAddr::Unix(path) = &self.local_addr {
            if let Err(e) = remove_socket_file(path) {
                error = Some(ProxyError::close_failure(self.resource(), e));
            }
        }
        debug!(instance = %self.instance, "Listener closed");
        error
    }

    fn resource(&self) -> String {
        format!("listener {} for instance {}", self.local_addr, self.instance)
    }

    /// Stop the accept loop and every connection without waiting.
    pub(crate) fn abort(&self) {
        self.stop.cancel();
        self.registry.close_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
