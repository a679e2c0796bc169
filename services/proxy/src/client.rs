//! The proxy client: every listener plus the dialer, under one lifecycle.
//!
//! ```text
//! Created --serve()--> Serving --close()--> Closing --> Closed
//!    \________________close()________________/
//! ```
//!
//! Construction binds every listener or none. `close` tears everything
//! down in phases, each applied to every listener before the next begins:
//!
//! 1. stop every accept loop
//! 2. drain in-flight connections under one shared deadline
//! 3. close what is left and wait for the relay tasks
//! 4. close every socket
//! 5. close the dialer
//!
//! Every step is attempted and all failures are returned together, grouped
//! by listener in configuration order, dialer last.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{MultiErr, ProxyError};
use crate::proxy::{
    plan_bindings, Dialer, ListenAddr, Listener, ListenerConfig, FORCE_CLOSE_TIMEOUT,
};

/// Lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Every listener is bound; nothing is accepted yet.
    Created,
    /// Accept loops are running.
    Serving,
    /// Shutdown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Created => "created",
            ClientState::Serving => "serving",
            ClientState::Closing => "closing",
            ClientState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Owns the listener set and the dial capability.
pub struct Client {
    listeners: Vec<Arc<Listener>>,
    dialer: Arc<dyn Dialer>,
    state: Mutex<ClientState>,
    fault: CancellationToken,
    drain_timeout: Duration,
}

impl Client {
    /// Plan and bind a listener for every configured instance.
    ///
    /// On failure every listener bound so far is closed again and the
    /// dialer is left untouched.
    pub async fn new(config: &Config, dialer: Arc<dyn Dialer>) -> Result<Self, ProxyError> {
        let bindings = plan_bindings(config)?;

        let mut listeners = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let listener_config = ListenerConfig {
                binding,
                max_connections: config.max_connections,
            };
            match Listener::bind(listener_config).await {
                Ok(listener) => listeners.push(Arc::new(listener)),
                Err(e) => {
                    for listener in &listeners {
                        for close_err in listener.close(Duration::ZERO).await {
                            warn!(error = %close_err, "Failed to release listener after bind failure");
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(listener_count = listeners.len(), "Client created");

        Ok(Self::from_listeners(
            listeners,
            dialer,
            config.drain_timeout(),
        ))
    }

    pub(crate) fn from_listeners(
        listeners: Vec<Arc<Listener>>,
        dialer: Arc<dyn Dialer>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            listeners,
            dialer,
            state: Mutex::new(ClientState::Created),
            fault: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.lock_state()
    }

    /// Listeners in configuration order.
    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// Bound addresses in configuration order.
    pub fn local_addrs(&self) -> Vec<ListenAddr> {
        self.listeners
            .iter()
            .map(|l| l.local_addr().clone())
            .collect()
    }

    /// Start every accept loop. Returns immediately; the loops run until
    /// [`Client::close`].
    pub fn serve(&self) -> Result<(), ProxyError> {
        {
            let mut state = self.lock_state();
            if *state != ClientState::Created {
                return Err(ProxyError::InvalidState {
                    actual: *state,
                    expected: ClientState::Created,
                });
            }
            *state = ClientState::Serving;
        }

        for listener in &self.listeners {
            listener.start(Arc::clone(&self.dialer), self.fault.clone());
        }
        info!(listener_count = self.listeners.len(), "Serving");
        Ok(())
    }

    /// Resolves once an accept loop has died on an unrecoverable error.
    /// The caller is expected to [`Client::close`] afterwards.
    pub async fn faulted(&self) {
        self.fault.cancelled().await
    }

    /// Shut everything down.
    ///
    /// No listener accepts new connections once the first phase is done,
    /// and the drain and force-close waits are shared by all listeners, so
    /// shutdown takes at most `drain_timeout` plus [`FORCE_CLOSE_TIMEOUT`]
    /// however many listeners there are. Calling `close` again, or while
    /// another close is running, returns `Ok(())`.
    pub async fn close(&self) -> Result<(), MultiErr> {
        {
            let mut state = self.lock_state();
            match *state {
                ClientState::Closing | ClientState::Closed => return Ok(()),
                ClientState::Created | ClientState::Serving => *state = ClientState::Closing,
            }
        }

        let mut per_listener: Vec<Vec<ProxyError>> =
            self.listeners.iter().map(|_| Vec::new()).collect();

        for (listener, errors) in self.listeners.iter().zip(&mut per_listener) {
            errors.extend(listener.stop_accepting().await);
        }

        let drain_deadline = Instant::now() + self.drain_timeout;
        for listener in &self.listeners {
            listener.drain(drain_deadline).await;
        }

        for listener in &self.listeners {
            listener.close_connections();
        }
        let force_deadline = Instant::now() + FORCE_CLOSE_TIMEOUT;
        for (listener, errors) in self.listeners.iter().zip(&mut per_listener) {
            errors.extend(listener.wait_closed(force_deadline).await);
        }

        for (listener, errors) in self.listeners.iter().zip(&mut per_listener) {
            errors.extend(listener.release());
        }

        let mut errors: MultiErr = per_listener.into_iter().flatten().collect();
        if let Err(e) = self.dialer.close().await {
            errors.push(ProxyError::close_failure("dialer", e));
        }

        *self.lock_state() = ClientState::Closed;

        if errors.is_empty() {
            info!(error_count = 0, "Shutdown complete");
        } else {
            warn!(error_count = errors.len(), errors = %errors, "Shutdown complete with errors");
        }
        errors.into_result()
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // A client dropped without close must not leave tasks running.
        if self.state() != ClientState::Closed {
            for listener in &self.listeners {
                listener.abort();
            }
        }
    }
}
