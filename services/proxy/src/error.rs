//! Error types for the proxy daemon.
//!
//! `ProxyError` covers everything from planning through shutdown. Startup
//! errors abort client construction, per-connection errors stay inside the
//! connection's task, and close errors are collected into a [`MultiErr`].

use std::fmt;
use std::io;
use std::net::IpAddr;

use dbproxy_name::NameError;
use thiserror::Error;

use crate::client::ClientState;
use crate::proxy::{DialError, ListenAddr};

/// Boxed error used where failures of different types are collected together.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Proxy errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The configuration has no instances to serve.
    #[error("no instances configured")]
    NoInstances,

    /// An instance name could not be parsed.
    #[error("invalid instance identifier: {0}")]
    InvalidIdentifier(#[from] NameError),

    /// The same instance is listed more than once.
    #[error("instance {instance} is configured more than once")]
    DuplicateInstance { instance: String },

    /// An address is not an IP literal.
    #[error("invalid address '{address}' for instance {instance}")]
    InvalidAddress { instance: String, address: String },

    /// Automatic port allocation ran out of ports.
    #[error("no free port at or above {base} on {address} for instance {instance}")]
    PortsExhausted {
        instance: String,
        address: IpAddr,
        base: u16,
    },

    /// Two instances resolve to the same address.
    #[error("instances {first} and {second} both resolve to {address}")]
    BindConflict {
        first: String,
        second: String,
        address: ListenAddr,
    },

    /// The OS refused to bind or listen.
    #[error("failed to bind {address} for instance {instance}: {source}")]
    BindFailure {
        instance: String,
        address: ListenAddr,
        #[source]
        source: io::Error,
    },

    /// The backend connection could not be established.
    #[error("failed to dial instance {instance}: {source}")]
    DialFailure {
        instance: String,
        #[source]
        source: DialError,
    },

    /// I/O failed while relaying bytes.
    #[error("relay for instance {instance} failed: {source}")]
    RelayFailure {
        instance: String,
        #[source]
        source: io::Error,
    },

    /// A listener or the dialer failed to close.
    #[error("failed to close {resource}: {source}")]
    CloseFailure {
        resource: String,
        #[source]
        source: BoxError,
    },

    /// An operation was called in the wrong lifecycle state.
    #[error("client is {actual}, expected {expected}")]
    InvalidState {
        actual: ClientState,
        expected: ClientState,
    },
}

impl ProxyError {
    /// Create a close failure for the named resource.
    pub fn close_failure(resource: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::CloseFailure {
            resource: resource.into(),
            source: source.into(),
        }
    }
}

/// An ordered collection of independent failures.
///
/// Renders as every message joined by `", "` in the order the errors were
/// pushed. An empty `MultiErr` is never returned as an error; use
/// [`MultiErr::into_result`] to convert.
#[derive(Debug, Default)]
pub struct MultiErr(Vec<BoxError>);

impl MultiErr {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an error.
    pub fn push(&mut self, err: impl Into<BoxError>) {
        self.0.push(err.into());
    }

    /// Number of collected errors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the collected errors in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(dyn std::error::Error + Send + Sync + 'static)> {
        self.0.iter().map(|e| e.as_ref())
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), MultiErr> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiErr {}

impl<E: Into<BoxError>> FromIterator<E> for MultiErr {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<E: Into<BoxError>> Extend<E> for MultiErr {
    fn extend<I: IntoIterator<Item = E>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}
