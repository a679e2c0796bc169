//! Listener and relay implementation.
//!
//! This module provides:
//! - Binding planning (instance config to concrete addresses)
//! - TCP and Unix listener management
//! - Backend dialing through an injected capability
//! - Bidirectional connection relaying
//!
//! ## Architecture
//!
//! ```text
//! Config -> plan_bindings -> Listener (bind) -> accept loop -> relay (dial + splice) -> Backend
//! ```

mod dialer;
mod listener;
mod plan;
mod relay;

pub use dialer::{
    BoxedStream, DialError, Dialer, DirectDialer, ProxyStream, DEFAULT_CONNECT_TIMEOUT,
};
pub(crate) use listener::Acceptor;
pub use listener::{ConnectionId, Listener, ListenerConfig, ListenerStats, FORCE_CLOSE_TIMEOUT};
pub use plan::{
    parse_ip, plan_bindings, unix_socket_path, BindingKind, ListenAddr, ResolvedBinding,
    UNIX_SOCKET_NAME,
};
pub use relay::{relay, splice, RelayEnd, RelaySummary};
