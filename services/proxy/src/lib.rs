//! dbproxy daemon library.
//!
//! Exposes one local listener (TCP or Unix socket) per managed database
//! instance and relays every accepted connection to the instance through an
//! injected [`Dialer`].

pub mod client;
pub mod config;
pub mod error;
pub mod proxy;

pub use client::{Client, ClientState};
pub use config::{Config, ConfigError, FileConfig, InstanceConfig};
pub use error::{BoxError, MultiErr, ProxyError};
pub use proxy::{
    BoxedStream, DialError, Dialer, DirectDialer, ListenAddr, Listener, ListenerStats,
    ResolvedBinding,
};
