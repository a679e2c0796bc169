//! Binding planner.
//!
//! Turns the global defaults plus per-instance overrides into one concrete
//! listen address per instance, before any socket is opened.
//!
//! Rules:
//! - An instance listens on a Unix socket when it sets its own socket
//!   directory, or when a global socket directory is configured and no TCP
//!   address or port was requested, globally or for the instance.
//! - TCP address: instance override, else the global address.
//! - TCP port: instance override verbatim, else the first port at or above
//!   the global port that nothing else claims on the same address.
//!   Explicit ports are claimed before any automatic allocation happens.
//! - Port 0 is left to the OS and never conflicts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use dbproxy_name::InstanceName;

use crate::config::{Config, InstanceConfig};
use crate::error::ProxyError;

/// File name of the socket inside each instance directory.
///
/// Postgres clients look for `<dir>/.s.PGSQL.<port>`, so this must not change.
pub const UNIX_SOCKET_NAME: &str = ".s.PGSQL.5432";

/// Kind of socket a binding opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Tcp,
    Unix,
}

/// A concrete address to listen on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddr {
    /// TCP address. IPv6 addresses display in bracket notation.
    Tcp(SocketAddr),
    /// Filesystem path of a Unix domain socket.
    Unix(PathBuf),
}

impl ListenAddr {
    /// The kind of socket this address needs.
    pub fn kind(&self) -> BindingKind {
        match self {
            ListenAddr::Tcp(_) => BindingKind::Tcp,
            ListenAddr::Unix(_) => BindingKind::Unix,
        }
    }

    /// The TCP socket address, if this is a TCP binding.
    pub fn as_tcp(&self) -> Option<SocketAddr> {
        match self {
            ListenAddr::Tcp(addr) => Some(*addr),
            ListenAddr::Unix(_) => None,
        }
    }

    /// The socket path, if this is a Unix binding.
    pub fn as_unix(&self) -> Option<&Path> {
        match self {
            ListenAddr::Tcp(_) => None,
            ListenAddr::Unix(path) => Some(path),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{}", addr),
            ListenAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// The planner's output for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinding {
    /// Instance served by this binding.
    pub instance: InstanceName,
    /// Where to listen.
    pub address: ListenAddr,
}

/// Socket path for an instance under `dir`.
pub fn unix_socket_path(dir: &Path, instance: &InstanceName) -> PathBuf {
    dir.join(instance.short_name()).join(UNIX_SOCKET_NAME)
}

/// Parse a configured address. `localhost` maps to the IPv4 loopback.
pub fn parse_ip(address: &str) -> Option<IpAddr> {
    if address.eq_ignore_ascii_case("localhost") {
        return Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    let trimmed = address
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(address);
    trimmed.parse().ok()
}

/// Intermediate per-instance result before ports are allocated.
enum Pending {
    Unix(PathBuf),
    Tcp { ip: IpAddr, port: Option<u16> },
}

/// Compute one binding per configured instance, in configuration order.
///
/// Fails without touching the network or filesystem when any name is
/// invalid, an instance is listed twice, or two instances would share an
/// address.
pub fn plan_bindings(config: &Config) -> Result<Vec<ResolvedBinding>, ProxyError> {
    if config.instances.is_empty() {
        return Err(ProxyError::NoInstances);
    }

    let names = parse_names(&config.instances)?;

    let mut pending = Vec::with_capacity(names.len());
    for (inst, name) in config.instances.iter().zip(&names) {
        pending.push(resolve_kind(config, inst, name)?);
    }

    // Explicit ports win, so claim them before allocating anything.
    let mut claimed: HashSet<(IpAddr, u16)> = pending
        .iter()
        .filter_map(|p| match p {
            Pending::Tcp {
                ip,
                port: Some(port),
            } if *port != 0 => Some((*ip, *port)),
            _ => None,
        })
        .collect();

    let mut bindings = Vec::with_capacity(pending.len());
    for (p, name) in pending.into_iter().zip(names) {
        let address = match p {
            Pending::Unix(path) => ListenAddr::Unix(path),
            Pending::Tcp {
                ip,
                port: Some(port),
            } => ListenAddr::Tcp(SocketAddr::new(ip, port)),
            Pending::Tcp { ip, port: None } => {
                let base = config.base_port();
                let port = next_free_port(&claimed, ip, base).ok_or_else(|| {
                    ProxyError::PortsExhausted {
                        instance: name.to_string(),
                        address: ip,
                        base,
                    }
                })?;
                if port != 0 {
                    claimed.insert((ip, port));
                }
                ListenAddr::Tcp(SocketAddr::new(ip, port))
            }
        };
        bindings.push(ResolvedBinding {
            instance: name,
            address,
        });
    }

    check_conflicts(&bindings)?;
    Ok(bindings)
}

fn parse_names(instances: &[InstanceConfig]) -> Result<Vec<InstanceName>, ProxyError> {
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(instances.len());
    for inst in instances {
        let name = InstanceName::parse(&inst.name)?;
        if !seen.insert(name.key()) {
            return Err(ProxyError::DuplicateInstance {
                instance: name.to_string(),
            });
        }
        names.push(name);
    }
    Ok(names)
}

fn resolve_kind(
    config: &Config,
    inst: &InstanceConfig,
    name: &InstanceName,
) -> Result<Pending, ProxyError> {
    let wants_tcp = inst.address.is_some() || inst.port.is_some() || config.requests_tcp();
    let unix_dir = match (&inst.unix_socket, &config.unix_socket) {
        (Some(dir), _) => Some(dir),
        (None, Some(dir)) if !wants_tcp => Some(dir),
        _ => None,
    };

    if let Some(dir) = unix_dir {
        return Ok(Pending::Unix(unix_socket_path(dir, name)));
    }

    let address = inst
        .address
        .as_deref()
        .unwrap_or_else(|| config.listen_address());
    let ip = parse_ip(address).ok_or_else(|| ProxyError::InvalidAddress {
        instance: name.to_string(),
        address: address.to_string(),
    })?;

    Ok(Pending::Tcp {
        ip,
        port: inst.port,
    })
}

fn next_free_port(claimed: &HashSet<(IpAddr, u16)>, ip: IpAddr, base: u16) -> Option<u16> {
    if base == 0 {
        return Some(0);
    }
    (base..=u16::MAX).find(|port| !claimed.contains(&(ip, *port)))
}

fn check_conflicts(bindings: &[ResolvedBinding]) -> Result<(), ProxyError> {
    let mut owners: HashMap<&ListenAddr, &InstanceName> = HashMap::new();
    for binding in bindings {
        if matches!(binding.address, ListenAddr::Tcp(addr) if addr.port() == 0) {
            continue;
        }
        if let Some(first) = owners.insert(&binding.address, &binding.instance) {
            return Err(ProxyError::BindConflict {
                first: first.to_string(),
                second: binding.instance.to_string(),
                address: binding.address.clone(),
            });
        }
    }
    Ok(())
}
