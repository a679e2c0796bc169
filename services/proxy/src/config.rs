//! Proxy configuration.
//!
//! Defaults, then an optional TOML file, then command-line flags. The
//! resulting [`Config`] is handed to `Client::new` and never changes
//! afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// Default base port (the Postgres port).
pub const DEFAULT_PORT: u16 = 5432;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid instance argument '{arg}': {reason}")]
    InvalidInstance { arg: String, reason: String },

    #[error("invalid upstream '{arg}': expected <instance>=<host:port>")]
    InvalidUpstream { arg: String },
}

/// Global settings plus the instances to serve.
///
/// `address` and `port` stay unset unless given explicitly, so the planner
/// can tell a requested TCP listener from the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address to listen on for TCP instances. Defaults to [`DEFAULT_ADDRESS`].
    pub address: Option<String>,

    /// First port to hand out to TCP instances without an explicit port.
    /// Defaults to [`DEFAULT_PORT`].
    pub port: Option<u16>,

    /// Directory for Unix sockets. When set, and neither `address` nor
    /// `port` is, instances without a TCP override listen on
    /// `<dir>/<short-name>/.s.PGSQL.5432`.
    pub unix_socket: Option<PathBuf>,

    /// Per-listener limit on concurrent connections. Unset means unlimited.
    pub max_connections: Option<usize>,

    /// Grace period for in-flight connections on shutdown before they are
    /// closed forcibly.
    pub drain_timeout_secs: u64,

    /// Instances to serve, in listener order.
    pub instances: Vec<InstanceConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(FileConfig::load(path)?.proxy)
    }

    /// The global TCP address, explicit or default.
    pub fn listen_address(&self) -> &str {
        self.address.as_deref().unwrap_or(DEFAULT_ADDRESS)
    }

    /// The first automatically allocated port, explicit or default.
    pub fn base_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Returns true if a global TCP address or port was set explicitly.
    pub fn requests_tcp(&self) -> bool {
        self.address.is_some() || self.port.is_some()
    }

    /// Shutdown grace period.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// One managed instance and its overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Fully-qualified instance name.
    pub name: String,

    /// Listen address override.
    #[serde(default)]
    pub address: Option<String>,

    /// Listen port override. Used verbatim.
    #[serde(default)]
    pub port: Option<u16>,

    /// Unix socket directory override.
    #[serde(default)]
    pub unix_socket: Option<PathBuf>,
}

impl InstanceConfig {
    /// An instance with no overrides.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_unix_socket(mut self, dir: impl Into<PathBuf>) -> Self {
        self.unix_socket = Some(dir.into());
        self
    }
}

/// Parses the command-line form `<name>?port=6000&address=0.0.0.0&unix-socket=/dir`.
impl FromStr for InstanceConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidInstance {
            arg: s.to_string(),
            reason,
        };

        let (name, query) = match s.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (s, None),
        };
        if name.is_empty() {
            return Err(invalid("missing instance name".to_string()));
        }

        let mut inst = InstanceConfig::new(name);
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(invalid(format!("expected key=value, got '{pair}'")));
            };
            if value.is_empty() {
                return Err(invalid(format!("empty value for '{key}'")));
            }
            match key {
                "address" => inst.address = Some(value.to_string()),
                "port" => {
                    let port = value
                        .parse()
                        .map_err(|_| invalid(format!("port '{value}' is not a valid port")))?;
                    inst.port = Some(port);
                }
                "unix-socket" => inst.unix_socket = Some(PathBuf::from(value)),
                other => return Err(invalid(format!("unknown parameter '{other}'"))),
            }
        }
        Ok(inst)
    }
}

/// On-disk configuration: the proxy settings plus the direct dialer's
/// upstream table.
///
/// ```toml
/// address = "127.0.0.1"
/// port = 5432
///
/// [[instances]]
/// name = "projects/p/locations/r/clusters/c/instances/i"
/// port = 6000
///
/// [upstreams]
/// "projects/p/locations/r/clusters/c/instances/i" = "10.0.0.5:5432"
/// ```
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub proxy: Config,

    /// Instance name to `host:port` for the direct dialer.
    pub upstreams: BTreeMap<String, String>,

    /// Connect timeout for the direct dialer.
    pub connect_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse TOML text. Unknown top-level keys are rejected.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut table: toml::Table = toml::from_str(content)?;

        let upstreams = table
            .remove("upstreams")
            .map(toml::Value::try_into)
            .transpose()?
            .unwrap_or_default();
        let connect_timeout_secs = table
            .remove("connect_timeout_secs")
            .map(toml::Value::try_into)
            .transpose()?;
        let proxy = toml::Value::Table(table).try_into()?;

        Ok(Self {
            proxy,
            upstreams,
            connect_timeout_secs,
        })
    }
}

/// Parse an `--upstream <instance>=<host:port>` argument.
pub fn parse_upstream(arg: &str) -> Result<(String, String), ConfigError> {
    match arg.rsplit_once('=') {
        Some((name, addr)) if !name.is_empty() && !addr.is_empty() => {
            Ok((name.to_string(), addr.to_string()))
        }
        _ => Err(ConfigError::InvalidUpstream {
            arg: arg.to_string(),
        }),
    }
}
