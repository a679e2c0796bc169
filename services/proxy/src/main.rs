//! dbproxy
//!
//! Local proxy daemon for managed database instances.
//!
//! This binary:
//! - Plans one listener per instance (TCP port or Unix socket)
//! - Accepts client connections on every listener
//! - Relays each connection to its instance through a dialer
//! - Shuts down cleanly on SIGINT / SIGTERM, reporting every close failure

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dbproxy_daemon::config::parse_upstream;
use dbproxy_daemon::proxy::DEFAULT_CONNECT_TIMEOUT;
use dbproxy_daemon::{Client, Config, DirectDialer, FileConfig, InstanceConfig};
use dbproxy_name::InstanceName;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// Expose managed database instances on local ports and Unix sockets.
#[derive(Debug, Parser)]
#[command(name = "dbproxy", version)]
struct Cli {
    /// Instances to serve, e.g.
    /// `projects/p/locations/r/clusters/c/instances/i?port=6000`.
    /// Supported parameters: address, port, unix-socket.
    instances: Vec<InstanceConfig>,

    /// Address to listen on.
    #[arg(short, long, env = "DBPROXY_ADDRESS")]
    address: Option<String>,

    /// First port to assign to instances without an explicit port.
    /// Setting this or --address makes instances listen on TCP even when
    /// --unix-socket is given.
    #[arg(short, long, env = "DBPROXY_PORT")]
    port: Option<u16>,

    /// Directory for Unix sockets.
    #[arg(short, long, env = "DBPROXY_UNIX_SOCKET")]
    unix_socket: Option<PathBuf>,

    /// Maximum concurrent connections per instance.
    #[arg(long, env = "DBPROXY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Seconds to let connections finish on shutdown before closing them.
    #[arg(long, env = "DBPROXY_DRAIN_TIMEOUT_SECS")]
    drain_timeout_secs: Option<u64>,

    /// TOML config file. Flags override its values.
    #[arg(short, long, env = "DBPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream for an instance as `<instance>=<host:port>`. Repeatable.
    #[arg(long = "upstream", value_parser = parse_upstream)]
    upstreams: Vec<(String, String)>,

    /// Upstream connect timeout in seconds.
    #[arg(long, env = "DBPROXY_CONNECT_TIMEOUT_SECS")]
    connect_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "DBPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl Cli {
    /// Merge defaults, the config file, and flags.
    fn build(&self) -> Result<(Config, DirectDialer)> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path).context("Failed to load config file")?,
            None => FileConfig::default(),
        };

        let mut config = file.proxy;
        if let Some(address) = &self.address {
            config.address = Some(address.clone());
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(dir) = &self.unix_socket {
            config.unix_socket = Some(dir.clone());
        }
        if let Some(max) = self.max_connections {
            config.max_connections = Some(max);
        }
        if let Some(secs) = self.drain_timeout_secs {
            config.drain_timeout_secs = secs;
        }
        config.instances.extend(self.instances.iter().cloned());

        let connect_timeout = self
            .connect_timeout_secs
            .or(file.connect_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let mut dialer = DirectDialer::new(connect_timeout);
        let flag_upstreams = self.upstreams.iter().map(|(name, addr)| (name, addr));
        for (name, addr) in file.upstreams.iter().chain(flag_upstreams) {
            let instance: InstanceName = name
                .parse()
                .with_context(|| format!("Invalid upstream instance '{name}'"))?;
            dialer = dialer.with_upstream(&instance, addr);
        }

        Ok((config, dialer))
    }
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, dialer) = cli.build()?;

    init_tracing(&cli.log_level, cli.log_format);

    info!("Starting dbproxy");
    info!(
        address = %config.listen_address(),
        port = config.base_port(),
        unix_socket = ?config.unix_socket,
        instance_count = config.instances.len(),
        upstream_count = dialer.len(),
        "Configuration loaded"
    );
    if dialer.is_empty() {
        warn!("No upstreams configured; every connection will fail to dial");
    }

    let client = Client::new(&config, Arc::new(dialer))
        .await
        .context("Failed to start listeners")?;
    client.serve()?;

    for addr in client.local_addrs() {
        info!(address = %addr, "Ready for connections");
    }

    tokio::select! {
        _ = shutdown_signal() => info!("Received shutdown signal"),
        _ = client.faulted() => error!("Listener failed, shutting down"),
    }

    client.close().await.context("Shutdown finished with errors")?;
    info!("dbproxy shutdown complete");
    Ok(())
}
