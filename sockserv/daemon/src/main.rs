//! sockserv Daemon - Reference Socket Server
//!
//! Serves an echo or uppercase handler on any sockserv endpoint. It owns
//! everything the core library leaves to its caller: configuration loading,
//! logging setup, OS signals and bounded draining of in-flight connections.
//!
//! # Usage
//!
//! ```bash
//! # UNIX socket at the default path ($XDG_RUNTIME_DIR/sockserv/sockserv.sock)
//! sockserv-daemon
//!
//! # TCP on every interface
//! sockserv-daemon --protocol tcp --address :7000
//!
//! # UNIX datagram socket, owner-only
//! sockserv-daemon --protocol unixgram --address /tmp/dgram.sock --permissions 0600
//!
//! # From a config file
//! sockserv-daemon --config /etc/sockserv/server.toml
//!
//! # Verbose logging
//! RUST_LOG=debug sockserv-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop accepting, then drain for `--drain-timeout-ms`

mod handlers;
mod server;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sockserv_core::{default_socket_path, parse_octal, NetworkProtocol, ServerConfig};

use handlers::HandlerKind;

/// sockserv daemon - concurrent echo/uppercase socket server
#[derive(Parser, Debug)]
#[command(name = "sockserv-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file (TOML); command-line flags override its values
    #[arg(short = 'c', long, env = "SOCKSERV_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Protocol: tcp, tcp4, tcp6, udp, udp4, udp6, unix, unixgram
    #[arg(short = 'p', long, env = "SOCKSERV_PROTOCOL")]
    protocol: Option<NetworkProtocol>,

    /// `host:port`, `:port` or socket path
    #[arg(short = 'a', long, env = "SOCKSERV_ADDRESS")]
    address: Option<String>,

    /// Socket file permissions in octal (UNIX protocols)
    #[arg(long, env = "SOCKSERV_PERMISSIONS", value_parser = parse_permissions)]
    permissions: Option<u32>,

    /// Group id owning the socket file (UNIX protocols)
    #[arg(long, env = "SOCKSERV_GROUP")]
    group: Option<u32>,

    /// Close connections idle for this many milliseconds (0 disables)
    #[arg(long, env = "SOCKSERV_IDLE_TIMEOUT_MS")]
    idle_timeout_ms: Option<u64>,

    /// Handler to serve
    #[arg(short = 'm', long, value_enum, default_value_t = HandlerKind::Echo)]
    mode: HandlerKind,

    /// How long to wait for in-flight connections after a stop signal
    #[arg(long, env = "SOCKSERV_DRAIN_TIMEOUT_MS", default_value_t = 5000)]
    drain_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SOCKSERV_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Merge the config file (if any) with command-line overrides
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load_from_path(path)
                .with_context(|| format!("Failed to load config: {path:?}"))?,
            None => ServerConfig::unix(default_socket_path()),
        };

        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(address) = &self.address {
            config.address.clone_from(address);
        }
        if let Some(permissions) = self.permissions {
            config.permissions = permissions;
        }
        if let Some(group) = self.group {
            config.group = Some(group);
        }
        if let Some(idle) = self.idle_timeout_ms {
            config.idle_timeout_ms = idle;
        }

        config.validate().context("Invalid server configuration")?;
        Ok(config)
    }

    fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn parse_permissions(raw: &str) -> Result<u32, String> {
    parse_octal(raw).ok_or_else(|| format!("invalid octal permissions: {raw}"))
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "sockserv_daemon={level},sockserv_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("sockserv daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = args.server_config()?;
    if config.protocol.is_filesystem() {
        server::ensure_socket_dir(&config.address)?;
    }

    info!(
        protocol = %config.protocol,
        address = %config.address,
        mode = ?args.mode,
        "Configuration resolved"
    );

    server::run(config, args.mode, args.drain_timeout()).await?;

    info!("sockserv daemon stopped");
    Ok(())
}
