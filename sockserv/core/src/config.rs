//! Server Configuration
//!
//! Everything endpoint resolution needs: protocol, address or socket path,
//! socket-file permission bits and group. Configuration can be built in code,
//! loaded from a TOML file or read from `SOCKSERV_*` environment variables.
//!
//! ```toml
//! protocol = "unix"
//! address = "/run/sockserv/echo.sock"
//! permissions = 0o660
//! group = 1000
//! idle_timeout_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SocketError;
use crate::protocol::NetworkProtocol;

/// Default permission bits for socket files
pub const DEFAULT_SOCKET_PERMISSIONS: u32 = 0o770;

/// Largest datagram the receive loop accepts without truncation
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Configuration for a single listening endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Which protocol to listen on
    pub protocol: NetworkProtocol,

    /// `host:port` for network protocols, socket path for UNIX protocols
    ///
    /// A bare `:port` binds every interface of the protocol's family.
    pub address: String,

    /// Mode applied to the socket file (UNIX protocols only)
    pub permissions: u32,

    /// Group owning the socket file (UNIX protocols only)
    ///
    /// `None` uses the process real group id.
    pub group: Option<u32>,

    /// Close connections with no activity for this long (0 = never)
    pub idle_timeout_ms: u64,

    /// Receive buffer for datagram protocols
    pub datagram_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: NetworkProtocol::default(),
            address: String::new(),
            permissions: DEFAULT_SOCKET_PERMISSIONS,
            group: None,
            idle_timeout_ms: 0,
            datagram_buffer_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl ServerConfig {
    /// Configuration for `protocol` on `address` with defaults elsewhere
    pub fn new(protocol: NetworkProtocol, address: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
            ..Default::default()
        }
    }

    /// TCP listener on `address`
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(NetworkProtocol::Tcp, address)
    }

    /// UDP socket on `address`
    pub fn udp(address: impl Into<String>) -> Self {
        Self::new(NetworkProtocol::Udp, address)
    }

    /// UNIX stream socket at `path`
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::new(
            NetworkProtocol::Unix,
            path.as_ref().to_string_lossy().into_owned(),
        )
    }

    /// UNIX datagram socket at `path`
    pub fn unixgram(path: impl AsRef<Path>) -> Self {
        Self::new(
            NetworkProtocol::UnixGram,
            path.as_ref().to_string_lossy().into_owned(),
        )
    }

    /// Set the socket-file permission bits
    #[must_use]
    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    /// Set the socket-file group
    #[must_use]
    pub fn with_group(mut self, group: u32) -> Self {
        self.group = Some(group);
        self
    }

    /// Set the per-connection idle timeout
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Idle timeout, if enabled
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Group the socket file must end up owned by
    #[must_use]
    pub fn effective_group(&self) -> u32 {
        self.group
            .unwrap_or_else(|| nix::unistd::getgid().as_raw())
    }

    /// Reject configurations that can never be bound
    pub fn validate(&self) -> Result<(), SocketError> {
        if self.address.trim().is_empty() {
            return Err(SocketError::invalid_address(
                &self.address,
                "address must not be empty",
            ));
        }
        if self.protocol.is_filesystem() && self.permissions & !0o7777 != 0 {
            return Err(SocketError::Config(format!(
                "permissions {:#o} exceed 0o7777",
                self.permissions
            )));
        }
        if self.protocol.is_datagram() && self.datagram_buffer_size == 0 {
            return Err(SocketError::Config(
                "datagram_buffer_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SocketError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SocketError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(raw: &str) -> Result<Self, SocketError> {
        toml::from_str(raw).map_err(|e| SocketError::Config(e.to_string()))
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `SOCKSERV_PROTOCOL`: tcp, tcp4, tcp6, udp, udp4, udp6, unix, unixgram
    /// - `SOCKSERV_ADDRESS`: `host:port` or socket path
    /// - `SOCKSERV_PERMISSIONS`: octal mode, e.g. `0660`
    /// - `SOCKSERV_GROUP`: numeric group id
    /// - `SOCKSERV_IDLE_TIMEOUT_MS`: idle timeout in ms (0 disables)
    /// - `SOCKSERV_DATAGRAM_BUFFER`: datagram receive buffer in bytes
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            protocol: var("SOCKSERV_PROTOCOL")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.protocol),
            address: var("SOCKSERV_ADDRESS").unwrap_or(defaults.address),
            permissions: var("SOCKSERV_PERMISSIONS")
                .and_then(|v| parse_octal(&v))
                .unwrap_or(defaults.permissions),
            group: var("SOCKSERV_GROUP")
                .and_then(|v| v.parse().ok())
                .or(defaults.group),
            idle_timeout_ms: var("SOCKSERV_IDLE_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.idle_timeout_ms),
            datagram_buffer_size: var("SOCKSERV_DATAGRAM_BUFFER")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.datagram_buffer_size),
        }
    }
}

/// Parse an octal permission string (`0660`, `0o660` or `660`)
#[must_use]
pub fn parse_octal(raw: &str) -> Option<u32> {
    let digits = raw.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    u32::from_str_radix(digits, 8).ok()
}

/// Default socket path for the daemon
///
/// Uses the XDG runtime directory if available, otherwise
/// `/tmp/sockserv-$UID/`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("sockserv").join("sockserv.sock"),
        None => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/sockserv-{uid}/sockserv.sock"))
        }
    }
}
