//! Network Protocol Selection
//!
//! The protocol decides which endpoint strategy a server uses: connection
//! oriented streams (TCP, UNIX stream) or datagrams (UDP, UNIX datagram), and
//! network addressed or filesystem backed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SocketError;

/// Protocol a server listens on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    /// TCP over IPv4 or IPv6
    #[default]
    Tcp,
    /// TCP restricted to IPv4
    Tcp4,
    /// TCP restricted to IPv6
    Tcp6,
    /// UDP over IPv4 or IPv6
    Udp,
    /// UDP restricted to IPv4
    Udp4,
    /// UDP restricted to IPv6
    Udp6,
    /// UNIX-domain stream socket
    Unix,
    /// UNIX-domain datagram socket
    #[serde(rename = "unixgram")]
    UnixGram,
}

/// Address family accepted by a network-addressed protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4 or IPv6
    Any,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

impl AddressFamily {
    /// Whether `addr` belongs to this family
    #[must_use]
    pub fn matches(self, addr: &std::net::SocketAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }

    /// Host used when an address only names a port (`":8080"`)
    #[must_use]
    pub fn wildcard_host(self) -> &'static str {
        match self {
            Self::Any | Self::V4 => "0.0.0.0",
            Self::V6 => "[::]",
        }
    }
}

impl NetworkProtocol {
    /// All supported protocols
    pub const ALL: [Self; 8] = [
        Self::Tcp,
        Self::Tcp4,
        Self::Tcp6,
        Self::Udp,
        Self::Udp4,
        Self::Udp6,
        Self::Unix,
        Self::UnixGram,
    ];

    /// Canonical lowercase name
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Udp => "udp",
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Unix => "unix",
            Self::UnixGram => "unixgram",
        }
    }

    /// Connection-oriented protocol (one handler per accepted connection)
    #[must_use]
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Tcp4 | Self::Tcp6 | Self::Unix)
    }

    /// Connectionless protocol (one handler per received datagram)
    #[must_use]
    pub fn is_datagram(self) -> bool {
        !self.is_stream()
    }

    /// Endpoint is a socket file on the filesystem
    #[must_use]
    pub fn is_filesystem(self) -> bool {
        matches!(self, Self::Unix | Self::UnixGram)
    }

    /// Transport can close one direction while keeping the other open
    #[must_use]
    pub fn supports_half_close(self) -> bool {
        self.is_stream()
    }

    /// Address family for network protocols, `None` for filesystem ones
    #[must_use]
    pub fn family(self) -> Option<AddressFamily> {
        match self {
            Self::Tcp | Self::Udp => Some(AddressFamily::Any),
            Self::Tcp4 | Self::Udp4 => Some(AddressFamily::V4),
            Self::Tcp6 | Self::Udp6 => Some(AddressFamily::V6),
            Self::Unix | Self::UnixGram => None,
        }
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for NetworkProtocol {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "udp" => Ok(Self::Udp),
            "udp4" => Ok(Self::Udp4),
            "udp6" => Ok(Self::Udp6),
            "unix" | "unix-stream" => Ok(Self::Unix),
            "unixgram" | "unix-datagram" => Ok(Self::UnixGram),
            other => Err(SocketError::UnsupportedProtocol(other.to_string())),
        }
    }
}
