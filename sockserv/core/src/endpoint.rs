//! Socket Endpoint Resolver
//!
//! Turns a [`ServerConfig`] into a bound, ready-to-serve endpoint.
//!
//! # Network endpoints
//!
//! `host:port` is resolved and filtered by the protocol's address family;
//! `:port` binds the family's wildcard address.
//!
//! # Filesystem endpoints
//!
//! ```text
//! normalize path ──► remove stale file ──► umask(!perm) ─► bind ─► restore umask
//!                                                                       │
//!                       socket file removed on drop ◄── chmod / chown ◄─┘
//! ```
//!
//! - A file already present at the path is removed unconditionally. This can
//!   delete a socket still served by another process if paths collide.
//! - UNIX socket files are created honouring the process umask, so the umask
//!   is swapped to the complement of the requested mode for the duration of
//!   the bind and restored right after. The swap is serialised process-wide.
//! - After bind the file is re-stated and its mode and group are fixed up if
//!   they differ. The owning user is never changed.

use std::fs::{self, Permissions};
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use nix::sys::stat::{umask, Mode};
use nix::unistd::{chown, Gid};
use parking_lot::{Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixDatagram, UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::connection::{BoxedRead, BoxedWrite};
use crate::error::SocketError;
use crate::protocol::{AddressFamily, NetworkProtocol};

/// Serialises umask swaps; the umask is process-wide state
static UMASK_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// A bound endpoint plus the socket file it owns, if any
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) bound: Bound,
    pub(crate) file: Option<SocketFile>,
    pub(crate) local: String,
}

/// Listening resource for each endpoint strategy
#[derive(Debug)]
pub(crate) enum Bound {
    /// Connection-oriented: accept, then one handler per connection
    Stream(Listener),
    /// Connectionless: receive, then one handler per datagram
    Datagram(DatagramSocket),
}

impl Endpoint {
    pub(crate) fn supports_half_close(&self) -> bool {
        matches!(self.bound, Bound::Stream(_))
    }
}

/// Stream listener
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Accept the next connection and describe its remote address
    pub(crate) async fn accept(&self) -> io::Result<(AcceptedStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((AcceptedStream::Tcp(stream), addr.to_string()))
            }
            Self::Unix(listener) => {
                let (stream, addr) = listener.accept().await?;
                let remote = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                Ok((AcceptedStream::Unix(stream), remote))
            }
        }
    }
}

/// A freshly accepted stream, before it is split into halves
///
/// Passed by reference to the stream hook so callers can tune socket options.
#[derive(Debug)]
pub enum AcceptedStream {
    /// TCP connection
    Tcp(TcpStream),
    /// UNIX-domain stream connection
    Unix(UnixStream),
}

impl AcceptedStream {
    /// Split into boxed halves plus the descriptor used for half-close
    pub(crate) fn into_halves(self) -> (BoxedRead, BoxedWrite, RawFd) {
        match self {
            Self::Tcp(stream) => {
                let fd = stream.as_raw_fd();
                let (read, write) = stream.into_split();
                (Box::new(read), Box::new(write), fd)
            }
            Self::Unix(stream) => {
                let fd = stream.as_raw_fd();
                let (read, write) = stream.into_split();
                (Box::new(read), Box::new(write), fd)
            }
        }
    }
}

/// Datagram socket shared by every datagram dialogue
#[derive(Clone, Debug)]
pub(crate) enum DatagramSocket {
    Udp(Arc<UdpSocket>),
    Unix(Arc<UnixDatagram>),
}

/// Sender of a datagram, used as the reply destination
#[derive(Clone, Debug)]
pub(crate) enum DatagramPeer {
    Udp(SocketAddr),
    /// Unnamed UNIX datagram senders cannot be replied to
    Unix(Option<PathBuf>),
}

impl DatagramPeer {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Udp(addr) => addr.to_string(),
            Self::Unix(path) => path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        }
    }
}

impl DatagramSocket {
    /// Receive the next datagram into `buf`
    pub(crate) async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, DatagramPeer)> {
        match self {
            Self::Udp(socket) => {
                let (n, addr) = socket.recv_from(buf).await?;
                Ok((n, DatagramPeer::Udp(addr)))
            }
            Self::Unix(socket) => {
                let (n, addr) = socket.recv_from(buf).await?;
                Ok((n, DatagramPeer::Unix(addr.as_pathname().map(Path::to_path_buf))))
            }
        }
    }
}

/// Guard removing a socket file from disk
///
/// Removal happens explicitly via [`SocketFile::remove`] or, failing that,
/// when the guard is dropped.
#[derive(Debug)]
pub(crate) struct SocketFile {
    path: PathBuf,
    armed: bool,
}

impl SocketFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file now, reporting failures
    pub(crate) fn remove(mut self) -> io::Result<()> {
        self.armed = false;
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if self.armed {
            fs::remove_file(&self.path).ok();
        }
    }
}

/// Restores the previous umask when dropped
struct UmaskGuard {
    previous: Mode,
    _lock: MutexGuard<'static, ()>,
}

impl UmaskGuard {
    fn apply(permissions: u32) -> Self {
        let lock = UMASK_LOCK.lock();
        // Truncation is intended: only the rwx bits participate in the mask
        #[allow(clippy::cast_possible_truncation)]
        let mask = Mode::from_bits_truncate((!permissions & 0o777) as libc::mode_t);
        let previous = umask(mask);
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.previous);
    }
}

/// Bind the endpoint described by `config`
pub(crate) async fn resolve(config: &ServerConfig) -> Result<Endpoint, SocketError> {
    config.validate()?;

    match config.protocol {
        NetworkProtocol::Unix | NetworkProtocol::UnixGram => resolve_filesystem(config),
        NetworkProtocol::Tcp | NetworkProtocol::Tcp4 | NetworkProtocol::Tcp6 => {
            let addr = resolve_network(config.protocol, &config.address).await?;
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| bind_error(addr.to_string(), source))?;
            let local = local_or(listener.local_addr(), addr);
            debug!(%local, protocol = %config.protocol, "Bound stream listener");
            Ok(Endpoint {
                bound: Bound::Stream(Listener::Tcp(listener)),
                file: None,
                local,
            })
        }
        NetworkProtocol::Udp | NetworkProtocol::Udp4 | NetworkProtocol::Udp6 => {
            let addr = resolve_network(config.protocol, &config.address).await?;
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| bind_error(addr.to_string(), source))?;
            let local = local_or(socket.local_addr(), addr);
            debug!(%local, protocol = %config.protocol, "Bound datagram socket");
            Ok(Endpoint {
                bound: Bound::Datagram(DatagramSocket::Udp(Arc::new(socket))),
                file: None,
                local,
            })
        }
    }
}

fn resolve_filesystem(config: &ServerConfig) -> Result<Endpoint, SocketError> {
    let path = normalize_socket_path(&config.address)?;
    remove_stale(&path)?;

    let bound = {
        let _umask = UmaskGuard::apply(config.permissions);
        match config.protocol {
            NetworkProtocol::UnixGram => UnixDatagram::bind(&path)
                .map(|socket| Bound::Datagram(DatagramSocket::Unix(Arc::new(socket)))),
            _ => UnixListener::bind(&path).map(|listener| Bound::Stream(Listener::Unix(listener))),
        }
    }
    .map_err(|source| bind_error(path.display().to_string(), source))?;

    // From here on the file is removed again if anything fails
    let file = SocketFile::new(path);
    apply_mode_and_group(file.path(), config.permissions, config.effective_group())?;

    let local = file.path().display().to_string();
    debug!(path = %local, mode = %format!("{:#o}", config.permissions), "Bound socket file");

    Ok(Endpoint {
        bound,
        file: Some(file),
        local,
    })
}

pub(crate) async fn resolve_network(
    protocol: NetworkProtocol,
    address: &str,
) -> Result<SocketAddr, SocketError> {
    let family = protocol.family().unwrap_or(AddressFamily::Any);
    let target = if address.starts_with(':') {
        format!("{}{address}", family.wildcard_host())
    } else {
        address.to_string()
    };

    let found = tokio::net::lookup_host(target)
        .await
        .map_err(|e| SocketError::invalid_address(address, e.to_string()))?
        .find(|addr| family.matches(addr));
    found.ok_or_else(|| {
        SocketError::invalid_address(address, format!("no {protocol} address found"))
    })
}

/// Validate a socket path and rejoin its cleaned directory with its base name
pub(crate) fn normalize_socket_path(raw: &str) -> Result<PathBuf, SocketError> {
    if raw.trim().is_empty() {
        return Err(SocketError::invalid_address(raw, "socket path must not be empty"));
    }

    let path = Path::new(raw);
    let name = match path.components().next_back() {
        Some(Component::Normal(name)) => name.to_os_string(),
        _ => return Err(SocketError::invalid_address(raw, "socket path has no file name")),
    };

    let dir = path.parent().map(clean_path).unwrap_or_default();
    let dir = if dir.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        dir
    };

    Ok(dir.join(name))
}

/// Lexically resolve `.` and `..` components
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(cleaned.components().next_back(), Some(Component::Normal(_)))
                    && cleaned.pop();
                if !popped && !cleaned.has_root() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

fn remove_stale(path: &Path) -> Result<(), SocketError> {
    match fs::symlink_metadata(path) {
        Ok(_) => {
            warn!(path = ?path, "Removing stale socket file");
            fs::remove_file(path).map_err(|source| SocketError::StaleSocket {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SocketError::StaleSocket {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn apply_mode_and_group(path: &Path, permissions: u32, gid: u32) -> Result<(), SocketError> {
    let permission_error = |source: io::Error| SocketError::Permission {
        path: path.to_path_buf(),
        source,
    };

    let metadata = fs::metadata(path).map_err(permission_error)?;

    let wanted = permissions & 0o7777;
    if metadata.mode() & 0o7777 != wanted {
        debug!(
            path = ?path,
            from = %format!("{:#o}", metadata.mode() & 0o7777),
            to = %format!("{wanted:#o}"),
            "Fixing socket mode"
        );
        fs::set_permissions(path, Permissions::from_mode(wanted)).map_err(permission_error)?;
    }

    if metadata.gid() != gid {
        debug!(path = ?path, from = metadata.gid(), to = gid, "Fixing socket group");
        chown(path, None, Some(Gid::from_raw(gid)))
            .map_err(|errno| permission_error(io::Error::from(errno)))?;
    }

    Ok(())
}

fn bind_error(address: String, source: io::Error) -> SocketError {
    SocketError::Bind { address, source }
}

fn local_or(local: io::Result<SocketAddr>, fallback: SocketAddr) -> String {
    local.unwrap_or(fallback).to_string()
}
