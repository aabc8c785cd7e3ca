//! Socket Server Errors
//!
//! A single error taxonomy shared by endpoint resolution, the accept loop and
//! the per-connection halves.
//!
//! | Class | Variants | Behaviour |
//! |-------|----------|-----------|
//! | Configuration | `InvalidAddress`, `InvalidHandler`, `UnsupportedProtocol`, `Config` | returned synchronously from `listen` |
//! | Resolution | `Bind`, `StaleSocket`, `Permission` | `listen` fails, server stays idle |
//! | Transient | `Accept` | reported through the error callback, loop continues |
//! | Fatal listener | `Listener` | loop exits, `listen` returns it |
//! | Per-connection | `Io`, `Cancelled`, `Closed`, `IdleTimeout`, `HandlerPanic` | isolated to the connection |

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the socket server framework
#[derive(Debug, Error)]
pub enum SocketError {
    /// Address or socket path is empty or cannot be resolved
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The address as configured
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// `listen` was called without a connection handler
    #[error("invalid handler: no connection handler registered")]
    InvalidHandler,

    /// Protocol name not recognised
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// `listen` was called while the server is already running
    #[error("server is already running")]
    AlreadyRunning,

    /// The bind syscall failed
    #[error("bind failed on {address}: {source}")]
    Bind {
        /// Address or path that could not be bound
        address: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A pre-existing file at the socket path could not be removed
    #[error("failed to remove stale socket {path:?}: {source}")]
    StaleSocket {
        /// Socket path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Mode or group of the socket file could not be fixed up after bind
    #[error("failed to apply permissions to {path:?}: {source}")]
    Permission {
        /// Socket path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The listening resource became unusable
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),

    /// A single accept or receive failed; the loop keeps going
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Connection-level I/O error
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operation's context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The side of the connection being used is already closed
    #[error("connection side closed")]
    Closed,

    /// No activity on the connection within the idle timeout
    #[error("connection idle for more than {0:?}")]
    IdleTimeout(std::time::Duration),

    /// The connection handler panicked; the panic was contained
    #[error("connection handler panicked: {0}")]
    HandlerPanic(String),

    /// `shutdown` gave up waiting for the accept loop to exit
    #[error("shutdown did not complete before its context was cancelled")]
    ShutdownTimeout,

    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),
}

impl SocketError {
    /// Build an `InvalidAddress` error
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error only reports an expected connection closure
    ///
    /// Closure errors are normal during teardown and are not forwarded to the
    /// error callback.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed | Self::Cancelled => true,
            Self::Io(e) => is_closed_io(e),
            _ => false,
        }
    }

    /// Convert into an `io::Error` carrying this error as its inner value
    #[must_use]
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            Self::Cancelled | Self::IdleTimeout(_) => io::ErrorKind::ConnectionAborted,
            Self::Closed => io::ErrorKind::BrokenPipe,
            Self::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        match self {
            Self::Io(e) => e,
            other => io::Error::new(kind, other),
        }
    }
}

/// `io::Error` returned by a half whose context was cancelled
pub(crate) fn cancelled_io() -> io::Error {
    SocketError::Cancelled.into_io()
}

/// `io::Error` returned by a half that is already closed
pub(crate) fn closed_io() -> io::Error {
    SocketError::Closed.into_io()
}

/// Whether an I/O error carries a [`SocketError::Cancelled`]
#[must_use]
pub fn is_cancelled_io(err: &io::Error) -> bool {
    matches!(inner(err), Some(SocketError::Cancelled))
}

/// Whether an I/O error only reports that the connection is gone
#[must_use]
pub fn is_closed_io(err: &io::Error) -> bool {
    if let Some(e) = inner(err) {
        return matches!(e, SocketError::Closed | SocketError::Cancelled);
    }
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Whether an accept/receive error leaves the listener usable
///
/// Resource exhaustion (`EMFILE`, `ENFILE`, `ENOBUFS`, `ENOMEM`) and errors
/// that belong to one aborted peer are transient; everything else means the
/// listening descriptor itself is broken.
#[must_use]
pub fn is_transient_accept(err: &io::Error) -> bool {
    if matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
    ) {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// Whether an I/O error was produced by a connection half rather than the
/// transport
pub(crate) fn is_own_io(err: &io::Error) -> bool {
    inner(err).is_some()
}

/// Whether an accept error means the process or system ran out of
/// descriptors
pub(crate) fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE))
}

fn inner(err: &io::Error) -> Option<&SocketError> {
    err.get_ref().and_then(|e| e.downcast_ref::<SocketError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_roundtrips_through_io() {
        let err = cancelled_io();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(is_cancelled_io(&err));
        assert!(is_closed_io(&err));
    }

    #[test]
    fn test_closed_maps_to_broken_pipe() {
        let err = closed_io();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!is_cancelled_io(&err));
        assert!(is_closed_io(&err));
    }

    #[test]
    fn test_is_closed_filters_expected_errors() {
        assert!(SocketError::Closed.is_closed());
        assert!(SocketError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_closed());
        assert!(!SocketError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_closed());
        assert!(!SocketError::InvalidHandler.is_closed());
    }

    #[test]
    fn test_transient_accept_classification() {
        assert!(is_transient_accept(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient_accept(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient_accept(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_transient_accept(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_transient_accept(&io::Error::from_raw_os_error(libc::EINVAL)));
    }

    #[test]
    fn test_fd_exhaustion_classification() {
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_fd_exhaustion(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_fd_exhaustion(&io::Error::from(io::ErrorKind::WouldBlock)));
    }

    #[test]
    fn test_own_errors_are_distinguished_from_transport_errors() {
        assert!(is_own_io(&closed_io()));
        assert!(is_own_io(&cancelled_io()));
        assert!(!is_own_io(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_invalid_address_display() {
        let err = SocketError::invalid_address("", "empty address");
        assert_eq!(err.to_string(), "invalid address \"\": empty address");
    }
}
