//! Event Sink
//!
//! Observability hooks for callers. The sink carries three optional
//! callbacks:
//!
//! - connection info: `(local, remote, state)` for open, first read and
//!   write, half-close and close
//! - error: non-fatal accept and per-connection errors
//! - server info: lifecycle messages such as "listening" and "closing"
//!
//! Every event is also emitted through `tracing`, so a sink without callbacks
//! still leaves a trail in the logs. A panicking callback is contained and
//! logged; it never takes the caller's task down.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::SocketError;

/// Connection lifecycle states reported to the info callback
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// A client is dialing a server
    Dial,
    /// A connection (or datagram dialogue) was accepted
    New,
    /// First data was read from the peer
    Read,
    /// The connection handler is about to run
    Handler,
    /// First data was written to the peer
    Write,
    /// The read side was closed
    CloseRead,
    /// The write side was closed
    CloseWrite,
    /// Both sides are closed and the connection is torn down
    Close,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dial => "Dial Connection",
            Self::New => "New Connection",
            Self::Read => "Read Incoming Stream",
            Self::Handler => "Run Handler",
            Self::Write => "Write Outgoing Stream",
            Self::CloseRead => "Close Incoming Stream",
            Self::CloseWrite => "Close Outgoing Stream",
            Self::Close => "Close Connection",
        })
    }
}

/// Callback receiving `(local address, remote address, state)`
pub type InfoCallback = Arc<dyn Fn(&str, &str, ConnState) + Send + Sync>;

/// Callback receiving non-fatal errors
pub type ErrorCallback = Arc<dyn Fn(&SocketError) + Send + Sync>;

/// Callback receiving server lifecycle messages
pub type ServerInfoCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    info: RwLock<Option<InfoCallback>>,
    error: RwLock<Option<ErrorCallback>>,
    server: RwLock<Option<ServerInfoCallback>>,
}

/// Shared, cloneable set of observability callbacks
///
/// Callbacks may be replaced at any time, including while a server runs.
#[derive(Clone, Default)]
pub struct EventSink {
    callbacks: Arc<Callbacks>,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("info", &self.callbacks.info.read().is_some())
            .field("error", &self.callbacks.error.read().is_some())
            .field("server", &self.callbacks.server.read().is_some())
            .finish()
    }
}

impl EventSink {
    /// Sink with no callbacks registered
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or clear, with `None`) the connection info callback
    pub fn set_info(&self, callback: Option<InfoCallback>) {
        *self.callbacks.info.write() = callback;
    }

    /// Register (or clear) the error callback
    pub fn set_error(&self, callback: Option<ErrorCallback>) {
        *self.callbacks.error.write() = callback;
    }

    /// Register (or clear) the server info callback
    pub fn set_server_info(&self, callback: Option<ServerInfoCallback>) {
        *self.callbacks.server.write() = callback;
    }

    /// Report a connection state change
    pub fn connection(&self, local: &str, remote: &str, state: ConnState) {
        debug!(local, remote, %state, "connection event");

        let callback = self.callbacks.info.read().clone();
        if let Some(f) = callback {
            guarded("info", || f(local, remote, state));
        }
    }

    /// Report a non-fatal error
    pub fn error(&self, err: &SocketError) {
        warn!(error = %err, "socket error");

        let callback = self.callbacks.error.read().clone();
        if let Some(f) = callback {
            guarded("error", || f(err));
        }
    }

    /// Report a server lifecycle message
    pub fn server(&self, message: &str) {
        info!("{message}");

        let callback = self.callbacks.server.read().clone();
        if let Some(f) = callback {
            guarded("server info", || f(message));
        }
    }
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(callback = kind, "event callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_conn_state_display() {
        assert_eq!(ConnState::New.to_string(), "New Connection");
        assert_eq!(ConnState::CloseWrite.to_string(), "Close Outgoing Stream");
        assert_eq!(ConnState::Read.to_string(), "Read Incoming Stream");
    }

    #[test]
    fn test_sink_without_callbacks_is_noop() {
        let sink = EventSink::new();
        sink.connection("a", "b", ConnState::New);
        sink.error(&SocketError::Closed);
        sink.server("hello");
    }

    #[test]
    fn test_info_callback_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = EventSink::new();
        let seen_cb = Arc::clone(&seen);
        sink.set_info(Some(Arc::new(move |local, remote, state| {
            seen_cb
                .lock()
                .unwrap()
                .push((local.to_string(), remote.to_string(), state));
        })));

        sink.connection("127.0.0.1:1", "127.0.0.1:2", ConnState::New);
        sink.connection("127.0.0.1:1", "127.0.0.1:2", ConnState::Close);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].2, ConnState::New);
        assert_eq!(seen[1].0, "127.0.0.1:1");
    }

    #[test]
    fn test_callbacks_can_be_cleared() {
        let count = Arc::new(Mutex::new(0));
        let sink = EventSink::new();
        let count_cb = Arc::clone(&count);
        sink.set_server_info(Some(Arc::new(move |_| *count_cb.lock().unwrap() += 1)));
        sink.server("one");
        sink.set_server_info(None);
        sink.server("two");
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let sink = EventSink::new();
        sink.set_error(Some(Arc::new(|_| panic!("boom"))));
        sink.error(&SocketError::Cancelled);
    }
}
