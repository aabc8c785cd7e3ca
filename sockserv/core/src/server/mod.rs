//! Lifecycle & Shutdown Coordinator
//!
//! [`Server`] owns one endpoint configuration and runs at most one listening
//! resource at a time.
//!
//! ```text
//!            listen()                bound               ctx cancelled / shutdown()
//!   Idle ─────────────► Starting ─────────► Listening ─────────────────────────► Draining
//!    ▲                     │                                                        │
//!    │   resolve failed    │                                                        │
//!    ├─────────────────────┘                                                        │
//!    └──────────────────────── loop exited, socket file removed ◄───────────────────┘
//! ```
//!
//! The state lives in a single `watch` channel and every transition is a
//! conditional update, so `listen` racing `listen` or `shutdown` racing
//! `shutdown` resolve to exactly one winner.
//!
//! `shutdown` and cancelling the context passed to [`Server::listen`] take
//! the same path: the loop stops accepting and every connection context of
//! the run is cancelled, so handlers blocked on I/O wake up with a
//! cancellation error. Neither waits for the handlers to return. Callers that
//! need bounded draining combine [`Server::drained`] with their own timeout.

mod dispatch;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::context::Context;
use crate::endpoint::{self, Bound, SocketFile};
use crate::error::SocketError;
use crate::events::{ErrorCallback, EventSink, InfoCallback, ServerInfoCallback};
use crate::handler::{ConnectionHandler, StreamHook};
use crate::protocol::NetworkProtocol;

/// Observable lifecycle state of a [`Server`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Not listening; `listen` may be called
    Idle,
    /// `listen` is resolving the endpoint
    Starting,
    /// Accepting connections
    Listening,
    /// Stop requested; the loop is winding down
    Draining,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Draining => "draining",
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct Status {
    state: ServerState,
    /// Bumped every time a listen attempt ends
    generation: u64,
}

struct Shared {
    config: ServerConfig,
    handler: RwLock<Option<Arc<dyn ConnectionHandler>>>,
    hook: RwLock<Option<StreamHook>>,
    sink: EventSink,
    status: watch::Sender<Status>,
    /// Stop signal of the current run, replaced on every `listen`
    stop: Mutex<Context>,
    open: AtomicI64,
    drained: Notify,
    /// Notified whenever a connection finishes
    released: Notify,
    local_addr: RwLock<Option<String>>,
}

impl Shared {
    fn state(&self) -> ServerState {
        self.status.borrow().state
    }

    /// Idle → Starting with a fresh stop signal, or `AlreadyRunning`
    fn begin(&self) -> Result<(Context, u64), SocketError> {
        let mut started = None;
        self.status.send_if_modified(|status| {
            if status.state != ServerState::Idle {
                return false;
            }
            status.state = ServerState::Starting;
            let stop = Context::new();
            *self.stop.lock() = stop.clone();
            started = Some((stop, status.generation));
            true
        });
        started.ok_or(SocketError::AlreadyRunning)
    }

    /// Move to `to` if still in run `generation` and currently in `from`
    fn transition(&self, generation: u64, from: &[ServerState], to: ServerState) -> bool {
        self.status.send_if_modified(|status| {
            if status.generation != generation || !from.contains(&status.state) {
                return false;
            }
            status.state = to;
            true
        })
    }

    fn finish(&self) {
        self.status.send_modify(|status| {
            status.state = ServerState::Idle;
            status.generation += 1;
        });
    }
}

/// Releases everything a `listen` call acquired, however it ends
struct RunGuard<'a> {
    shared: &'a Shared,
    halt: Context,
    file: Option<SocketFile>,
    announced: Option<String>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.halt.cancel();
        *self.shared.local_addr.write() = None;

        if let Some(local) = self.announced.take() {
            self.shared.sink.server(&format!("closing {local}"));
        }
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.remove() {
                warn!(path = ?path, error = %e, "Failed to remove socket file");
                self.shared.sink.error(&SocketError::Io(e));
            }
        }

        self.shared.finish();
    }
}

/// Concurrent socket server for one endpoint
///
/// Cheap to clone; clones share the same state, so one clone can run
/// [`Server::listen`] while another calls [`Server::shutdown`].
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("protocol", &self.shared.config.protocol)
            .field("address", &self.shared.config.address)
            .field("state", &self.state())
            .field("open_connections", &self.open_connections())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create an idle server for `config`
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                handler: RwLock::new(None),
                hook: RwLock::new(None),
                sink: EventSink::new(),
                status: watch::Sender::new(Status {
                    state: ServerState::Idle,
                    generation: 0,
                }),
                stop: Mutex::new(Context::new()),
                open: AtomicI64::new(0),
                drained: Notify::new(),
                released: Notify::new(),
                local_addr: RwLock::new(None),
            }),
        }
    }

    /// Set the connection handler (builder form)
    #[must_use]
    pub fn with_handler<H: ConnectionHandler>(self, handler: H) -> Self {
        self.set_handler(handler);
        self
    }

    /// Set the connection handler used by subsequent connections
    pub fn set_handler<H: ConnectionHandler>(&self, handler: H) {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }

    /// Set (or clear) the hook run on every accepted stream
    pub fn set_stream_hook(&self, hook: Option<StreamHook>) {
        *self.shared.hook.write() = hook;
    }

    /// Register the connection info callback
    pub fn register_info(&self, callback: Option<InfoCallback>) {
        self.shared.sink.set_info(callback);
    }

    /// Register the error callback
    pub fn register_error(&self, callback: Option<ErrorCallback>) {
        self.shared.sink.set_error(callback);
    }

    /// Register the server lifecycle callback
    pub fn register_server_info(&self, callback: Option<ServerInfoCallback>) {
        self.shared.sink.set_server_info(callback);
    }

    /// Configuration this server was created with
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Protocol this server listens on
    #[must_use]
    pub fn protocol(&self) -> NetworkProtocol {
        self.shared.config.protocol
    }

    /// Bind the endpoint and serve until `ctx` is cancelled or
    /// [`Server::shutdown`] is called
    ///
    /// Returns `Ok(())` after a requested stop and an error if the
    /// configuration is invalid, the endpoint cannot be bound or the
    /// listener fails. In every case the socket file (if any) has been
    /// removed and the server is idle again when this returns.
    pub async fn listen(&self, ctx: &Context) -> Result<(), SocketError> {
        let handler = self
            .shared
            .handler
            .read()
            .clone()
            .ok_or(SocketError::InvalidHandler)?;
        let config = &self.shared.config;
        config.validate()?;

        let (stop, generation) = self.shared.begin()?;
        let halt = Context::new();
        let mut run = RunGuard {
            shared: &self.shared,
            halt: halt.clone(),
            file: None,
            announced: None,
        };

        let endpoint = endpoint::resolve(config).await?;
        let half_close = endpoint.supports_half_close();
        let endpoint::Endpoint { bound, file, local } = endpoint;
        run.file = file;

        *self.shared.local_addr.write() = Some(local.clone());
        self.shared
            .transition(generation, &[ServerState::Starting], ServerState::Listening);
        info!(protocol = %config.protocol, %local, half_close, "Listening for connections");
        self.shared
            .sink
            .server(&format!("listening on {} {local}", config.protocol));
        run.announced = Some(local.clone());

        // Parent of every connection context of this run
        let parent = ctx.child();
        self.spawn_watcher(ctx, stop, halt.clone(), parent.clone(), generation);

        let result = match &bound {
            Bound::Stream(listener) => {
                dispatch::serve_stream(&self.shared, listener, &handler, &parent, &halt, &local)
                    .await
            }
            Bound::Datagram(socket) => {
                dispatch::serve_datagram(&self.shared, socket, &handler, &parent, &halt, &local)
                    .await
            }
        };

        if let Err(e) = &result {
            error!(error = %e, %local, "Listener failed");
        }

        // Close the listening resource before its socket file goes away
        drop(bound);
        drop(run);
        result
    }

    fn spawn_watcher(
        &self,
        ctx: &Context,
        stop: Context,
        halt: Context,
        connections: Context,
        generation: u64,
    ) {
        let shared = Arc::clone(&self.shared);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = halt.cancelled() => return,
                () = ctx.cancelled() => debug!("Listen context cancelled"),
                () = stop.cancelled() => debug!("Shutdown requested"),
            }
            shared.transition(
                generation,
                &[ServerState::Starting, ServerState::Listening],
                ServerState::Draining,
            );
            connections.cancel();
            halt.cancel();
        });
    }

    /// Stop accepting new connections and wait for the loop to exit
    ///
    /// Idempotent: returns `Ok(())` immediately when the server is not
    /// running. In-flight connections have their contexts cancelled but are
    /// not waited for. If `ctx` is
    /// cancelled before the loop has exited, returns
    /// [`SocketError::ShutdownTimeout`]; the stop request stays in effect.
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), SocketError> {
        if !self.is_running() {
            return Ok(());
        }

        info!(state = %self.state(), "Shutting down server");
        self.close();

        match ctx.run_until_cancelled(self.stopped()).await {
            Some(()) => Ok(()),
            None if !self.is_running() => Ok(()),
            None => Err(SocketError::ShutdownTimeout),
        }
    }

    /// Request a stop without waiting for it
    pub fn close(&self) {
        if self.is_running() {
            self.shared.stop.lock().cancel();
        }
    }

    /// Whether a `listen` call is in progress
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() != ServerState::Idle
    }

    /// Whether a stop was requested and the loop has not exited yet
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.state() == ServerState::Draining
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Wait until the current or next `listen` call has bound its endpoint
    ///
    /// Returns `true` once listening and `false` if that attempt ended
    /// without (or after) listening.
    pub async fn ready(&self) -> bool {
        let mut rx = self.shared.status.subscribe();
        let initial = rx.borrow_and_update().generation;
        let result = rx
            .wait_for(|status| {
                status.state == ServerState::Listening
                    || status.state == ServerState::Draining
                    || status.generation != initial
            })
            .await
            .map(|status| status.state == ServerState::Listening);
        result.unwrap_or(false)
    }

    /// Wait until no `listen` call is in progress
    pub async fn stopped(&self) {
        let mut rx = self.shared.status.subscribe();
        let _ = rx
            .wait_for(|status| status.state == ServerState::Idle)
            .await
            .map(|_| ());
    }

    /// Number of connections whose handlers have not finished yet
    #[must_use]
    pub fn open_connections(&self) -> i64 {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Wait until every dispatched connection has finished
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.open_connections() <= 0 {
                return;
            }
            notified.await;
        }
    }

    /// Bound address or socket path while listening
    #[must_use]
    pub fn local_addr(&self) -> Option<String> {
        self.shared.local_addr.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Reader, Writer};
    use std::time::Duration;
    use tempfile::TempDir;

    fn noop_server(config: ServerConfig) -> Server {
        Server::new(config).with_handler(|_r: Reader, _w: Writer| async {})
    }

    #[tokio::test]
    async fn test_listen_without_handler_never_binds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nohandler.sock");
        let server = Server::new(ServerConfig::unix(&path));

        let err = server.listen(&Context::new()).await.unwrap_err();
        assert!(matches!(err, SocketError::InvalidHandler));
        assert!(!path.exists());
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[tokio::test]
    async fn test_resolve_failure_leaves_server_idle_and_retryable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("x.sock");
        let server = noop_server(ServerConfig::unix(&path));

        let err = server.listen(&Context::new()).await.unwrap_err();
        assert!(matches!(err, SocketError::Bind { .. }));
        assert!(!server.is_running());

        std::fs::create_dir(dir.path().join("missing")).unwrap();
        let ctx = Context::new();
        let runner = {
            let server = server.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { server.listen(&ctx).await })
        };
        assert!(server.ready().await);
        ctx.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_listen_is_rejected() {
        let server = noop_server(ServerConfig::tcp("127.0.0.1:0"));
        let ctx = Context::new();
        let runner = {
            let server = server.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { server.listen(&ctx).await })
        };
        assert!(server.ready().await);

        let err = server.listen(&Context::new()).await.unwrap_err();
        assert!(matches!(err, SocketError::AlreadyRunning));
        assert_eq!(server.state(), ServerState::Listening);

        server.shutdown(&Context::new()).await.unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_cancelled_listen_context_stops_server() {
        let server = noop_server(ServerConfig::tcp("127.0.0.1:0"));
        let ctx = Context::new();
        ctx.cancel();

        tokio::time::timeout(Duration::from_secs(2), server.listen(&ctx))
            .await
            .expect("listen should return promptly")
            .unwrap();
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_with_cancelled_context() {
        let server = noop_server(ServerConfig::tcp("127.0.0.1:0"));
        // Force a running state without a loop that could observe the stop
        let (_stop, _generation) = server.shared.begin().unwrap();

        let ctx = Context::new();
        ctx.cancel();
        let err = server.shutdown(&ctx).await.unwrap_err();
        assert!(matches!(err, SocketError::ShutdownTimeout));
        server.shared.finish();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_drained_returns_immediately_when_idle() {
        let server = noop_server(ServerConfig::tcp("127.0.0.1:0"));
        tokio::time::timeout(Duration::from_millis(100), server.drained())
            .await
            .unwrap();
        assert_eq!(server.open_connections(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServerState::Draining.to_string(), "draining");
    }
}
