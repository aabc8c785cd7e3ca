//! sockserv core - Concurrent Socket Server Framework
//!
//! Serves TCP, UDP, UNIX-stream and UNIX-datagram endpoints with one task per
//! connection (or per datagram), half-duplex connection halves and a
//! cancellation-driven lifecycle.
//!
//! # Architecture
//!
//! ```text
//!   caller ctx ──────────────┐
//!                            ▼
//! ┌────────────────────── Server ───────────────────────┐
//! │  listen(ctx)                       shutdown(ctx)    │
//! │     │                                   │           │
//! │     ▼                                   ▼           │
//! │  endpoint::resolve ──► accept loop ◄── watcher      │
//! │  (umask, chmod,          │   │                      │
//! │   chown, stale file)     │   └─► task ─► handler(Reader, Writer)
//! │                          └─────► task ─► handler(Reader, Writer)
//! └─────────────────────────────────────────────────────┘
//!                            │
//!                    EventSink (info / error / server callbacks + tracing)
//! ```
//!
//! # Key Types
//!
//! - [`Server`]: lifecycle and shutdown coordinator plus the accept loop
//! - [`ServerConfig`]: protocol, address, socket-file permissions and group
//! - [`Reader`] / [`Writer`]: independently closable connection halves
//! - [`Context`]: hierarchical cancellation signal
//! - [`EventSink`]: optional observability callbacks
//! - [`Client`]: small client for every supported protocol
//!
//! # Quick Start
//!
//! ```no_run
//! use sockserv_core::{Context, Reader, Server, ServerConfig, Writer};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn run() -> Result<(), sockserv_core::SocketError> {
//! let server = Server::new(ServerConfig::unix("/tmp/echo.sock").with_permissions(0o600))
//!     .with_handler(|mut reader: Reader, mut writer: Writer| async move {
//!         let _ = tokio::io::copy(&mut reader, &mut writer).await;
//!         let _ = writer.shutdown().await;
//!     });
//!
//! let ctx = Context::new();
//! server.listen(&ctx).await
//! # }
//! ```
//!
//! # Module Overview
//!
//! - [`server`]: `listen` / `shutdown` and the accept/dispatch loop
//! - [`endpoint`]: endpoint resolution for every protocol
//! - [`connection`]: half-duplex reader and writer halves
//! - [`handler`]: the connection handler trait and stream hook
//! - [`context`]: cancellation contexts
//! - [`events`]: connection states and the event sink
//! - [`config`]: configuration loading and validation
//! - [`protocol`]: supported protocols
//! - [`client`]: client sockets
//! - [`error`]: error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod handler;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use config::{default_socket_path, parse_octal, ServerConfig};
pub use connection::{wrap, Reader, Writer};
pub use context::Context;
pub use endpoint::AcceptedStream;
pub use error::{is_cancelled_io, is_closed_io, SocketError};
pub use events::{ConnState, ErrorCallback, EventSink, InfoCallback, ServerInfoCallback};
pub use handler::{ConnectionHandler, StreamHook};
pub use protocol::{AddressFamily, NetworkProtocol};
pub use server::{Server, ServerState};
