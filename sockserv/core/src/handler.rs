//! Connection Handlers
//!
//! The server invokes one handler per accepted connection (stream protocols)
//! or per received datagram (datagram protocols). Handlers receive owned
//! halves; whatever they do not close explicitly is closed when they return.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{Reader, Writer};
use crate::endpoint::AcceptedStream;

/// Per-connection callback
///
/// Implemented for any `Fn(Reader, Writer) -> impl Future<Output = ()>`, so
/// plain async closures work:
///
/// ```no_run
/// use sockserv_core::{Reader, Server, ServerConfig, Writer};
/// use tokio::io::AsyncWriteExt;
///
/// let server = Server::new(ServerConfig::tcp("127.0.0.1:0")).with_handler(
///     |_reader: Reader, mut writer: Writer| async move {
///         let _ = writer.write_all(b"hello\n").await;
///     },
/// );
/// ```
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one connection
    async fn handle(&self, reader: Reader, writer: Writer);
}

#[async_trait]
impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Reader, Writer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, reader: Reader, writer: Writer) {
        (self)(reader, writer).await;
    }
}

/// Hook run on every accepted stream before it is split into halves
///
/// Lets callers adjust socket options (e.g. `TCP_NODELAY`) on the raw stream.
pub type StreamHook = Arc<dyn Fn(&AcceptedStream) + Send + Sync>;
