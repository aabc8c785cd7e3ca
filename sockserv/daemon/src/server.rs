//! Daemon Server Loop
//!
//! Bridges OS signals into the listen context, then drains in-flight
//! connections for a bounded time once the server has stopped accepting.
//!
//! ```text
//!   SIGTERM / SIGINT ──► ctx.cancel() ──► listen() returns
//!                                               │
//!                              drained() or drain timeout
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use sockserv_core::{Context, Server, ServerConfig, SocketError};

use crate::handlers::HandlerKind;

/// Create the socket's parent directory if it is missing
pub fn ensure_socket_dir(address: &str) -> Result<()> {
    if let Some(parent) = Path::new(address).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
            info!(path = ?parent, "Created socket directory");
        }
    }
    Ok(())
}

/// Serve `config` until a stop signal arrives, then drain
pub async fn run(config: ServerConfig, mode: HandlerKind, drain_timeout: Duration) -> Result<()> {
    let server = Server::new(config);
    mode.install(&server);
    server.register_error(Some(std::sync::Arc::new(|err: &SocketError| {
        if !err.is_closed() {
            warn!(error = %err, "Connection error");
        }
    })));

    let ctx = Context::new();
    spawn_signal_watcher(ctx.clone())?;

    serve(&server, &ctx, drain_timeout).await
}

/// Listen until `ctx` is cancelled, then wait up to `drain_timeout`
pub async fn serve(server: &Server, ctx: &Context, drain_timeout: Duration) -> Result<()> {
    let result = server.listen(ctx).await;
    if let Err(e) = &result {
        error!(error = %e, "Server stopped with error");
    }

    let open = server.open_connections();
    if open > 0 {
        info!(open, timeout_ms = drain_timeout.as_millis(), "Draining connections");
        if tokio::time::timeout(drain_timeout, server.drained())
            .await
            .is_err()
        {
            warn!(
                open = server.open_connections(),
                "Drain timeout elapsed, abandoning connections"
            );
        }
    }

    result.context("Listener failed")
}

fn spawn_signal_watcher(ctx: Context) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        ctx.cancel();
    });
    Ok(())
}
