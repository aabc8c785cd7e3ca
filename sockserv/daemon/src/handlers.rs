//! Built-in connection handlers

use clap::ValueEnum;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use sockserv_core::{is_closed_io, Reader, Server, Writer};

/// Which handler the daemon serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HandlerKind {
    /// Send every received byte straight back
    Echo,
    /// Read the whole request, reply with it uppercased
    Upper,
}

impl HandlerKind {
    /// Install this handler on `server`
    pub fn install(self, server: &Server) {
        match self {
            Self::Echo => server.set_handler(echo),
            Self::Upper => server.set_handler(upper),
        }
    }
}

/// Stream bytes back as they arrive
pub async fn echo(mut reader: Reader, mut writer: Writer) {
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(bytes, remote = %reader.remote_addr(), "Echoed"),
        Err(e) if is_closed_io(&e) => {}
        Err(e) => debug!(error = %e, "Echo failed"),
    }
    let _ = writer.shutdown().await;
}

/// Reply with the uppercased request once the peer finished sending
pub async fn upper(mut reader: Reader, mut writer: Writer) {
    let mut request = Vec::new();
    if let Err(e) = reader.read_to_end(&mut request).await {
        if !is_closed_io(&e) {
            debug!(error = %e, "Read failed");
        }
        return;
    }

    let reply = request.to_ascii_uppercase();
    if let Err(e) = writer.write_all(&reply).await {
        debug!(error = %e, "Write failed");
    }
    let _ = writer.shutdown().await;
}
