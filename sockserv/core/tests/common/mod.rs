//! Shared harness for the integration tests
//!
//! Socket paths come from an explicit [`SocketRegistry`] owned by each test;
//! nothing is tracked process-wide.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use sockserv_core::{Context, Reader, Server, SocketError, Writer};

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Hands out unique socket paths inside a private temporary directory
pub struct SocketRegistry {
    dir: TempDir,
    next: AtomicUsize,
    issued: Mutex<Vec<PathBuf>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create socket dir"),
            next: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Fresh, not yet existing socket path
    pub fn path(&self, name: &str) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.path().join(format!("{name}-{n}.sock"));
        self.issued.lock().push(path.clone());
        path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Issued paths that still exist on disk
    pub fn lingering(&self) -> Vec<PathBuf> {
        self.issued
            .lock()
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect()
    }
}

/// A server running `listen` on a background task
pub struct Running {
    pub server: Server,
    pub ctx: Context,
    pub task: JoinHandle<Result<(), SocketError>>,
}

impl Running {
    /// Spawn `listen` and wait until the endpoint is bound
    pub async fn start(server: Server) -> Self {
        let ctx = Context::new();
        let task = {
            let server = server.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { server.listen(&ctx).await })
        };
        let ready = tokio::time::timeout(WAIT, server.ready())
            .await
            .expect("server did not become ready");
        assert!(ready, "server failed to bind");
        Self { server, ctx, task }
    }

    pub fn addr(&self) -> String {
        self.server.local_addr().expect("listening server has an address")
    }

    /// Shut down and return what `listen` returned
    pub async fn stop(self) -> Result<(), SocketError> {
        self.server.shutdown(&Context::new()).await?;
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("listen did not return")
            .expect("listen task panicked")
    }
}

/// Reads everything, writes it back uppercased, then closes both sides
pub async fn uppercase(mut reader: Reader, mut writer: Writer) {
    let mut data = Vec::new();
    if reader.read_to_end(&mut data).await.is_err() {
        return;
    }
    let _ = writer.write_all(&data.to_ascii_uppercase()).await;
    let _ = writer.shutdown().await;
    reader.close();
}

/// Copies the incoming stream (or datagram) back to the peer
pub async fn echo(mut reader: Reader, mut writer: Writer) {
    let mut data = Vec::new();
    if reader.read_to_end(&mut data).await.is_err() {
        return;
    }
    let _ = writer.write_all(&data).await;
    let _ = writer.shutdown().await;
}
