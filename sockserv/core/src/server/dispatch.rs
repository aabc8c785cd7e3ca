//! Accept/Dispatch Loop
//!
//! The loop runs on the task that called `listen` and only ever blocks on
//! accept (or receive) and on the halt signal. Each connection gets its own
//! task; the loop never waits for a handler.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use super::Shared;
use crate::connection::{self, Link, Reader, Writer};
use crate::context::Context;
use crate::endpoint::{AcceptedStream, DatagramSocket, Listener};
use crate::error::{is_fd_exhaustion, is_transient_accept, SocketError};
use crate::events::ConnState;
use crate::handler::ConnectionHandler;

/// Accounts for one dispatched connection
///
/// Incremented before the task is spawned; dropping it closes both sides,
/// decrements the counter and then reports the close, even if the handler
/// panicked.
struct ConnectionGuard {
    shared: Arc<Shared>,
    link: Arc<Link>,
}

impl ConnectionGuard {
    fn open(shared: &Arc<Shared>, link: Arc<Link>) -> Self {
        shared.open.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(shared),
            link,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.link.close_all();
        if self.shared.open.fetch_sub(1, Ordering::AcqRel) <= 1 {
            self.shared.drained.notify_waiters();
        }
        self.shared.released.notify_waiters();
        self.shared
            .sink
            .connection(self.link.local(), self.link.remote(), ConnState::Close);
    }
}

/// Accept stream connections until `halt` fires or the listener breaks
pub(super) async fn serve_stream(
    shared: &Arc<Shared>,
    listener: &Listener,
    handler: &Arc<dyn ConnectionHandler>,
    parent: &Context,
    halt: &Context,
    local: &str,
) -> Result<(), SocketError> {
    let mut halted = halt.cancelled();

    loop {
        let accepted = tokio::select! {
            biased;
            () = &mut halted => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                dispatch_stream(shared, handler, parent, local, stream, remote);
            }
            Err(_) if halt.is_cancelled() => return Ok(()),
            Err(e) if is_transient_accept(&e) => {
                if !recover(shared, e, &mut halted).await {
                    return Ok(());
                }
            }
            Err(e) => return Err(SocketError::Listener(e)),
        }
    }
}

/// Receive datagrams until `halt` fires or the socket breaks
pub(super) async fn serve_datagram(
    shared: &Arc<Shared>,
    socket: &DatagramSocket,
    handler: &Arc<dyn ConnectionHandler>,
    parent: &Context,
    halt: &Context,
    local: &str,
) -> Result<(), SocketError> {
    let mut halted = halt.cancelled();
    let mut buf = vec![0u8; shared.config.datagram_buffer_size];

    loop {
        let received = tokio::select! {
            biased;
            () = &mut halted => return Ok(()),
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, peer)) => {
                let remote = peer.describe();
                shared.sink.connection(local, &remote, ConnState::New);

                let link = Link::new(
                    parent.child(),
                    local.to_string(),
                    remote,
                    None,
                    shared.sink.clone(),
                );
                let (reader, writer) =
                    connection::datagram_halves(&link, buf[..len].to_vec(), socket, peer);
                spawn_connection(shared, handler, link, reader, writer);
            }
            Err(_) if halt.is_cancelled() => return Ok(()),
            Err(e) if is_transient_accept(&e) => {
                if !recover(shared, e, &mut halted).await {
                    return Ok(());
                }
            }
            Err(e) => return Err(SocketError::Listener(e)),
        }
    }
}

/// Report a transient accept error and wait before the next attempt
///
/// Descriptor exhaustion waits until a connection closes (or the loop is
/// halted); other errors retry on the next scheduler turn. Returns `false`
/// once halted.
async fn recover(
    shared: &Shared,
    err: io::Error,
    halted: &mut BoxFuture<'static, ()>,
) -> bool {
    let exhausted = is_fd_exhaustion(&err);
    shared.sink.error(&SocketError::Accept(err));

    let released = shared.released.notified();
    tokio::pin!(released);
    released.as_mut().enable();

    if !exhausted || shared.open.load(Ordering::Acquire) <= 0 {
        tokio::task::yield_now().await;
        return true;
    }

    debug!("Out of descriptors, waiting for a connection to close");
    tokio::select! {
        biased;
        () = halted => false,
        () = released => true,
    }
}

fn dispatch_stream(
    shared: &Arc<Shared>,
    handler: &Arc<dyn ConnectionHandler>,
    parent: &Context,
    local: &str,
    stream: AcceptedStream,
    remote: String,
) {
    shared.sink.connection(local, &remote, ConnState::New);

    let hook = shared.hook.read().clone();
    if let Some(hook) = hook {
        if std::panic::catch_unwind(AssertUnwindSafe(|| hook(&stream))).is_err() {
            warn!(%remote, "Stream hook panicked");
        }
    }

    let (read, write, fd) = stream.into_halves();
    let link = Link::new(
        parent.child(),
        local.to_string(),
        remote,
        Some(fd),
        shared.sink.clone(),
    );
    let (reader, writer) = connection::stream_halves(&link, read, write);
    spawn_connection(shared, handler, link, reader, writer);
}

fn spawn_connection(
    shared: &Arc<Shared>,
    handler: &Arc<dyn ConnectionHandler>,
    link: Arc<Link>,
    reader: Reader,
    writer: Writer,
) {
    let guard = ConnectionGuard::open(shared, Arc::clone(&link));
    if let Some(idle) = shared.config.idle_timeout() {
        connection::spawn_idle_watchdog(Arc::clone(&link), idle);
    }

    let span = info_span!("connection", id = %Uuid::new_v4(), remote = %link.remote());
    let handler = Arc::clone(handler);
    let sink = shared.sink.clone();

    tokio::spawn(
        async move {
            let _guard = guard;
            sink.connection(link.local(), link.remote(), ConnState::Handler);

            let outcome = AssertUnwindSafe(handler.handle(reader, writer))
                .catch_unwind()
                .await;
            match outcome {
                Ok(()) => debug!("Handler finished"),
                Err(panic) => {
                    sink.error(&SocketError::HandlerPanic(panic_message(panic.as_ref())));
                }
            }
        }
        .instrument(span),
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
