//! Half-Duplex Connection Wrapper
//!
//! Every accepted connection is handed to the handler as two independently
//! closable halves:
//!
//! ```text
//!                 ┌──────────── Link ────────────┐
//!                 │ ctx (child of listen ctx)    │
//!   Reader ──────►│ read_closed    write_closed  │◄────── Writer
//!   AsyncRead     │ fd (half-close capable)      │     AsyncWrite
//!                 └──────────────────────────────┘
//! ```
//!
//! - Closing the reader issues `shutdown(SHUT_RD)` when the transport has a
//!   half-close primitive; otherwise it counts as a full close and marks both
//!   sides closed. The writer is symmetric with `SHUT_WR`.
//! - Once both sides are closed the connection context is cancelled, which
//!   unblocks anything waiting on it.
//! - Every read and write checks the context first. A cancelled context
//!   closes the calling side and fails the operation with a cancellation
//!   error, including operations already pending when cancellation happens.
//! - The underlying descriptor is released only when both halves are dropped.
//!
//! Datagram dialogues use the same types: the reader yields the received
//! datagram, the writer sends replies to its sender through the shared
//! server socket, and there is no half-close.

use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tracing::debug;

use crate::context::Context;
use crate::endpoint::{DatagramPeer, DatagramSocket};
use crate::error::{cancelled_io, closed_io, is_own_io, SocketError};
use crate::events::{ConnState, EventSink};

/// Boxed read half of a stream
pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a stream
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared by the two halves of one connection
pub(crate) struct Link {
    ctx: Context,
    local: String,
    remote: String,
    /// Descriptor for `shutdown(2)`; `None` when the transport cannot half-close
    fd: Option<RawFd>,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    /// First data seen in each direction, reported once
    read_seen: AtomicBool,
    write_seen: AtomicBool,
    activity: Notify,
    sink: EventSink,
}

impl Link {
    pub(crate) fn new(
        ctx: Context,
        local: String,
        remote: String,
        fd: Option<RawFd>,
        sink: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            local,
            remote,
            fd,
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            read_seen: AtomicBool::new(false),
            write_seen: AtomicBool::new(false),
            activity: Notify::new(),
            sink,
        })
    }

    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn local(&self) -> &str {
        &self.local
    }

    pub(crate) fn remote(&self) -> &str {
        &self.remote
    }

    fn read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    fn write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }

    /// Both directions are closed
    pub(crate) fn is_closed(&self) -> bool {
        self.read_closed() && self.write_closed()
    }

    fn touch(&self, direction: ConnState) {
        self.activity.notify_one();
        let seen = match direction {
            ConnState::Read => &self.read_seen,
            _ => &self.write_seen,
        };
        if !seen.swap(true, Ordering::AcqRel) {
            self.sink.connection(&self.local, &self.remote, direction);
        }
    }

    /// Forward a transport error to the error callback
    ///
    /// Errors produced by the halves themselves (closed, cancelled) are
    /// expected and stay with the handler.
    fn report(&self, err: &io::Error) {
        if is_own_io(err) {
            return;
        }
        let copy = err.raw_os_error().map_or_else(
            || io::Error::new(err.kind(), err.to_string()),
            io::Error::from_raw_os_error,
        );
        self.sink.error(&SocketError::Io(copy));
    }

    /// Mark the read side closed; without half-close this closes both sides
    fn close_read(&self) {
        if self.read_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.fd.is_none() {
            self.write_closed.store(true, Ordering::Release);
        }
        self.sink
            .connection(&self.local, &self.remote, ConnState::CloseRead);
        self.finish_if_closed();
    }

    /// Mark the write side closed; without half-close this closes both sides
    fn close_write(&self) {
        if self.write_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.fd.is_none() {
            self.read_closed.store(true, Ordering::Release);
        }
        self.sink
            .connection(&self.local, &self.remote, ConnState::CloseWrite);
        self.finish_if_closed();
    }

    /// Mark both sides closed without touching the descriptor
    ///
    /// Used by the dispatcher after the handler returned and the halves have
    /// been dropped, when the descriptor may already be released.
    pub(crate) fn close_all(&self) {
        self.close_read();
        self.close_write();
    }

    fn finish_if_closed(&self) {
        if self.is_closed() && !self.ctx.is_cancelled() {
            debug!(local = %self.local, remote = %self.remote, "Both sides closed");
            self.ctx.cancel();
        }
    }
}

/// Read side of a connection
///
/// Implements [`AsyncRead`]; use `tokio::io::AsyncReadExt` for convenience
/// methods. Dropping the reader closes the read side.
pub struct Reader {
    link: Arc<Link>,
    io: Option<BoxedRead>,
    cancelled: Option<BoxFuture<'static, ()>>,
}

/// Write side of a connection
///
/// Implements [`AsyncWrite`]; `shutdown()` (or [`Writer::close`]) closes the
/// write side and sends EOF to the peer on stream transports. Dropping the
/// writer closes the write side.
pub struct Writer {
    link: Arc<Link>,
    io: Option<WriteSink>,
    cancelled: Option<BoxFuture<'static, ()>>,
}

enum WriteSink {
    Stream(BoxedWrite),
    /// Replies go back to the sender through the shared server socket
    Datagram {
        socket: DatagramSocket,
        peer: DatagramPeer,
    },
}

/// Build the halves of a stream connection
pub(crate) fn stream_halves(link: &Arc<Link>, read: BoxedRead, write: BoxedWrite) -> (Reader, Writer) {
    (
        Reader::new(Arc::clone(link), read),
        Writer::new(Arc::clone(link), WriteSink::Stream(write)),
    )
}

/// Build the halves of a datagram dialogue
pub(crate) fn datagram_halves(
    link: &Arc<Link>,
    payload: Vec<u8>,
    socket: &DatagramSocket,
    peer: DatagramPeer,
) -> (Reader, Writer) {
    let sink = WriteSink::Datagram {
        socket: socket.clone(),
        peer,
    };

    (
        Reader::new(Arc::clone(link), Box::new(io::Cursor::new(payload))),
        Writer::new(Arc::clone(link), sink),
    )
}

/// Wrap an externally supplied bidirectional stream (e.g. a TLS session)
///
/// The stream has no half-close primitive: closing either half closes both.
/// `ctx` should be a context dedicated to this connection; it is cancelled
/// once both halves are closed.
pub fn wrap<S>(stream: S, ctx: Context, sink: EventSink) -> (Reader, Writer)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let link = Link::new(ctx, String::new(), String::new(), None, sink);
    stream_halves(&link, Box::new(read), Box::new(write))
}

/// Cancel `link`'s context after `timeout` without any read or write
pub(crate) fn spawn_idle_watchdog(link: Arc<Link>, timeout: Duration) {
    tokio::spawn(async move {
        let mut cancelled = link.ctx.cancelled();
        loop {
            tokio::select! {
                () = &mut cancelled => break,
                active = tokio::time::timeout(timeout, link.activity.notified()) => {
                    if active.is_err() {
                        link.sink.error(&SocketError::IdleTimeout(timeout));
                        link.ctx.cancel();
                        break;
                    }
                }
            }
        }
    });
}

impl Reader {
    fn new(link: Arc<Link>, io: BoxedRead) -> Self {
        let cancelled = Some(link.ctx.cancelled());
        Self {
            link,
            io: Some(io),
            cancelled,
        }
    }

    /// Connection context; cancelled once both sides are closed
    #[must_use]
    pub fn context(&self) -> &Context {
        self.link.context()
    }

    /// Local address of the connection
    #[must_use]
    pub fn local_addr(&self) -> &str {
        self.link.local()
    }

    /// Remote address of the connection (empty for unnamed UNIX peers)
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        self.link.remote()
    }

    /// Whether reads can still succeed, without performing any I/O
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.io.is_some() && !self.link.read_closed() && !self.link.ctx.is_cancelled()
    }

    /// Close the read side
    ///
    /// On half-close capable transports the peer may keep receiving data
    /// written through the [`Writer`]. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(io) = self.io.take() {
            if let Some(fd) = self.link.fd {
                // The descriptor stays valid while `io` holds the read half
                shutdown_fd(fd, libc::SHUT_RD);
            }
            drop(io);
        }
        self.link.close_read();
    }

    fn poll_cancelled(&mut self, cx: &mut TaskContext<'_>) -> bool {
        poll_latch(&mut self.cancelled, cx)
    }
}

impl AsyncRead for Reader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.link.read_closed() || this.io.is_none() {
            return Poll::Ready(Err(closed_io()));
        }
        if this.poll_cancelled(cx) {
            this.close();
            return Poll::Ready(Err(cancelled_io()));
        }

        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Err(closed_io()));
        };
        let before = buf.filled().len();
        match Pin::new(io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.link.touch(ConnState::Read);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.link.report(&e);
                this.close();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

impl Writer {
    fn new(link: Arc<Link>, io: WriteSink) -> Self {
        let cancelled = Some(link.ctx.cancelled());
        Self {
            link,
            io: Some(io),
            cancelled,
        }
    }

    /// Connection context; cancelled once both sides are closed
    #[must_use]
    pub fn context(&self) -> &Context {
        self.link.context()
    }

    /// Local address of the connection
    #[must_use]
    pub fn local_addr(&self) -> &str {
        self.link.local()
    }

    /// Remote address of the connection (empty for unnamed UNIX peers)
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        self.link.remote()
    }

    /// Whether writes can still succeed
    ///
    /// Stream transports are probed with a zero-length, non-blocking send,
    /// which has no effect on the byte stream.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.io.is_none() || self.link.write_closed() || self.link.ctx.is_cancelled() {
            return false;
        }
        match (self.link.fd, &self.io) {
            (Some(fd), Some(WriteSink::Stream(_))) => probe_fd(fd),
            _ => true,
        }
    }

    /// Flush and close the write side, sending EOF on stream transports
    pub async fn close(&mut self) -> io::Result<()> {
        tokio::io::AsyncWriteExt::shutdown(self).await
    }

    fn close_now(&mut self) {
        self.io = None;
        self.link.close_write();
    }

    fn poll_cancelled(&mut self, cx: &mut TaskContext<'_>) -> bool {
        poll_latch(&mut self.cancelled, cx)
    }

    fn check_usable(&mut self, cx: &mut TaskContext<'_>) -> Option<io::Error> {
        if self.link.write_closed() || self.io.is_none() {
            return Some(closed_io());
        }
        if self.poll_cancelled(cx) {
            self.close_now();
            return Some(cancelled_io());
        }
        None
    }
}

impl AsyncWrite for Writer {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Some(err) = this.check_usable(cx) {
            return Poll::Ready(Err(err));
        }

        let result = match this.io.as_mut() {
            Some(WriteSink::Stream(io)) => Pin::new(io).poll_write(cx, buf),
            Some(WriteSink::Datagram { socket, peer }) => match (socket, peer) {
                (DatagramSocket::Udp(socket), DatagramPeer::Udp(addr)) => {
                    socket.poll_send_to(cx, buf, *addr)
                }
                (DatagramSocket::Unix(socket), DatagramPeer::Unix(Some(path))) => {
                    socket.poll_send_to(cx, buf, path)
                }
                _ => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "datagram sender is unnamed and cannot receive replies",
                ))),
            },
            None => Poll::Ready(Err(closed_io())),
        };

        match &result {
            Poll::Ready(Ok(n)) if *n > 0 => this.link.touch(ConnState::Write),
            Poll::Ready(Err(e)) => this.link.report(e),
            _ => {}
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(err) = this.check_usable(cx) {
            return Poll::Ready(Err(err));
        }
        let result = match this.io.as_mut() {
            Some(WriteSink::Stream(io)) => Pin::new(io).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        };
        if let Poll::Ready(Err(e)) = &result {
            this.link.report(e);
        }
        result
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.io.is_none() {
            this.link.close_write();
            return Poll::Ready(Ok(()));
        }

        let result = match this.io.as_mut() {
            Some(WriteSink::Stream(io)) => match Pin::new(io).poll_shutdown(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                Poll::Ready(other) => other,
            },
            _ => Ok(()),
        };

        this.close_now();
        Poll::Ready(result)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // Dropping a stream write half shuts down the write direction
        self.close_now();
    }
}

/// Poll a stored cancellation future; `None` means it already fired
fn poll_latch(latch: &mut Option<BoxFuture<'static, ()>>, cx: &mut TaskContext<'_>) -> bool {
    let fired = match latch.as_mut() {
        Some(fut) => fut.poll_unpin(cx).is_ready(),
        None => return true,
    };
    if fired {
        *latch = None;
    }
    fired
}

fn shutdown_fd(fd: RawFd, how: libc::c_int) {
    // SAFETY: callers hold a half of the stream owning `fd`, so it is open.
    let rc = unsafe { libc::shutdown(fd, how) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOTCONN) {
            debug!(fd, error = %err, "shutdown failed");
        }
    }
}

#[cfg(target_os = "linux")]
const PROBE_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const PROBE_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

fn probe_fd(fd: RawFd) -> bool {
    let empty: [u8; 0] = [];
    // SAFETY: zero-length send on a descriptor owned by the writer half.
    let rc = unsafe { libc::send(fd, empty.as_ptr().cast(), 0, PROBE_FLAGS) };
    rc >= 0 || io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    fn pair_from_unix(stream: UnixStream, ctx: Context) -> (Reader, Writer, Arc<Link>) {
        let (read, write, fd) = crate::endpoint::AcceptedStream::Unix(stream).into_halves();
        let link = Link::new(ctx, "local".into(), "remote".into(), Some(fd), EventSink::new());
        let (reader, writer) = stream_halves(&link, read, write);
        (reader, writer, link)
    }

    #[tokio::test]
    async fn test_close_reader_keeps_writer_usable() {
        let (server, mut client) = UnixStream::pair().unwrap();
        let (mut reader, mut writer, link) = pair_from_unix(server, Context::new());

        reader.close();
        assert!(!reader.is_alive());
        assert!(writer.is_alive());

        writer.write_all(b"still here").await.unwrap();
        writer.close().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"still here");

        assert!(link.is_closed());
        assert!(link.context().is_cancelled());
    }

    #[tokio::test]
    async fn test_write_fails_after_both_sides_closed() {
        let (server, _client) = UnixStream::pair().unwrap();
        let (mut reader, mut writer, _link) = pair_from_unix(server, Context::new());

        writer.close().await.unwrap();
        reader.close();

        let err = writer.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_read() {
        let (server, _client) = UnixStream::pair().unwrap();
        let ctx = Context::new();
        let (mut reader, _writer, _link) = pair_from_unix(server, ctx.child());

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        ctx.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("read should unblock on cancellation")
            .unwrap()
            .unwrap_err();
        assert!(crate::error::is_cancelled_io(&err));
    }

    #[tokio::test]
    async fn test_cancelled_write_closes_own_side_only() {
        let (server, _client) = UnixStream::pair().unwrap();
        let ctx = Context::new();
        let (reader, mut writer, link) = pair_from_unix(server, ctx.child());

        ctx.cancel();
        let err = writer.write_all(b"x").await.unwrap_err();
        assert!(crate::error::is_cancelled_io(&err));
        assert!(link.write_closed());
        assert!(!link.read_closed());
        drop(reader);
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn test_wrapped_stream_closes_both_sides() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let (mut reader, mut writer) = wrap(ours, Context::new(), EventSink::new());

        theirs.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        reader.close();
        assert!(!writer.is_alive());
        assert!(writer.context().is_cancelled());
        let err = writer.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_datagram_close_one_side_closes_both() {
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let link = Link::new(
            Context::new(),
            "local".into(),
            peer_addr.to_string(),
            None,
            EventSink::new(),
        );
        let (mut reader, mut writer) = datagram_halves(
            &link,
            b"ping".to_vec(),
            &DatagramSocket::Udp(socket),
            DatagramPeer::Udp(peer_addr),
        );

        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).await.unwrap();
        writer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 8];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        reader.close();
        assert!(link.is_closed());
        assert!(link.context().is_cancelled());
        let err = writer.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_first_read_and_write_are_reported_once() {
        let mock = tokio_test::io::Builder::new()
            .read(b"a")
            .read(b"b")
            .write(b"x")
            .write(b"y")
            .build();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = EventSink::new();
        let seen_cb = Arc::clone(&seen);
        sink.set_info(Some(Arc::new(move |_: &str, _: &str, state: ConnState| {
            seen_cb.lock().unwrap().push(state);
        })));
        let (mut reader, mut writer) = wrap(mock, Context::new(), sink);

        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        writer.write_all(b"x").await.unwrap();
        writer.write_all(b"y").await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnState::Read, ConnState::Write]
        );
    }

    #[tokio::test]
    async fn test_transport_errors_reach_error_callback() {
        let mock = tokio_test::io::Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = EventSink::new();
        let errors_cb = Arc::clone(&errors);
        sink.set_error(Some(Arc::new(move |err: &SocketError| {
            errors_cb.lock().unwrap().push(err.to_string());
        })));
        let (mut reader, _writer) = wrap(mock, Context::new(), sink);

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        // Errors raised by the closed half itself stay with the handler
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_writer_probe_detects_reset_peer() {
        let (server, client) = UnixStream::pair().unwrap();
        let (_reader, writer, _link) = pair_from_unix(server, Context::new());
        assert!(writer.is_alive());

        drop(client);
        tokio::task::yield_now().await;
        assert!(!writer.is_alive());
    }

    #[tokio::test]
    async fn test_idle_watchdog_cancels_quiet_connection() {
        let (server, _client) = UnixStream::pair().unwrap();
        let (mut reader, _writer, link) = pair_from_unix(server, Context::new());
        spawn_idle_watchdog(Arc::clone(&link), Duration::from_millis(50));

        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(crate::error::is_cancelled_io(&err));
        assert!(link.context().is_cancelled());
    }
}
