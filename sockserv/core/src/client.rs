//! Socket Client
//!
//! A small client for every supported protocol, mainly for talking to a
//! [`crate::Server`] from tests and tools. It reports `Dial`, `New` and
//! `Close` events through an [`EventSink`] like the server does.
//!
//! UNIX datagram clients bind a temporary socket file so the server can
//! reply; the file is removed when the client is dropped.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, UnixDatagram, UnixStream};
use tracing::debug;
use uuid::Uuid;

use crate::config::MAX_DATAGRAM_SIZE;
use crate::endpoint::{normalize_socket_path, resolve_network, SocketFile};
use crate::error::SocketError;
use crate::events::{ConnState, EventSink};
use crate::protocol::NetworkProtocol;

enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp(UdpSocket),
    UnixGram(UnixDatagram),
}

/// Connected client socket
pub struct Client {
    protocol: NetworkProtocol,
    transport: Transport,
    local: String,
    remote: String,
    sink: EventSink,
    /// Reply address of a UNIX datagram client
    _file: Option<SocketFile>,
}

impl Client {
    /// Connect to `address` over `protocol`
    pub async fn connect(protocol: NetworkProtocol, address: &str) -> Result<Self, SocketError> {
        Self::connect_with(protocol, address, EventSink::new()).await
    }

    /// Connect and report events through `sink`
    pub async fn connect_with(
        protocol: NetworkProtocol,
        address: &str,
        sink: EventSink,
    ) -> Result<Self, SocketError> {
        if address.trim().is_empty() {
            return Err(SocketError::invalid_address(address, "address must not be empty"));
        }
        sink.connection("", address, ConnState::Dial);

        let (transport, local, remote, file) = match protocol {
            NetworkProtocol::Tcp | NetworkProtocol::Tcp4 | NetworkProtocol::Tcp6 => {
                let addr = resolve_network(protocol, address).await?;
                let stream = TcpStream::connect(addr).await?;
                let local = stream.local_addr()?.to_string();
                (Transport::Tcp(stream), local, addr.to_string(), None)
            }
            NetworkProtocol::Udp | NetworkProtocol::Udp4 | NetworkProtocol::Udp6 => {
                let addr = resolve_network(protocol, address).await?;
                let socket = UdpSocket::bind(unspecified_for(&addr)).await?;
                socket.connect(addr).await?;
                let local = socket.local_addr()?.to_string();
                (Transport::Udp(socket), local, addr.to_string(), None)
            }
            NetworkProtocol::Unix => {
                let path = normalize_socket_path(address)?;
                let stream = UnixStream::connect(&path).await?;
                let remote = path.display().to_string();
                (Transport::Unix(stream), String::new(), remote, None)
            }
            NetworkProtocol::UnixGram => {
                let path = normalize_socket_path(address)?;
                let reply = std::env::temp_dir()
                    .join(format!("sockserv-client-{}.sock", Uuid::new_v4().simple()));
                let socket = UnixDatagram::bind(&reply)?;
                let file = SocketFile::new(reply);
                socket.connect(&path)?;
                let local = file.path().display().to_string();
                let remote = path.display().to_string();
                (Transport::UnixGram(socket), local, remote, Some(file))
            }
        };

        debug!(%protocol, %local, %remote, "Client connected");
        sink.connection(&local, &remote, ConnState::New);

        Ok(Self {
            protocol,
            transport,
            local,
            remote,
            sink,
            _file: file,
        })
    }

    /// Connect, send `request`, close the write side and collect the reply
    ///
    /// Stream protocols read until the server closes; datagram protocols
    /// return the first datagram received.
    pub async fn once(
        protocol: NetworkProtocol,
        address: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, SocketError> {
        let mut client = Self::connect(protocol, address).await?;
        client.send(request).await?;
        client.close_write().await?;
        client.read_reply().await
    }

    /// Protocol of this client
    #[must_use]
    pub fn protocol(&self) -> NetworkProtocol {
        self.protocol
    }

    /// Local address (empty for unnamed UNIX stream clients)
    #[must_use]
    pub fn local_addr(&self) -> &str {
        &self.local
    }

    /// Address the client is connected to
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    /// Write all of `data` (one datagram for datagram protocols)
    pub async fn send(&mut self, data: &[u8]) -> Result<(), SocketError> {
        match &mut self.transport {
            Transport::Tcp(stream) => stream.write_all(data).await?,
            Transport::Unix(stream) => stream.write_all(data).await?,
            Transport::Udp(socket) => {
                socket.send(data).await?;
            }
            Transport::UnixGram(socket) => {
                socket.send(data).await?;
            }
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes (or one datagram)
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let n = match &mut self.transport {
            Transport::Tcp(stream) => stream.read(buf).await?,
            Transport::Unix(stream) => stream.read(buf).await?,
            Transport::Udp(socket) => socket.recv(buf).await?,
            Transport::UnixGram(socket) => socket.recv(buf).await?,
        };
        Ok(n)
    }

    /// Half-close the write direction; a no-op for datagram protocols
    pub async fn close_write(&mut self) -> Result<(), SocketError> {
        match &mut self.transport {
            Transport::Tcp(stream) => stream.shutdown().await?,
            Transport::Unix(stream) => stream.shutdown().await?,
            Transport::Udp(_) | Transport::UnixGram(_) => return Ok(()),
        }
        self.sink
            .connection(&self.local, &self.remote, ConnState::CloseWrite);
        Ok(())
    }

    /// Read until EOF (streams) or receive one datagram
    pub async fn read_reply(&mut self) -> Result<Vec<u8>, SocketError> {
        if self.protocol.is_datagram() {
            let mut reply = vec![0u8; MAX_DATAGRAM_SIZE];
            let n = self.recv(&mut reply).await?;
            reply.truncate(n);
            return Ok(reply);
        }

        let mut reply = Vec::new();
        match &mut self.transport {
            Transport::Tcp(stream) => stream.read_to_end(&mut reply).await?,
            Transport::Unix(stream) => stream.read_to_end(&mut reply).await?,
            Transport::Udp(_) | Transport::UnixGram(_) => 0,
        };
        Ok(reply)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.sink
            .connection(&self.local, &self.remote, ConnState::Close);
    }
}

fn unspecified_for(target: &SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
