//! Transport layer: UDP/TCP/TLS framing and source-address demultiplexing
//! (spec.md §4.1).
//!
//! Transport emits `(peer, transport_kind, raw_bytes)` to the parser and
//! accepts the same shape from the serializer. No retransmission happens
//! here — that is the transaction layer's job.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

/// A raw message as read off the wire, before SIP parsing.
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    pub peer: SocketAddr,
    pub transport: TransportKind,
    pub bytes: Bytes,
}

/// A raw message to be written to the wire.
#[derive(Debug, Clone)]
pub struct OutboundDatagram {
    pub peer: SocketAddr,
    pub transport: TransportKind,
    pub bytes: Bytes,
}

/// UDP transport: each datagram is parsed as one full SIP message;
/// fragment datagrams (partial messages split across multiple UDP
/// packets, which cannot happen on a conforming network but which a
/// malformed peer might attempt) are rejected by the parser's
/// Content-Length check rather than reassembled.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::UnboundedSender<InboundDatagram>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<(Self, mpsc::UnboundedReceiver<InboundDatagram>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok((Self { socket, inbound_tx }, inbound_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs the receive loop until the socket errors out.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    let datagram = InboundDatagram {
                        peer,
                        transport: TransportKind::Udp,
                        bytes: Bytes::copy_from_slice(&buf[..len]),
                    };
                    if self.inbound_tx.send(datagram).is_err() {
                        debug!("UDP inbound channel closed, stopping receive loop");
                        return;
                    }
                }
                Err(e) => {
                    error!("UDP recv error: {e}");
                    return;
                }
            }
        }
    }

    pub async fn send(&self, peer: SocketAddr, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, peer).await?;
        Ok(())
    }
}

/// Stream transport (TCP/TLS) framer: uses `Content-Length` to delimit
/// messages within the byte stream. A missing or invalid `Content-Length`
/// fails the connection (spec.md §4.1).
pub struct StreamFramer {
    buffer: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self { buffer: BytesMut::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempts to extract one complete message from the buffered bytes.
    /// Returns `Ok(None)` if more data is needed, `Err` if the stream is
    /// unparseable and the connection should be closed.
    pub fn try_extract(&mut self) -> Result<Option<Bytes>> {
        let header_end = match find_subslice(&self.buffer, b"\r\n\r\n") {
            Some(pos) => pos + 4,
            None => return Ok(None),
        };

        let head = std::str::from_utf8(&self.buffer[..header_end])
            .map_err(|e| Error::parse(format!("non-UTF8 header block: {e}"), 0))?;

        let content_length = head
            .split("\r\n")
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                let name = name.trim();
                if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .ok_or_else(|| Error::parse("stream transport requires Content-Length", header_end))?;

        let total_len = header_end + content_length;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let message = self.buffer.split_to(total_len).freeze();
        Ok(Some(message))
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Manages accepted TCP connections, keyed by peer address, so that
/// responses on an existing connection reuse it rather than opening a
/// new one (RFC 3261 §18.2.2).
pub struct TcpTransport {
    listener_addr: SocketAddr,
    connections: Arc<DashMap<SocketAddr, Arc<tokio::sync::Mutex<TcpStream>>>>,
    inbound_tx: mpsc::UnboundedSender<InboundDatagram>,
}

impl TcpTransport {
    pub async fn bind(
        addr: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundDatagram>)> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                listener_addr: addr,
                connections: Arc::new(DashMap::new()),
                inbound_tx,
            },
            inbound_rx,
        ))
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.listener_addr).await?;
        loop {
            let (stream, peer) = listener.accept().await?;
            let connections = self.connections.clone();
            let inbound_tx = self.inbound_tx.clone();
            tokio::spawn(handle_tcp_connection(stream, peer, inbound_tx, connections));
        }
    }

    pub async fn send(&self, peer: SocketAddr, bytes: &[u8]) -> Result<()> {
        if let Some(conn) = self.connections.get(&peer) {
            let mut stream = conn.lock().await;
            stream.write_all(bytes).await?;
            return Ok(());
        }
        let mut stream = TcpStream::connect(peer).await?;
        stream.write_all(bytes).await?;
        self.connections.insert(peer, Arc::new(tokio::sync::Mutex::new(stream)));
        Ok(())
    }
}

async fn handle_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    inbound_tx: mpsc::UnboundedSender<InboundDatagram>,
    connections: Arc<DashMap<SocketAddr, Arc<tokio::sync::Mutex<TcpStream>>>>,
) {
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("TCP read error from {peer}: {e}");
                break;
            }
        };
        framer.feed(&buf[..n]);
        loop {
            match framer.try_extract() {
                Ok(Some(bytes)) => {
                    let datagram = InboundDatagram { peer, transport: TransportKind::Tcp, bytes };
                    if inbound_tx.send(datagram).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("closing TCP connection to {peer}: {e}");
                    connections.remove(&peer);
                    return;
                }
            }
        }
    }
    connections.remove(&peer);
}
