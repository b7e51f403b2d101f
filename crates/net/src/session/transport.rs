//! The capability a session needs from its socket: addresses and a split
//! into independently owned read and write halves.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::protocol::MAX_RECV_SIZE;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Udp => f.write_str("udp"),
        }
    }
}

pub trait Transport: Send + fmt::Debug + 'static {
    fn kind(&self) -> TransportKind;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Splits into a reader and a writer. Shutting the writer down closes
    /// the send direction only.
    fn into_split(self: Box<Self>) -> (BoxReader, BoxWriter);
}

/// Connects a transport of the given kind to `peer`.
pub async fn connect(kind: TransportKind, peer: SocketAddr, reuse: bool) -> io::Result<Box<dyn Transport>> {
    Ok(match kind {
        TransportKind::Tcp => Box::new(TcpTransport::connect(peer, reuse).await?),
        TransportKind::Udp => Box::new(UdpTransport::connect(peer, reuse).await?),
    })
}

/// Binds an unconnected udp socket to `local`. With `reuse` set,
/// `SO_REUSEADDR` is applied before the bind so several sockets may share
/// the port.
pub fn bind_udp(local: SocketAddr, reuse: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(reuse)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub async fn connect(peer: SocketAddr, reuse: bool) -> io::Result<Self> {
        let socket = if peer.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(reuse)?;
        let stream = socket.connect(peer).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self { stream }
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn into_split(self: Box<Self>) -> (BoxReader, BoxWriter) {
        let (reader, writer) = self.stream.into_split();
        (Box::new(reader), Box::new(writer))
    }
}

/// A connected udp socket. Each write is one datagram; reads hand out
/// datagrams in arrival order.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Binds an ephemeral local port and connects it to `peer`.
    pub async fn connect(peer: SocketAddr, reuse: bool) -> io::Result<Self> {
        let local: SocketAddr =
            if peer.is_ipv4() { (Ipv4Addr::UNSPECIFIED, 0).into() } else { (Ipv6Addr::UNSPECIFIED, 0).into() };
        let socket = bind_udp(local, reuse)?;
        socket.connect(peer).await?;
        Ok(Self { socket: Arc::new(socket) })
    }

    /// Wraps a socket that is already connected to its peer.
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        socket.peer_addr()?;
        Ok(Self { socket: Arc::new(socket) })
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    fn into_split(self: Box<Self>) -> (BoxReader, BoxWriter) {
        let reader = UdpReader { socket: Arc::clone(&self.socket), scratch: vec![0; MAX_RECV_SIZE], pending: BytesMut::new() };
        (Box::new(reader), Box::new(UdpWriter { socket: self.socket, shutdown: false }))
    }
}

/// Reads whole datagrams. Whatever does not fit the caller's buffer is kept
/// for the next read.
struct UdpReader {
    socket: Arc<UdpSocket>,
    scratch: Vec<u8>,
    pending: BytesMut,
}

impl AsyncRead for UdpReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pending.is_empty() {
            loop {
                let mut datagram = ReadBuf::new(&mut this.scratch);
                ready!(this.socket.poll_recv(cx, &mut datagram))?;
                // an empty datagram would read as eof
                if !datagram.filled().is_empty() {
                    this.pending.extend_from_slice(datagram.filled());
                    break;
                }
            }
        }

        let len = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending[..len]);
        this.pending.advance(len);
        Poll::Ready(Ok(()))
    }
}

struct UdpWriter {
    socket: Arc<UdpSocket>,
    shutdown: bool,
}

impl AsyncWrite for UdpWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.shutdown {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "udp writer is shut down")));
        }
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().shutdown = true;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_split() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = connect(TransportKind::Tcp, addr, true).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(client.kind(), TransportKind::Tcp);
        assert_eq!(client.peer_addr().unwrap(), addr);

        let (mut reader, mut writer) = client.into_split();
        writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_udp_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = connect(TransportKind::Udp, server.local_addr().unwrap(), false).await.unwrap();
        assert_eq!(client.kind(), TransportKind::Udp);
        let client_addr = client.local_addr().unwrap();
        server.connect(client_addr).await.unwrap();

        let (mut reader, mut writer) = client.into_split();
        writer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        server.send(b"abcdef").await.unwrap();
        let mut small = [0u8; 4];
        let n = reader.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"abcd");
        let n = reader.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"ef");

        writer.shutdown().await.unwrap();
        assert!(writer.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_udp_reuse_addr() {
        let first = bind_udp("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = first.local_addr().unwrap();

        let shared = bind_udp(addr, true).unwrap();
        assert_eq!(shared.local_addr().unwrap(), addr);

        let exclusive = bind_udp(addr, false).unwrap_err();
        assert_eq!(exclusive.kind(), io::ErrorKind::AddrInUse);
    }
}
