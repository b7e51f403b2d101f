//! Tcp and udp sessions over tokio transports.
//!
//! A [`Session`] owns one connection: the framed read half, the write half,
//! a FIFO send queue and the id it borrowed from a [`SessionIdPool`].
//! Packets are framed with the session's [`PacketCodec`](crate::codec::PacketCodec)
//! and live in buffers of the shared allocator.
//!
//! Sessions move through [`SessionState`]:
//!
//! ```text
//! Unconnected -> Connected -> Closing -> Closed
//!      ^             |
//!      +-------------+  both halves failed (keep-alive reconnects)
//! ```
//!
//! `Closed` is terminal.
//!
//! A [`DatagramSession`] is the unconnected udp counterpart: bound to a
//! local port, it sends to and receives from any peer and can join
//! multicast groups.

mod acceptor;
mod config;
mod connection;
mod datagram;
mod id_pool;
mod keep_alive;
mod packet_writer;
mod transport;

pub use acceptor::Acceptor;
pub use config::DEFAULT_RECONNECT_INTERVAL;
pub use config::SessionConfig;
pub use connection::ErrorCallback;
pub use connection::SendCompletion;
pub use connection::Session;
pub use connection::SessionState;
pub use datagram::DatagramHandler;
pub use datagram::DatagramSession;
pub use id_pool::SessionId;
pub use id_pool::SessionIdGuard;
pub use id_pool::SessionIdPool;
pub use transport::BoxReader;
pub use transport::BoxWriter;
pub use transport::TcpTransport;
pub use transport::Transport;
pub use transport::TransportKind;
pub use transport::UdpTransport;
pub use transport::bind_udp;
pub use transport::connect;
