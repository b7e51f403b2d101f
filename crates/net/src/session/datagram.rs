//! Bound udp endpoints that talk to any peer.
//!
//! A [`DatagramSession`] owns an unconnected socket. Packets go out with
//! [`send_to`](DatagramSession::send_to) and come back from
//! [`recv_from`](DatagramSession::recv_from) together with the sender's
//! address, one packet per datagram, framed with the session's codec.
//!
//! Multicast uses the same type: a receiver binds the group port with
//! address reuse and joins the group, a sender simply sends to the group
//! address.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::SharedAllocator;
use crate::codec::Packet;
use crate::ensure;
use crate::protocol::{CodecError, MAX_RECV_SIZE, SessionError};
use crate::session::connection::with_timeout;
use crate::session::transport::bind_udp;
use crate::session::{SessionConfig, SessionId, SessionIdGuard, SessionIdPool};

/// Called with every datagram a [`DatagramSession::serve`] loop receives.
pub type DatagramHandler = Arc<dyn Fn(SessionId, SocketAddr, Packet) + Send + Sync>;

pub struct DatagramSession {
    id: SessionIdGuard,
    socket: UdpSocket,
    config: SessionConfig,
    allocator: SharedAllocator,
    scratch: AsyncMutex<Vec<u8>>,
    groups: Mutex<Vec<Ipv4Addr>>,
    shutdown: CancellationToken,
}

impl DatagramSession {
    /// Binds `local`. [`SessionConfig::reuse_addr`] decides whether the port
    /// may be shared with other sockets.
    pub fn bind(
        local: SocketAddr,
        config: SessionConfig,
        ids: &Arc<SessionIdPool>,
        allocator: SharedAllocator,
    ) -> Result<Self, SessionError> {
        let id = ids.acquire()?;
        let socket = match bind_udp(local, config.reuse_addr()) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(id = id.id(), %local, cause = %e, "failed to bind datagram session");
                return Err(SessionError::io(e));
            }
        };
        info!(id = id.id(), local = ?socket.local_addr().ok(), reuse = config.reuse_addr(), "datagram session bound");
        Ok(Self {
            id,
            socket,
            config,
            allocator,
            scratch: AsyncMutex::new(vec![0; MAX_RECV_SIZE]),
            groups: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Binds `0.0.0.0:port` with address reuse and joins `group` on the
    /// default interface.
    pub fn multicast_receiver(
        group: Ipv4Addr,
        port: u16,
        config: SessionConfig,
        ids: &Arc<SessionIdPool>,
        allocator: SharedAllocator,
    ) -> Result<Self, SessionError> {
        let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let session = Self::bind(local, config.with_reuse_addr(true), ids, allocator)?;
        session.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id.id()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        self.socket.local_addr().map_err(SessionError::io)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Sends `bytes` to `peer` as a single datagram and returns the body
    /// length. A body larger than the codec allows is rejected, never split.
    pub async fn send_to(&self, peer: SocketAddr, bytes: &[u8]) -> Result<usize, SessionError> {
        ensure!(!self.is_closed(), SessionError::NotConnected(self.id()));

        let packet = self.config.codec().encode_packet(bytes, &self.allocator)?;
        let sent = self.guarded(async { self.socket.send_to(packet.as_bytes(), peer).await.map_err(SessionError::io) }).await;
        match sent {
            Ok(len) if len == packet.len() => {
                trace!(id = self.id(), %peer, len = packet.body_len(), "sent datagram");
                Ok(packet.body_len())
            }
            Ok(len) => Err(SessionError::io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated to {len} of {} bytes", packet.len()),
            ))),
            Err(e) => {
                debug!(id = self.id(), %peer, cause = %e, "send datagram failed");
                Err(e)
            }
        }
    }

    /// Waits for the next datagram and returns its packet with the sender.
    ///
    /// Empty datagrams are skipped. A headered datagram whose header does not
    /// announce exactly the bytes that arrived is a codec error; the session
    /// stays usable.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SessionError> {
        ensure!(!self.is_closed(), SessionError::NotConnected(self.id()));

        let mut scratch = self.scratch.lock().await;
        let (len, peer) = self
            .guarded(async {
                loop {
                    let (len, peer) = self.socket.recv_from(&mut scratch).await.map_err(SessionError::io)?;
                    if len > 0 {
                        return Ok((len, peer));
                    }
                    trace!(id = self.id(), %peer, "skip empty datagram");
                }
            })
            .await?;

        let packet = self.unframe(&scratch[..len])?;
        trace!(id = self.id(), %peer, len = packet.body_len(), "received datagram");
        Ok((packet, peer))
    }

    fn unframe(&self, datagram: &[u8]) -> Result<Packet, SessionError> {
        let codec = self.config.codec();
        let body = if codec.is_headered() {
            let body_len = codec.decode_header(datagram)?;
            let body = &datagram[codec.head_len()..];
            ensure!(
                body.len() == body_len,
                CodecError::bad_data(format!("header announces {body_len} bytes, datagram carries {}", body.len())).into()
            );
            body
        } else {
            datagram
        };
        Ok(codec.encode_packet(body, &self.allocator)?)
    }

    /// Runs a receive loop until the session is closed or the socket fails.
    /// Malformed datagrams and timeouts are logged and skipped.
    pub fn serve(self: &Arc<Self>, handler: DatagramHandler) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match session.recv_from().await {
                    Ok((packet, peer)) => handler(session.id(), peer, packet),
                    Err(SessionError::Codec { source }) => {
                        warn!(id = session.id(), cause = %source, "drop malformed datagram");
                    }
                    Err(SessionError::Timeout(limit)) => {
                        trace!(id = session.id(), ?limit, "no datagram within the timeout");
                    }
                    Err(e) => {
                        if !session.is_closed() {
                            warn!(id = session.id(), cause = %e, "datagram receive loop stopped");
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Joins `group` on the interface with address `interface`,
    /// [`Ipv4Addr::UNSPECIFIED`] letting the system pick one.
    pub fn join_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<(), SessionError> {
        ensure!(group.is_multicast(), SessionError::io(not_multicast(group)));
        self.socket.join_multicast_v4(group, interface).map_err(SessionError::io)?;
        info!(id = self.id(), %group, %interface, "joined multicast group");

        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        if !groups.contains(&group) {
            groups.push(group);
        }
        Ok(())
    }

    pub fn leave_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<(), SessionError> {
        self.socket.leave_multicast_v4(group, interface).map_err(SessionError::io)?;
        info!(id = self.id(), %group, "left multicast group");
        self.groups.lock().unwrap_or_else(PoisonError::into_inner).retain(|joined| *joined != group);
        Ok(())
    }

    /// Groups joined and not left yet.
    pub fn groups(&self) -> Vec<Ipv4Addr> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether datagrams this socket sends to a group come back to local members.
    pub fn set_multicast_loop_v4(&self, on: bool) -> Result<(), SessionError> {
        self.socket.set_multicast_loop_v4(on).map_err(SessionError::io)
    }

    pub fn set_multicast_ttl_v4(&self, ttl: u32) -> Result<(), SessionError> {
        self.socket.set_multicast_ttl_v4(ttl).map_err(SessionError::io)
    }

    /// Interface outgoing group datagrams leave through.
    pub fn set_multicast_interface_v4(&self, interface: Ipv4Addr) -> Result<(), SessionError> {
        SockRef::from(&self.socket).set_multicast_if_v4(&interface).map_err(SessionError::io)
    }

    /// Stops pending and future sends and receives. Joined groups are left
    /// when the socket is dropped.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        info!(id = self.id(), groups = ?self.groups(), "datagram session closed");
    }

    async fn guarded<T>(
        &self,
        operation: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        let limited = with_timeout(self.config.timeout(), operation);
        tokio::select! {
            result = limited => result,
            () = self.shutdown.cancelled() => Err(SessionError::NotConnected(self.id())),
        }
    }
}

fn not_multicast(group: Ipv4Addr) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{group} is not a multicast address"))
}

impl fmt::Debug for DatagramSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSession")
            .field("id", &self.id())
            .field("local", &self.socket.local_addr().ok())
            .field("groups", &self.groups())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
