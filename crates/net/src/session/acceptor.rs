use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tracing::{info, warn};

use crate::buffer::SharedAllocator;
use crate::protocol::SessionError;
use crate::session::{Session, SessionConfig, SessionIdPool, TcpTransport};

const LISTEN_BACKLOG: u32 = 1024;

/// Listens for tcp connections and turns each into a [`Session`] with a
/// pooled id.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    config: SessionConfig,
    ids: Arc<SessionIdPool>,
    allocator: SharedAllocator,
}

impl Acceptor {
    pub async fn bind(
        addr: SocketAddr,
        config: SessionConfig,
        ids: Arc<SessionIdPool>,
        allocator: SharedAllocator,
    ) -> Result<Self, SessionError> {
        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(config.reuse_addr())?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        info!(addr = %listener.local_addr()?, "start listening");
        Ok(Self { listener, config, ids, allocator })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn ids(&self) -> &Arc<SessionIdPool> {
        &self.ids
    }

    /// Waits for the next connection. When the id pool is exhausted the
    /// stream is dropped and the error returned.
    pub async fn accept(&self) -> Result<Session, SessionError> {
        let (stream, peer) = self.listener.accept().await?;
        match Session::from_transport(
            Box::new(TcpTransport::from_stream(stream)),
            self.config,
            &self.ids,
            self.allocator.clone(),
        ) {
            Ok(session) => {
                info!(id = session.id(), %peer, "accepted connection");
                Ok(session)
            }
            Err(e) => {
                warn!(%peer, cause = %e, "refused connection");
                Err(e)
            }
        }
    }
}
