use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::buffer::SharedAllocator;
use crate::codec::{Packet, PacketDecoder};
use crate::ensure;
use crate::protocol::{Direction, SessionError};
use crate::session::packet_writer::PacketWriter;
use crate::session::transport::{self, BoxReader, BoxWriter, Transport, TransportKind};
use crate::session::{SessionConfig, SessionId, SessionIdGuard, SessionIdPool, keep_alive};

/// Called once per failed read or write with the half it happened on.
pub type ErrorCallback = Arc<dyn Fn(SessionId, Direction, &SessionError) + Send + Sync>;

/// Called once per queued packet with the body bytes it carried, or the
/// reason it was not sent.
pub type SendCompletion = Arc<dyn Fn(SessionId, Result<usize, &SessionError>) + Send + Sync>;

type PacketReader = FramedRead<BoxReader, PacketDecoder>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unconnected = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connected,
            2 => SessionState::Closing,
            3 => SessionState::Closed,
            _ => SessionState::Unconnected,
        }
    }

    #[inline]
    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

/// One live or reconnecting connection.
///
/// `Session` is a cheap handle; clones share the transport, the send queue
/// and the id. The id goes back to its pool once the last handle is gone.
///
/// Reads go through a [`PacketDecoder`] and are serialized. Writes come in
/// two flavours: [`Session::send`] awaits every packet, while
/// [`Session::async_send`] only enqueues and lets a single drain task write
/// the queue in FIFO order.
///
/// A failed read closes the read half. A failed write closes the write half
/// and releases every queued packet. Both report through the error callback.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct Outbound {
    packet: Packet,
    completion: SendCompletion,
}

#[derive(Debug, Default, Clone, Copy)]
struct Endpoints {
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    /// Where keep-alive reconnects go
    remote: Option<SocketAddr>,
}

pub(crate) struct SessionInner {
    id: SessionIdGuard,
    kind: TransportKind,
    config: SessionConfig,
    allocator: SharedAllocator,
    state: AtomicU8,
    read_open: AtomicBool,
    write_open: AtomicBool,
    endpoints: Mutex<Endpoints>,
    reader: AsyncMutex<Option<PacketReader>>,
    writer: AsyncMutex<Option<PacketWriter<BoxWriter>>>,
    queue: Mutex<VecDeque<Outbound>>,
    writing: AtomicBool,
    on_error: RwLock<Option<ErrorCallback>>,
    shutdown: CancellationToken,
    supervised: AtomicBool,
}

impl Session {
    /// Creates an unconnected session holding a fresh id.
    pub fn new(
        kind: TransportKind,
        config: SessionConfig,
        ids: &Arc<SessionIdPool>,
        allocator: SharedAllocator,
    ) -> Result<Self, SessionError> {
        let id = ids.acquire()?;
        Ok(Self { inner: Arc::new(SessionInner::new(id, kind, config, allocator)) })
    }

    /// Creates a session and connects it to `peer`.
    pub async fn connect(
        kind: TransportKind,
        peer: SocketAddr,
        config: SessionConfig,
        ids: &Arc<SessionIdPool>,
        allocator: SharedAllocator,
    ) -> Result<Self, SessionError> {
        let session = Self::new(kind, config, ids, allocator)?;
        session.open(peer).await?;
        Ok(session)
    }

    /// Wraps a transport that is already connected, typically an accepted stream.
    pub fn from_transport(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        ids: &Arc<SessionIdPool>,
        allocator: SharedAllocator,
    ) -> Result<Self, SessionError> {
        let id = ids.acquire()?;
        let mut inner = SessionInner::new(id, transport.kind(), config, allocator);
        let (reader, writer, endpoints) = inner.split(transport);
        *inner.reader.get_mut() = Some(reader);
        *inner.writer.get_mut() = Some(writer);
        *inner.endpoints.get_mut().unwrap_or_else(PoisonError::into_inner) = endpoints;
        inner.mark_connected();
        info!(id = inner.id(), kind = %inner.kind, peer = ?endpoints.peer, "session attached");
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Connects to `peer`. With keep-alive enabled a supervisor keeps
    /// re-attempting the connection whenever the session is not connected,
    /// also when this first attempt fails.
    pub async fn open(&self, peer: SocketAddr) -> Result<(), SessionError> {
        ensure!(!self.state().is_closing(), SessionError::NotConnected(self.id()));

        self.inner.endpoints.lock().unwrap_or_else(PoisonError::into_inner).remote = Some(peer);
        if self.inner.config.keep_alive() {
            keep_alive::spawn(&self.inner);
        }

        let transport = match transport::connect(self.inner.kind, peer, self.inner.config.reuse_addr()).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(id = self.id(), %peer, cause = %e, "failed to open session");
                return Err(SessionError::io(e));
            }
        };
        self.inner.attach(transport).await;
        Ok(())
    }

    /// Sends `bytes`, split into packets of at most the codec's body limit,
    /// and waits until every packet is written.
    ///
    /// On failure the error is [`SessionError::Partial`] carrying the number
    /// of body bytes already sent.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize, SessionError> {
        let codec = self.inner.config.codec();
        let mut slot = self.inner.writer.lock().await;
        let mut sent = 0;

        for piece in bytes.chunks(codec.max_body_len().max(1)) {
            let Some(writer) = slot.as_mut() else {
                return Err(SessionError::partial(sent, self.inner.write_closed_error()));
            };
            let packet = match codec.encode_packet(piece, &self.inner.allocator) {
                Ok(packet) => packet,
                Err(e) => return Err(SessionError::partial(sent, e.into())),
            };

            let result = self.inner.guarded(writer.write(&packet)).await;
            drop(packet);
            match result {
                Ok(len) => sent += len,
                Err(e) => {
                    self.inner.fail_write(&mut slot, &e).await;
                    return Err(SessionError::partial(sent, e));
                }
            }
        }

        trace!(id = self.id(), sent, "sent packets");
        Ok(sent)
    }

    /// Encodes `bytes` into packets, appends them to the send queue and
    /// starts a drain unless one is running. Returns the number of queued packets.
    ///
    /// Every packet is encoded before anything is queued, so an encoding
    /// failure leaves the queue untouched.
    pub fn async_send<F>(&self, bytes: &[u8], completion: F) -> Result<usize, SessionError>
    where
        F: Fn(SessionId, Result<usize, &SessionError>) + Send + Sync + 'static,
    {
        ensure!(self.inner.write_open.load(Ordering::Acquire), self.inner.write_closed_error());

        let codec = self.inner.config.codec();
        let packets = bytes
            .chunks(codec.max_body_len().max(1))
            .map(|piece| codec.encode_packet(piece, &self.inner.allocator))
            .collect::<Result<Vec<_>, _>>()?;

        let count = packets.len();
        let completion: SendCompletion = Arc::new(completion);
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(packets.into_iter().map(|packet| Outbound { packet, completion: Arc::clone(&completion) }));

        SessionInner::schedule_drain(&self.inner);
        Ok(count)
    }

    /// Reads one packet. A clean close by the peer is [`SessionError::Eof`].
    pub async fn receive(&self) -> Result<Packet, SessionError> {
        let mut slot = self.inner.reader.lock().await;
        let Some(reader) = slot.as_mut() else {
            return Err(self.inner.read_closed_error());
        };

        let result = self
            .inner
            .guarded(async {
                match reader.next().await {
                    Some(Ok(packet)) => Ok(packet),
                    Some(Err(e)) => Err(SessionError::from(e)),
                    None => Err(SessionError::Eof),
                }
            })
            .await;

        if let Err(e) = &result {
            self.inner.fail_read(&mut slot, e);
        }
        result
    }

    /// Spawns one [`Session::receive`] and hands the outcome to `completion`.
    pub fn async_receive<F>(&self, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(SessionId, Result<Packet, SessionError>) + Send + 'static,
    {
        let session = self.clone();
        tokio::spawn(async move {
            let result = session.receive().await;
            completion(session.id(), result);
        })
    }

    /// Stops the keep-alive supervisor, releases the send queue and shuts the
    /// transport down. Pending reads and writes end with `NotConnected`.
    pub async fn close(&self) {
        let claimed = self.inner.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
            (!SessionState::from_u8(state).is_closing()).then_some(SessionState::Closing as u8)
        });
        if claimed.is_err() {
            return;
        }

        self.inner.shutdown.cancel();
        let dropped = self.inner.release_queue(&SessionError::NotConnected(self.id()));

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(id = self.id(), cause = %e, "shutdown after close failed");
            }
        }
        self.inner.reader.lock().await.take();

        self.inner.read_open.store(false, Ordering::Release);
        self.inner.write_open.store(false, Ordering::Release);
        self.inner.state.store(SessionState::Closed as u8, Ordering::Release);
        info!(id = self.id(), dropped, "session closed");
    }

    /// Registers the callback for read and write failures, replacing the previous one.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(SessionId, Direction, &SessionError) + Send + Sync + 'static,
    {
        *self.inner.on_error.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.inner.id()
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn allocator(&self) -> &SharedAllocator {
        &self.inner.allocator
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn is_read_open(&self) -> bool {
        self.inner.read_open.load(Ordering::Acquire)
    }

    pub fn is_write_open(&self) -> bool {
        self.inner.write_open.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().unwrap_or_else(PoisonError::into_inner).local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().unwrap_or_else(PoisonError::into_inner).peer
    }

    /// Packets waiting in the send queue.
    pub fn pending_sends(&self) -> usize {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn new(id: SessionIdGuard, kind: TransportKind, config: SessionConfig, allocator: SharedAllocator) -> Self {
        Self {
            id,
            kind,
            config,
            allocator,
            state: AtomicU8::new(SessionState::Unconnected as u8),
            read_open: AtomicBool::new(false),
            write_open: AtomicBool::new(false),
            endpoints: Mutex::new(Endpoints::default()),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            writing: AtomicBool::new(false),
            on_error: RwLock::new(None),
            shutdown: CancellationToken::new(),
            supervised: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(super) fn id(&self) -> SessionId {
        self.id.id()
    }

    pub(super) fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(super) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(super) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(super) fn remote(&self) -> Option<SocketAddr> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner).remote
    }

    pub(super) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns `true` for the first caller only.
    pub(super) fn claim_supervisor(&self) -> bool {
        !self.supervised.swap(true, Ordering::AcqRel)
    }

    fn split(&self, transport: Box<dyn Transport>) -> (PacketReader, PacketWriter<BoxWriter>, Endpoints) {
        let endpoints = Endpoints {
            local: transport.local_addr().ok(),
            peer: transport.peer_addr().ok(),
            remote: self.endpoints.lock().unwrap_or_else(PoisonError::into_inner).remote,
        };
        let (reader, writer) = transport.into_split();
        let decoder = PacketDecoder::new(self.config.codec(), self.allocator.clone());
        let reader = FramedRead::with_capacity(reader, decoder, self.config.read_capacity());
        (reader, PacketWriter::new(writer), endpoints)
    }

    /// Installs a freshly connected transport, replacing any previous halves.
    pub(super) async fn attach(&self, transport: Box<dyn Transport>) {
        let kind = transport.kind();
        let (reader, writer, endpoints) = self.split(transport);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        *self.endpoints.lock().unwrap_or_else(PoisonError::into_inner) = endpoints;
        self.mark_connected();
        info!(id = self.id(), %kind, peer = ?endpoints.peer, local = ?endpoints.local, "session connected");
    }

    fn mark_connected(&self) {
        self.read_open.store(true, Ordering::Release);
        self.write_open.store(true, Ordering::Release);
        let _ = self.state.compare_exchange(
            SessionState::Unconnected as u8,
            SessionState::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Applies the per-operation timeout and aborts when the session closes.
    async fn guarded<T>(&self, operation: impl Future<Output = Result<T, SessionError>>) -> Result<T, SessionError> {
        let limited = with_timeout(self.config.timeout(), operation);
        tokio::select! {
            result = limited => result,
            () = self.shutdown.cancelled() => Err(SessionError::NotConnected(self.id())),
        }
    }

    fn read_closed_error(&self) -> SessionError {
        match self.state() {
            SessionState::Connected => SessionError::HalfClosed(Direction::Read),
            _ => SessionError::NotConnected(self.id()),
        }
    }

    fn write_closed_error(&self) -> SessionError {
        match self.state() {
            SessionState::Connected => SessionError::HalfClosed(Direction::Write),
            _ => SessionError::NotConnected(self.id()),
        }
    }

    fn fail_read(&self, slot: &mut Option<PacketReader>, error: &SessionError) {
        if self.state().is_closing() {
            return;
        }

        slot.take();
        self.read_open.store(false, Ordering::Release);
        if error.is_eof() {
            info!(id = self.id(), "peer closed the session");
        } else {
            error!(id = self.id(), cause = %error, "session read failed, read half closed");
        }
        self.notify(Direction::Read, error);
        self.after_half_close();
    }

    async fn fail_write(&self, slot: &mut Option<PacketWriter<BoxWriter>>, error: &SessionError) {
        if self.state().is_closing() {
            return;
        }

        if let Some(mut writer) = slot.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(id = self.id(), cause = %e, "shutdown after write error failed");
            }
        }
        self.write_open.store(false, Ordering::Release);
        let dropped = self.release_queue(&SessionError::HalfClosed(Direction::Write));
        error!(id = self.id(), cause = %error, dropped, "session write failed, send queue released");
        self.notify(Direction::Write, error);
        self.after_half_close();
    }

    /// With both halves gone the session is unconnected again.
    fn after_half_close(&self) {
        if self.read_open.load(Ordering::Acquire) || self.write_open.load(Ordering::Acquire) {
            return;
        }
        if self
            .state
            .compare_exchange(
                SessionState::Connected as u8,
                SessionState::Unconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(id = self.id(), "session disconnected");
        }
    }

    fn notify(&self, direction: Direction, error: &SessionError) {
        let callback = self.on_error.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback(self.id(), direction, error);
        }
    }

    /// Drops every queued packet, telling each completion why.
    fn release_queue(&self, reason: &SessionError) -> usize {
        let dropped = std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        let count = dropped.len();
        for outbound in dropped {
            drop(outbound.packet);
            (outbound.completion)(self.id(), Err(reason));
        }
        count
    }

    fn schedule_drain(this: &Arc<Self>) {
        if this.writing.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(this);
        tokio::spawn(async move { inner.drain().await });
    }

    /// Writes queued packets one at a time until the queue is empty.
    async fn drain(&self) {
        loop {
            let next = self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            let Some(Outbound { packet, completion }) = next else {
                self.writing.store(false, Ordering::Release);
                // an enqueue between the pop and the store saw the flag still set
                let pending = !self.queue.lock().unwrap_or_else(PoisonError::into_inner).is_empty();
                if pending && !self.writing.swap(true, Ordering::AcqRel) {
                    continue;
                }
                return;
            };

            let mut slot = self.writer.lock().await;
            let result = match slot.as_mut() {
                Some(writer) => self.guarded(writer.write(&packet)).await,
                None => Err(self.write_closed_error()),
            };
            drop(packet);

            match result {
                Ok(sent) => completion(self.id(), Ok(sent)),
                Err(e) => {
                    completion(self.id(), Err(&e));
                    if slot.is_some() {
                        self.fail_write(&mut slot, &e).await;
                    } else {
                        self.release_queue(&e);
                    }
                }
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        trace!(id = self.id(), "session released");
    }
}

pub(super) async fn with_timeout<T>(
    limit: Option<Duration>,
    operation: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    match limit {
        None => operation.await,
        Some(limit) => tokio::time::timeout(limit, operation).await.unwrap_or(Err(SessionError::Timeout(limit))),
    }
}
