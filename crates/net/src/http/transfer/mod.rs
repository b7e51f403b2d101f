//! Http exchanges on top of [`Session`]s.
//!
//! The [`HttpTransferManager`] keeps, per session id, the bytes a read
//! delivered past the end of a message together with the parser working on
//! them. The next read on the same id continues from there, so messages
//! split across packets work. Several messages in one packet work when each
//! one but the last is self-delimiting (chunked, or without a body); bytes
//! past a `Content-Length` body make the read fail as malformed.
//!
//! - client side: [`create_request`](HttpTransferManager::create_request),
//!   [`send_request`](HttpTransferManager::send_request),
//!   [`receive_response`](HttpTransferManager::receive_response),
//!   [`round_trip`](HttpTransferManager::round_trip)
//! - chunk files: [`send_chunk_file`](HttpTransferManager::send_chunk_file),
//!   [`recv_chunk_file`](HttpTransferManager::recv_chunk_file)
//! - server side: [`on_request`](HttpTransferManager::on_request),
//!   [`serve`](HttpTransferManager::serve) and the [`HttpServer`] accept loop

mod chunk_file;
mod exchange;
mod serve;

pub use chunk_file::ChunkFileReport;
pub use serve::HttpServer;
pub use serve::IDLE_STRATEGY;

use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{trace, warn};

use crate::codec::ChunkFileEncoder;
use crate::handler::RequestHandler;
use crate::http::hsm::{HttpParser, Outcome, ParseTarget};
use crate::http::parser_pool::{CLIENT_PARSER_POOL, ParserPool, SERVER_PARSER_POOL};
use crate::http::{HttpRequest, HttpResponse};
use crate::protocol::TransferError;
use crate::registry::{ConnState, ConnectionRegistry};
use crate::session::{Session, SessionId};

/// Unconsumed bytes of one session and the parser that owns their state.
struct Remainder<T> {
    bytes: BytesMut,
    parser: HttpParser<T>,
}

pub struct HttpTransferManager {
    responses: Mutex<HashMap<SessionId, Remainder<HttpResponse>>>,
    requests: Mutex<HashMap<SessionId, Remainder<HttpRequest>>>,
    response_parsers: ParserPool<HttpResponse>,
    request_parsers: ParserPool<HttpRequest>,
    uploads: Mutex<HashMap<SessionId, ChunkFileEncoder>>,
    downloads: Mutex<HashMap<SessionId, BytesMut>>,
    routes: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    registry: Option<ConnectionRegistry>,
}

impl HttpTransferManager {
    pub fn new(parser_pool_size: usize) -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            response_parsers: ParserPool::new(parser_pool_size),
            request_parsers: ParserPool::new(parser_pool_size),
            uploads: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            registry: None,
        }
    }

    /// A manager sized for the sending side.
    pub fn client() -> Self {
        Self::new(CLIENT_PARSER_POOL)
    }

    /// A manager sized for the serving side.
    pub fn server() -> Self {
        Self::new(SERVER_PARSER_POOL)
    }

    /// Reports connection activity to `registry`: a received packet marks the
    /// session active, a finished keep-alive exchange idle, the end of
    /// [`serve`](Self::serve) closed.
    pub fn with_registry(mut self, registry: ConnectionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn registry(&self) -> Option<&ConnectionRegistry> {
        self.registry.as_ref()
    }

    /// Drops every buffered byte and unfinished transfer of `id`.
    pub fn forget(&self, id: SessionId) {
        if let Some(remainder) = lock(&self.responses).remove(&id) {
            self.response_parsers.put(remainder.parser);
        }
        if let Some(remainder) = lock(&self.requests).remove(&id) {
            self.request_parsers.put(remainder.parser);
        }
        lock(&self.uploads).remove(&id);
        lock(&self.downloads).remove(&id);
        trace!(id, "forgot transfer state");
    }

    /// Bytes buffered for `id` past the last complete message.
    pub fn remainder_len(&self, id: SessionId) -> usize {
        let responses = lock(&self.responses).get(&id).map_or(0, |r| r.bytes.len());
        let requests = lock(&self.requests).get(&id).map_or(0, |r| r.bytes.len());
        let downloads = lock(&self.downloads).get(&id).map_or(0, BytesMut::len);
        responses + requests + downloads
    }

    fn mark(&self, id: SessionId, state: ConnState) {
        if let Some(registry) = &self.registry {
            registry.update_state(id, state);
        }
    }

    /// Reads from `session` until one complete message is parsed. Bytes that
    /// follow the message stay buffered for the next call on the same id.
    async fn read_message<T: ParseTarget>(
        &self,
        session: &Session,
        slots: &Mutex<HashMap<SessionId, Remainder<T>>>,
        pool: &ParserPool<T>,
    ) -> Result<T, TransferError> {
        let id = session.id();
        let buffered = lock(slots).remove(&id);
        let mut slot = buffered.unwrap_or_else(|| Remainder { bytes: BytesMut::new(), parser: pool.get() });

        loop {
            if !slot.bytes.is_empty() {
                let result = slot.parser.parse(&slot.bytes);
                slot.bytes.advance(result.consumed);
                match result.outcome {
                    Outcome::Indeterminate => {}
                    Outcome::Good | Outcome::GoodWithLeftoverChunks => {
                        let message = slot.parser.take_result();
                        if slot.bytes.is_empty() {
                            pool.put(slot.parser);
                        } else {
                            trace!(id, leftover = slot.bytes.len(), "keep bytes of the next message");
                            lock(slots).insert(id, slot);
                        }
                        return Ok(message);
                    }
                    Outcome::Bad | Outcome::ParseError => {
                        warn!(id, outcome = %result.outcome, "malformed http message");
                        pool.put(slot.parser);
                        return Err(TransferError::Malformed(result.outcome));
                    }
                }
            }

            match session.receive().await {
                Ok(packet) => {
                    self.mark(id, ConnState::Active);
                    slot.bytes.extend_from_slice(packet.body());
                }
                Err(e) => {
                    pool.put(slot.parser);
                    return Err(e.into());
                }
            }
        }
    }
}

impl fmt::Debug for HttpTransferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransferManager")
            .field("parser_pool", &self.request_parsers.capacity())
            .field("routes", &read(&self.routes).keys().collect::<Vec<_>>())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}
