use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::protocol::SessionError;

/// Identifier of a session, unique among the live sessions of one pool.
pub type SessionId = u32;

/// Bounded pool of session ids.
///
/// Ids `1..=capacity` are handed out in FIFO order, so a released id goes to
/// the back of the queue and is reused last.
#[derive(Debug)]
pub struct SessionIdPool {
    free: Mutex<VecDeque<SessionId>>,
    capacity: usize,
}

impl SessionIdPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let top = SessionId::try_from(capacity).unwrap_or(SessionId::MAX);
        let free = (1..=top).collect::<VecDeque<_>>();
        Arc::new(Self { capacity: free.len(), free: Mutex::new(free) })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Takes the next free id. The id comes back when the guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> Result<SessionIdGuard, SessionError> {
        let id = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or(SessionError::IdsExhausted { capacity: self.capacity })?;
        trace!(id, "acquired session id");
        Ok(SessionIdGuard { id, pool: Arc::clone(self) })
    }

    fn release(&self, id: SessionId) {
        trace!(id, "released session id");
        self.free.lock().unwrap_or_else(PoisonError::into_inner).push_back(id);
    }
}

/// A session id on loan from a [`SessionIdPool`].
pub struct SessionIdGuard {
    id: SessionId,
    pool: Arc<SessionIdPool>,
}

impl SessionIdGuard {
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionIdGuard {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl fmt::Debug for SessionIdGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionIdGuard").field(&self.id).finish()
    }
}
