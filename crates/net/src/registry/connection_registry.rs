use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::Packet;
use crate::protocol::{MAX_CONNECTION, SessionError};
use crate::registry::{ConnState, EvictionStrategy, StrategyTrigger};
use crate::session::{Session, SessionId};

/// Connections kept free below [`MAX_CONNECTION`] before strategies kick in.
pub const DEFAULT_RESERVE: usize = 512;

pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    max_connections: usize,
    reserve: usize,
    interval: Duration,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self { max_connections: MAX_CONNECTION, reserve: DEFAULT_RESERVE, interval: DEFAULT_TIMER_INTERVAL }
    }

    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub fn with_reserve(mut self, reserve: usize) -> Self {
        self.reserve = reserve;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Tracked connections at which on-pressure strategies run.
    pub fn high_water_mark(&self) -> usize {
        self.max_connections.saturating_sub(self.reserve)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps session ids to sessions and to their [`ConnState`].
///
/// Every state update that leaves the registry at or above its high-water
/// mark runs each on-pressure strategy once over the whole map. A timer
/// started by [`ConnectionRegistry::run`] runs the on-timer strategies.
/// Whenever an id disappears from the map its session is closed.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    states: Mutex<HashMap<SessionId, ConnState>>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    strategies: RwLock<Vec<NamedStrategy>>,
    timer: Mutex<Option<CancellationToken>>,
}

struct NamedStrategy {
    name: String,
    trigger: StrategyTrigger,
    strategy: Arc<dyn EvictionStrategy>,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                states: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                strategies: RwLock::new(Vec::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Registers a strategy under `name`, replacing one with the same name
    /// and trigger.
    pub fn add_strategy<S>(&self, name: impl Into<String>, trigger: StrategyTrigger, strategy: S)
    where
        S: EvictionStrategy + 'static,
    {
        let name = name.into();
        let mut strategies = self.inner.strategies.write().unwrap_or_else(PoisonError::into_inner);
        strategies.retain(|named| !(named.name == name && named.trigger == trigger));
        debug!(name, ?trigger, "registered strategy");
        strategies.push(NamedStrategy { name, trigger, strategy: Arc::new(strategy) });
    }

    /// Removes every strategy registered under `name`.
    pub fn remove_strategy(&self, name: &str) -> bool {
        let mut strategies = self.inner.strategies.write().unwrap_or_else(PoisonError::into_inner);
        let before = strategies.len();
        strategies.retain(|named| named.name != name);
        strategies.len() != before
    }

    /// Inserts, updates or (for [`ConnState::Closed`]) removes the entry of `id`.
    ///
    /// Returns the ids that left the registry because of this update,
    /// `id` itself included when it was closed.
    pub fn update_state(&self, id: SessionId, state: ConnState) -> Vec<SessionId> {
        self.inner.update_state(id, state)
    }

    /// Runs the on-timer strategies once, as a timer tick would.
    pub fn tick(&self) -> Vec<SessionId> {
        self.inner.apply(StrategyTrigger::OnTimer)
    }

    /// Starts the periodic task running the on-timer strategies. Calling it
    /// again while running does nothing.
    pub fn run(&self) {
        let mut timer = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *timer = Some(token.clone());
        let interval = self.inner.config.interval;
        info!(?interval, "start registry timer");
        tokio::spawn(tick_loop(Arc::downgrade(&self.inner), token, interval));
    }

    /// Cancels the timer, forgets every entry and closes every registered session.
    pub async fn stop(&self) {
        if let Some(token) = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
        self.inner.states.lock().unwrap_or_else(PoisonError::into_inner).clear();
        let sessions = std::mem::take(&mut *self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner));

        info!(sessions = sessions.len(), "stop registry");
        for session in sessions.into_values() {
            session.close().await;
        }
    }

    /// Tracks `session` as `Active`.
    pub fn register(&self, session: Session) -> SessionId {
        let id = session.id();
        self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner).insert(id, session);
        self.update_state(id, ConnState::Active);
        id
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    pub fn state(&self, id: SessionId) -> Option<ConnState> {
        self.inner.states.lock().unwrap_or_else(PoisonError::into_inner).get(&id).copied()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.inner.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends through the session registered under `id`. A failure marks it closed.
    pub async fn send(&self, id: SessionId, bytes: &[u8]) -> Result<usize, SessionError> {
        let session = self.session(id).ok_or(SessionError::NotConnected(id))?;
        let result = session.send(bytes).await;
        if result.is_err() {
            self.update_state(id, ConnState::Closed);
        }
        result
    }

    /// Receives one packet from the session registered under `id`. Success
    /// marks it active, a failure marks it closed.
    pub async fn receive(&self, id: SessionId) -> Result<Packet, SessionError> {
        let session = self.session(id).ok_or(SessionError::NotConnected(id))?;
        let result = session.receive().await;
        let state = if result.is_ok() { ConnState::Active } else { ConnState::Closed };
        self.update_state(id, state);
        result
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("config", &self.inner.config)
            .field("tracked", &self.len())
            .finish_non_exhaustive()
    }
}

impl RegistryInner {
    fn update_state(&self, id: SessionId, state: ConnState) -> Vec<SessionId> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        if state == ConnState::Closed {
            if states.remove(&id).is_some() || self.is_registered(id) {
                removed.push(id);
            }
        } else {
            states.insert(id, state);
        }
        trace!(id, %state, tracked = states.len(), "updated connection state");

        let high_water_mark = self.config.high_water_mark();
        if states.len() >= high_water_mark {
            debug!(tracked = states.len(), high_water_mark, "registry under pressure");
            removed.extend(self.run_strategies(&mut states, StrategyTrigger::OnPressure));
        }
        drop(states);

        self.close_removed(&removed);
        removed
    }

    fn apply(&self, trigger: StrategyTrigger) -> Vec<SessionId> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self.run_strategies(&mut states, trigger);
        drop(states);

        self.close_removed(&removed);
        removed
    }

    /// Runs the strategies with `trigger` in registration order and returns
    /// the ids they removed.
    fn run_strategies(&self, states: &mut HashMap<SessionId, ConnState>, trigger: StrategyTrigger) -> Vec<SessionId> {
        let strategies = self.strategies.read().unwrap_or_else(PoisonError::into_inner);
        let before = states.keys().copied().collect::<Vec<_>>();
        for named in strategies.iter().filter(|named| named.trigger == trigger) {
            trace!(name = named.name, ?trigger, "running strategy");
            named.strategy.apply(states);
        }
        before.into_iter().filter(|id| !states.contains_key(id)).collect()
    }

    fn is_registered(&self, id: SessionId) -> bool {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&id)
    }

    /// Forgets the sessions of `removed` and closes them in the background.
    fn close_removed(&self, removed: &[SessionId]) {
        if removed.is_empty() {
            return;
        }

        let closing = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            removed.iter().filter_map(|id| sessions.remove(id)).collect::<Vec<_>>()
        };
        if closing.is_empty() {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!(sessions = closing.len(), "no runtime to close evicted sessions, dropping them");
            return;
        };
        for session in closing {
            debug!(id = session.id(), "closing evicted session");
            handle.spawn(async move { session.close().await });
        }
    }
}

async fn tick_loop(registry: Weak<RegistryInner>, token: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = registry.upgrade() else {
            break;
        };
        let removed = inner.apply(StrategyTrigger::OnTimer);
        trace!(removed = removed.len(), "registry timer tick");
    }
    info!("registry timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{SESSION_SIZE_CLASSES, SharedAllocator};
    use crate::codec::PacketCodec;
    use crate::registry::{IdleEviction, make_strategy};
    use crate::session::{Acceptor, SessionConfig, SessionIdPool, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_registry() -> ConnectionRegistry {
        ConnectionRegistry::new(RegistryConfig::new().with_max_connections(10).with_reserve(2))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl EvictionStrategy + 'static {
        let counter = Arc::clone(counter);
        make_strategy(move |_: &mut HashMap<SessionId, ConnState>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_update_state() {
        let registry = small_registry();
        registry.update_state(1, ConnState::Active);
        registry.update_state(2, ConnState::Active);
        registry.update_state(1, ConnState::Idle);
        assert_eq!(registry.state(1), Some(ConnState::Idle));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.update_state(2, ConnState::Closed), vec![2]);
        assert_eq!(registry.state(2), None);
        assert!(registry.update_state(42, ConnState::Closed).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_pressure_strategies_run_once_per_update() {
        let registry = small_registry();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.add_strategy("count", StrategyTrigger::OnPressure, counting(&counter));
        assert_eq!(registry.config().high_water_mark(), 8);

        for id in 1..8 {
            registry.update_state(id, ConnState::Active);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        registry.update_state(8, ConnState::Active);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        registry.update_state(3, ConnState::Idle);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        registry.update_state(3, ConnState::Closed);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_idle_eviction_at_high_water_mark() {
        let registry = small_registry();
        registry.add_strategy("idle", StrategyTrigger::OnPressure, IdleEviction);

        for id in 1..=7 {
            let state = if id % 2 == 0 { ConnState::Idle } else { ConnState::Active };
            registry.update_state(id, state);
        }
        assert_eq!(registry.len(), 7);

        let mut removed = registry.update_state(8, ConnState::Idle);
        removed.sort_unstable();
        assert_eq!(removed, vec![2, 4, 6, 8]);
        assert_eq!(registry.len(), 4);
        assert!((1..=7).step_by(2).all(|id| registry.state(id) == Some(ConnState::Active)));
    }

    #[test]
    fn test_strategies_by_name() {
        let registry = small_registry();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.add_strategy("count", StrategyTrigger::OnTimer, counting(&counter));
        registry.add_strategy("count", StrategyTrigger::OnTimer, counting(&counter));

        registry.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(registry.remove_strategy("count"));
        assert!(!registry.remove_strategy("count"));
        registry.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timer_runs_until_stopped() {
        let registry =
            ConnectionRegistry::new(RegistryConfig::new().with_interval(Duration::from_millis(10)));
        let counter = Arc::new(AtomicUsize::new(0));
        registry.add_strategy("count", StrategyTrigger::OnTimer, counting(&counter));
        registry.update_state(1, ConnState::Active);

        registry.run();
        registry.run();
        while counter.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        registry.stop().await;
        assert!(registry.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopped_at = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test]
    async fn test_dispatch_and_eviction_closes_session() {
        let ids = SessionIdPool::new(8);
        let allocator = SharedAllocator::new(&SESSION_SIZE_CLASSES);
        let config = SessionConfig::new().with_codec(PacketCodec::headered(4));
        let acceptor =
            Acceptor::bind("127.0.0.1:0".parse().unwrap(), config, Arc::clone(&ids), allocator.clone()).await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let (client, server) =
            tokio::join!(Session::connect(TransportKind::Tcp, addr, config, &ids, allocator), acceptor.accept());
        let (client, server) = (client.unwrap(), server.unwrap());

        let registry =
            ConnectionRegistry::new(RegistryConfig::new().with_max_connections(2).with_reserve(0));
        registry.add_strategy("idle", StrategyTrigger::OnPressure, IdleEviction);
        let client_id = registry.register(client.clone());
        let server_id = registry.register(server.clone());

        assert_eq!(registry.send(client_id, b"ping").await.unwrap(), 4);
        let packet = registry.receive(server_id).await.unwrap();
        assert_eq!(packet.body(), b"ping");
        assert_eq!(registry.state(server_id), Some(ConnState::Active));

        let removed = registry.update_state(server_id, ConnState::Idle);
        assert_eq!(removed, vec![server_id]);
        assert!(registry.session(server_id).is_none());

        assert!(matches!(registry.receive(client_id).await, Err(SessionError::Eof)));
        assert_eq!(registry.state(client_id), None);
        assert!(matches!(registry.send(client_id, b"x").await, Err(SessionError::NotConnected(_))));
    }
}
