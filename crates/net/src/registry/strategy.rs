use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::session::SessionId;

/// Tracked state of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Received data recently
    Active,
    /// Finished an exchange and waits for the next one
    Idle,
    /// Gone; updating to this state removes the entry
    Closed,
}

/// When a strategy runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyTrigger {
    /// On every state update while the registry sits at its high-water mark
    OnPressure,
    /// On every tick of the registry timer, whatever the occupancy
    OnTimer,
}

/// Mutates the registry's state map. Every id a strategy removes has its
/// session closed afterwards.
///
/// Strategies run while the registry holds its state lock, so they must not
/// call back into the registry.
pub trait EvictionStrategy: Send + Sync {
    fn apply(&self, states: &mut HashMap<SessionId, ConnState>);
}

#[derive(Debug)]
pub struct StrategyFn<F> {
    f: F,
}

impl<F> EvictionStrategy for StrategyFn<F>
where
    F: Fn(&mut HashMap<SessionId, ConnState>) + Send + Sync,
{
    fn apply(&self, states: &mut HashMap<SessionId, ConnState>) {
        (self.f)(states);
    }
}

pub fn make_strategy<F>(f: F) -> StrategyFn<F>
where
    F: Fn(&mut HashMap<SessionId, ConnState>) + Send + Sync,
{
    StrategyFn { f }
}

/// Drops every entry that is not `Active`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleEviction;

impl EvictionStrategy for IdleEviction {
    fn apply(&self, states: &mut HashMap<SessionId, ConnState>) {
        let before = states.len();
        states.retain(|_, state| *state == ConnState::Active);
        debug!(evicted = before - states.len(), remaining = states.len(), "evicted idle connections");
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Active => f.write_str("active"),
            ConnState::Idle => f.write_str("idle"),
            ConnState::Closed => f.write_str("closed"),
        }
    }
}
