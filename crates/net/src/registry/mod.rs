//! Session id to connection state tracking with pluggable eviction.
//!
//! ```
//! use micro_net::registry::{ConnState, ConnectionRegistry, IdleEviction, RegistryConfig, StrategyTrigger};
//!
//! let registry = ConnectionRegistry::new(RegistryConfig::new().with_max_connections(4).with_reserve(1));
//! registry.add_strategy("idle", StrategyTrigger::OnPressure, IdleEviction);
//!
//! registry.update_state(1, ConnState::Active);
//! registry.update_state(2, ConnState::Idle);
//! // the third entry reaches the high-water mark, the idle one goes
//! let removed = registry.update_state(3, ConnState::Active);
//! assert_eq!(removed, vec![2]);
//! assert_eq!(registry.len(), 2);
//! ```

mod connection_registry;
mod strategy;

pub use connection_registry::ConnectionRegistry;
pub use connection_registry::DEFAULT_RESERVE;
pub use connection_registry::DEFAULT_TIMER_INTERVAL;
pub use connection_registry::RegistryConfig;
pub use strategy::ConnState;
pub use strategy::EvictionStrategy;
pub use strategy::IdleEviction;
pub use strategy::StrategyFn;
pub use strategy::StrategyTrigger;
pub use strategy::make_strategy;
