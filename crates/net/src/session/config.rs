use std::time::Duration;

use crate::codec::PacketCodec;
use crate::protocol::PACKET_SIZE_TCP;

/// Interval between two reconnect attempts of a keep-alive session.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Per-session settings.
///
/// The defaults describe an unheadered session without timeout or
/// keep-alive, reading in [`PACKET_SIZE_TCP`] sized steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    codec: PacketCodec,
    timeout: Option<Duration>,
    keep_alive: bool,
    reconnect_interval: Duration,
    read_capacity: usize,
    reuse_addr: bool,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            codec: PacketCodec::unheadered(),
            timeout: None,
            keep_alive: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            read_capacity: PACKET_SIZE_TCP,
            reuse_addr: false,
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: PacketCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Bounds every read and every packet write. The expiry cancels that
    /// operation only.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    #[must_use]
    pub fn with_read_capacity(mut self, capacity: usize) -> Self {
        self.read_capacity = capacity;
        self
    }

    /// Sets `SO_REUSEADDR` before a tcp connect, a udp connect or a
    /// [`DatagramSession`](crate::session::DatagramSession) bind.
    #[must_use]
    pub fn with_reuse_addr(mut self, reuse: bool) -> Self {
        self.reuse_addr = reuse;
        self
    }

    pub fn codec(&self) -> PacketCodec {
        self.codec
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    pub fn read_capacity(&self) -> usize {
        self.read_capacity
    }

    pub fn reuse_addr(&self) -> bool {
        self.reuse_addr
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}
