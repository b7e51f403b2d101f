//! Shared protocol constants and the error taxonomy.
//!
//! Every layer of the crate reports failures through the enums re-exported
//! here:
//!
//! - [`AllocError`]: buffer allocator failures, including a typed out-of-memory
//! - [`CodecError`]: framing-level malformed input (`BadData`, `BadHead`, `BadBody`)
//! - [`SessionError`]: per-operation socket failures, `Eof` kept distinct from `Io`
//! - [`TransferError`]: http exchange failures, including `Md5Mismatch`
//!
//! The byte codes below are the values returned by [`SessionError::code`] and
//! handed to session completion callbacks.

mod error;
pub use error::AllocError;
pub use error::CodecError;
pub use error::Direction;
pub use error::SessionError;
pub use error::TransferError;

/// Largest packet (header plus body) a session writes in one piece.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Default read buffer size of a tcp session.
pub const PACKET_SIZE_TCP: usize = 1024;

/// Default read buffer size of a udp session.
pub const PACKET_SIZE_UDP: usize = 1024;

/// Largest number of bytes a single unheadered read may deliver.
pub const MAX_RECV_SIZE: usize = 65535;

/// Upper bound of simultaneously tracked connections.
pub const MAX_CONNECTION: usize = 65536;

/// Size of the session id pool.
pub const MAX_CONN_NUM: usize = 65536;

pub const NO_ERR: u8 = 0x00;
pub const NET_EOF: u8 = 0x01;
pub const NET_OTHER: u8 = 0x02;
pub const NET_BAD_DATA: u8 = 0x10;
pub const NET_BAD_HEAD: u8 = 0x11;
pub const NET_BAD_BODY: u8 = 0x12;
