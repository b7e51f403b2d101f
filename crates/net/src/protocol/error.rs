use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::http::Outcome;
use crate::protocol::{NET_BAD_BODY, NET_BAD_DATA, NET_BAD_HEAD, NET_EOF, NET_OTHER};
use crate::session::SessionId;

/// Failures of the size-class buffer allocator.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("no size class can hold {requested} bytes, the largest class is {largest}")]
    NoSizeClass { requested: usize, largest: usize },

    #[error("out of memory while expanding the {capacity} byte class by {batch} buffers")]
    OutOfMemory { capacity: usize, batch: usize },

    #[error("length {len} exceeds the buffer capacity {capacity}")]
    LengthOverflow { len: usize, capacity: usize },
}

/// Framing-level malformed input, plus the io errors a `tokio_util` decoder must carry.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("bad data: {reason}")]
    BadData { reason: String },

    #[error("bad packet head: {reason}")]
    BadHead { reason: String },

    #[error("bad packet body: {len} bytes exceed the limit {max_len}")]
    BadBody { len: usize, max_len: usize },

    #[error("alloc error: {source}")]
    Alloc {
        #[from]
        source: AllocError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl CodecError {
    pub fn bad_data<S: ToString>(str: S) -> Self {
        Self::BadData { reason: str.to_string() }
    }

    pub fn bad_head<S: ToString>(str: S) -> Self {
        Self::BadHead { reason: str.to_string() }
    }

    pub fn bad_body(len: usize, max_len: usize) -> Self {
        Self::BadBody { len, max_len }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Which half of a session an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection closed by peer")]
    Eof,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("codec error: {source}")]
    Codec {
        #[from]
        source: CodecError,
    },

    #[error("alloc error: {source}")]
    Alloc {
        #[from]
        source: AllocError,
    },

    #[error("sent {sent} bytes before failing: {source}")]
    Partial {
        sent: usize,
        #[source]
        source: Box<SessionError>,
    },

    #[error("session {0} is not connected")]
    NotConnected(SessionId),

    #[error("the {0} half of the session is closed")]
    HalfClosed(Direction),

    #[error("session id pool exhausted, capacity {capacity}")]
    IdsExhausted { capacity: usize },
}

impl SessionError {
    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    pub fn partial(sent: usize, source: SessionError) -> Self {
        Self::Partial { sent, source: Box::new(source) }
    }

    /// Byte error code carried on the wire-facing callbacks.
    pub fn code(&self) -> u8 {
        match self {
            SessionError::Eof => NET_EOF,
            SessionError::Codec { source } => match source {
                CodecError::BadHead { .. } => NET_BAD_HEAD,
                CodecError::BadBody { .. } => NET_BAD_BODY,
                CodecError::BadData { .. } => NET_BAD_DATA,
                CodecError::Alloc { .. } | CodecError::Io { .. } => NET_OTHER,
            },
            SessionError::Partial { source, .. } => source.code(),
            _ => NET_OTHER,
        }
    }

    /// Whether the peer closed the connection cleanly.
    pub fn is_eof(&self) -> bool {
        match self {
            SessionError::Eof => true,
            SessionError::Partial { source, .. } => source.is_eof(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("session error: {source}")]
    Session {
        #[from]
        source: SessionError,
    },

    #[error("malformed http message, parser outcome {0:?}")]
    Malformed(Outcome),

    #[error("malformed chunk stream: {source}")]
    Chunk {
        #[from]
        source: CodecError,
    },

    #[error("content-md5 mismatch, expected {expected}, computed {computed}")]
    Md5Mismatch { expected: String, computed: String },

    #[error("missing content-md5 trailer")]
    MissingTrailer,

    #[error("invalid request line: {0}")]
    InvalidRequestLine(String),
}

impl TransferError {
    pub fn md5_mismatch<E: ToString, C: ToString>(expected: E, computed: C) -> Self {
        Self::Md5Mismatch { expected: expected.to_string(), computed: computed.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SessionError::Eof.code(), NET_EOF);
        assert_eq!(SessionError::from(CodecError::bad_head("x")).code(), NET_BAD_HEAD);
        assert_eq!(SessionError::from(CodecError::bad_body(30, 16)).code(), NET_BAD_BODY);
        assert_eq!(SessionError::from(CodecError::bad_data("x")).code(), NET_BAD_DATA);
        assert_eq!(SessionError::io(io::Error::other("boom")).code(), NET_OTHER);
        assert_eq!(SessionError::Timeout(Duration::from_secs(1)).code(), NET_OTHER);
    }

    #[test]
    fn test_partial_keeps_cause() {
        let error = SessionError::partial(1024, SessionError::Eof);
        assert!(error.is_eof());
        assert_eq!(error.code(), NET_EOF);
        assert!(error.to_string().starts_with("sent 1024 bytes"));
    }
}
