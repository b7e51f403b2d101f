use std::fmt;
use std::fmt::Write;

use md5::{Digest, Md5};

/// Streaming MD5 over the plaintext bytes of a chunked transfer.
#[derive(Clone, Default)]
pub struct Md5Stream {
    hasher: Md5,
    total: u64,
}

impl Md5Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.total += bytes.len() as u64;
    }

    /// Number of bytes hashed since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Lowercase hex digest of everything hashed so far; the stream starts over afterwards.
    pub fn finalize_hex(&mut self) -> String {
        let digest = self.hasher.finalize_reset();
        self.total = 0;
        to_hex(&digest)
    }

    pub fn reset(&mut self) {
        self.hasher.reset();
        self.total = 0;
    }
}

impl fmt::Debug for Md5Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Md5Stream").field("total", &self.total).finish_non_exhaustive()
    }
}

/// One-shot lowercase hex MD5.
pub fn md5_hex(bytes: &[u8]) -> String {
    to_hex(&Md5::digest(bytes))
}

fn to_hex(digest: &[u8]) -> String {
    digest.iter().fold(String::with_capacity(digest.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
