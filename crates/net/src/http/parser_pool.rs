use std::sync::Mutex;
use tracing::trace;

use crate::http::hsm::{HttpParser, ParseTarget};

/// Idle parsers kept by a client side transfer manager.
pub const CLIENT_PARSER_POOL: usize = 16;

/// Idle parsers kept by a server side transfer manager.
pub const SERVER_PARSER_POOL: usize = 32;

/// A small free list of parsers. Parsers come out reset and go back reset;
/// past `capacity` idle parsers, returned ones are dropped.
#[derive(Debug)]
pub struct ParserPool<T> {
    idle: Mutex<Vec<HttpParser<T>>>,
    capacity: usize,
}

impl<T: ParseTarget> ParserPool<T> {
    /// Creates a pool pre-filled with `capacity` parsers.
    pub fn new(capacity: usize) -> Self {
        let idle = (0..capacity).map(|_| HttpParser::new()).collect();
        Self { idle: Mutex::new(idle), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().map_or(0, |idle| idle.len())
    }

    /// Takes an idle parser, or builds one when the pool is empty.
    pub fn get(&self) -> HttpParser<T> {
        let pooled = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        pooled.unwrap_or_else(|| {
            trace!("parser pool empty, creating a parser");
            HttpParser::new()
        })
    }

    pub fn put(&self, mut parser: HttpParser<T>) {
        parser.reset();
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < self.capacity
        {
            idle.push(parser);
        }
    }
}
