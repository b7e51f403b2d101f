//! Http/1.1 messages, the resumable parser and the transfer manager.
//!
//! [`RequestParser`] and [`ResponseParser`] accept a message in arbitrary
//! pieces. Each call reports how many bytes it consumed; the caller keeps
//! the rest and hands it back together with the next read.
//!
//! ```
//! use micro_net::http::{Outcome, RequestParser};
//!
//! let mut parser = RequestParser::new();
//! let first = parser.parse(b"GET /a HTTP/1.1\r\nHo");
//! assert_eq!(first.outcome, Outcome::Indeterminate);
//! assert_eq!(first.consumed, 17);
//!
//! let done = parser.parse(b"Host: x\r\n\r\n");
//! assert_eq!(done.code(), -1);
//! assert_eq!(parser.result().headers().get("host"), Some("x"));
//! ```

mod hsm;
mod message;
mod parser_pool;
pub mod transfer;

pub use hsm::HttpParser;
pub use hsm::MessageKind;
pub use hsm::Outcome;
pub use hsm::ParseResult;
pub use hsm::ParseTarget;
pub use hsm::Phase;
pub use hsm::RequestParser;
pub use hsm::ResponseParser;
pub use hsm::State;
pub use message::CONTENT_MD5;
pub use message::ConnectionDirective;
pub use message::HTTP_11;
pub use message::Header;
pub use message::Headers;
pub use message::HttpRequest;
pub use message::HttpResponse;
pub use message::METHODS;
pub use parser_pool::CLIENT_PARSER_POOL;
pub use parser_pool::ParserPool;
pub use parser_pool::SERVER_PARSER_POOL;
pub use transfer::ChunkFileReport;
pub use transfer::HttpServer;
pub use transfer::HttpTransferManager;
