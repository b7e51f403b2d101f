//! Asynchronous tcp/udp sessions with packet framing, pooled buffers and a
//! resumable HTTP/1.1 parser.
//!
//! The crate is built bottom-up: fixed size-class buffers feed a packet
//! codec, sessions move packets over a transport, a registry tracks the live
//! sessions, and an http layer parses requests and responses that may arrive
//! in arbitrary pieces.
//!
//! # Example
//!
//! ```no_run
//! use http::StatusCode;
//! use std::error::Error;
//! use std::sync::Arc;
//! use tracing::{Level, error, info};
//! use tracing_subscriber::FmtSubscriber;
//! use micro_net::handler::{RequestContext, make_handler};
//! use micro_net::http::{HttpResponse, HttpServer};
//! use micro_net::registry::RegistryConfig;
//! use micro_net::session::SessionConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//!     let server = match HttpServer::bind("127.0.0.1:8080".parse().unwrap(), SessionConfig::new(), RegistryConfig::new()).await {
//!         Ok(server) => Arc::new(server),
//!         Err(e) => {
//!             error!(cause = %e, "bind server error");
//!             return;
//!         }
//!     };
//!
//!     server.on_request("GET /hello", make_handler(hello_world));
//!     info!(port = 8080, "start serving");
//!     server.run().await;
//! }
//!
//! async fn hello_world(ctx: RequestContext) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
//!     info!(url = ctx.request.url(), id = ctx.connection_id, "request");
//!     Ok(HttpResponse::text(StatusCode::OK, "Hello World!\r\n"))
//! }
//! ```
//!
//! # Architecture
//!
//! - [`buffer`]: size-class buffer pools, owned [`buffer::PoolBuf`] handles
//!   returned to their class on drop
//! - [`codec`]: the `[hex length][body]` packet format and the chunk file
//!   stream with its streaming MD5
//! - [`session`]: tcp and udp sessions, FIFO send queue, timeouts,
//!   half-close on error, the keep-alive reconnect supervisor and bound
//!   datagram endpoints with multicast
//! - [`registry`]: session id to connection state with eviction strategies
//!   run on pressure or on a timer
//! - [`http`]: the resumable parser, message types and the transfer manager
//! - [`handler`]: request handlers registered per route
//! - [`protocol`]: constants, error codes and error types
//!
//! # Resumable parsing
//!
//! [`http::HttpParser::parse`] takes whatever bytes have arrived. When a
//! delimiter is missing it reports `Indeterminate` together with how much it
//! consumed and records where to resume, so the caller keeps the rest and
//! calls again once more bytes are there. Splitting a message at any byte
//! boundary gives the same result as parsing it in one piece.
//!
//! # Limitations
//!
//! - HTTP/1.1 only, no TLS
//! - Chunk extensions are not supported, the only trailer understood is
//!   `Content-MD5`
//! - Udp carries one packet per datagram, connected through [`session::Session`]
//!   or bound to a port through [`session::DatagramSession`]
//! - Several http messages in one read need every one but the last to be
//!   self-delimiting; bytes past a `Content-Length` body are malformed

pub mod buffer;
pub mod codec;
pub mod handler;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod session;

mod utils;
pub(crate) use utils::ensure;
pub use utils::decode_url;
