//! Wire codecs for packets and chunk-file transfers.
//!
//! - [`PacketCodec`] and [`PacketDecoder`]: the optional fixed-width hex
//!   length header used by sessions, decoded into pool-backed [`Packet`]s
//! - [`ChunkFileEncoder`] and [`ChunkFileDecoder`]: `<hex>\r\n<bytes>\r\n`
//!   chunk framing with a streamed MD5 and a `Content-MD5` trailer
//! - [`Md5Stream`]: the streaming digest both chunk codecs share
//!
//! The decoders implement [`tokio_util::codec::Decoder`], so they can be
//! driven by a `FramedRead` or fed by hand from a `BytesMut`.
//!
//! ```
//! use bytes::BytesMut;
//! use micro_net::codec::{ChunkFileDecoder, ChunkFileEncoder, ChunkFrame, ChunkItem};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut wire = BytesMut::new();
//! let mut encoder = ChunkFileEncoder::new();
//! encoder.encode(ChunkFrame::Chunk(b"payload"), &mut wire).unwrap();
//! encoder.encode(ChunkFrame::End, &mut wire).unwrap();
//!
//! let mut decoder = ChunkFileDecoder::new(true);
//! assert!(matches!(decoder.decode(&mut wire).unwrap(), Some(ChunkItem::Chunk(_))));
//! assert!(matches!(decoder.decode(&mut wire).unwrap(), Some(ChunkItem::Trailer { .. })));
//! assert!(decoder.decode(&mut wire).unwrap().unwrap().is_eof());
//! ```

mod chunk_decoder;
mod chunk_encoder;
mod digest;
mod packet;
mod packet_decoder;

pub use chunk_decoder::ChunkFileDecoder;
pub use chunk_decoder::ChunkItem;
pub use chunk_encoder::CHUNK_PAYLOAD_LEN;
pub use chunk_encoder::ChunkFileEncoder;
pub use chunk_encoder::ChunkFrame;
pub use chunk_encoder::MAX_CHUNK_LEN;
pub use digest::Md5Stream;
pub use digest::md5_hex;
pub use packet::Packet;
pub use packet::PacketCodec;
pub use packet_decoder::PacketDecoder;
