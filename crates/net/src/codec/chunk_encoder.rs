use bytes::BytesMut;
use std::io::Write;
use tokio_util::codec::Encoder;
use tracing::trace;

use crate::codec::Md5Stream;
use crate::ensure;
use crate::protocol::{CodecError, MAX_PACKET_SIZE};

/// Largest chunk payload the decoder accepts.
pub const MAX_CHUNK_LEN: usize = MAX_PACKET_SIZE;

/// Payload bytes per chunk on upload; leaves room for the size line and CRLFs.
pub const CHUNK_PAYLOAD_LEN: usize = MAX_PACKET_SIZE - 12;

/// One frame handed to the [`ChunkFileEncoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFrame<'a> {
    Chunk(&'a [u8]),
    /// Writes the zero-length chunk and the `Content-MD5` trailer
    End,
}

/// Frames an upload as `<hex>\r\n<bytes>\r\n` chunks while hashing the
/// payload, finishing with `0\r\nContent-MD5:<digest>\r\n`.
#[derive(Debug, Clone, Default)]
pub struct ChunkFileEncoder {
    eof: bool,
    digest: Md5Stream,
}

impl ChunkFileEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.eof
    }

    /// Payload bytes framed so far.
    pub fn total(&self) -> u64 {
        self.digest.total()
    }
}

impl Encoder<ChunkFrame<'_>> for ChunkFileEncoder {
    type Error = CodecError;

    fn encode(&mut self, item: ChunkFrame<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            // an empty chunk would read as the terminator
            ChunkFrame::Chunk([]) => Ok(()),
            ChunkFrame::Chunk(bytes) => {
                ensure!(bytes.len() <= MAX_CHUNK_LEN, CodecError::bad_body(bytes.len(), MAX_CHUNK_LEN));
                write!(helper::Writer(dst), "{:x}\r\n", bytes.len())?;
                dst.reserve(bytes.len() + 2);
                dst.extend_from_slice(bytes);
                dst.extend_from_slice(b"\r\n");
                self.digest.update(bytes);
                Ok(())
            }
            ChunkFrame::End => {
                self.eof = true;
                let total = self.digest.total();
                let digest = self.digest.finalize_hex();
                trace!(total, digest, "finished chunk file");
                write!(helper::Writer(dst), "0\r\nContent-MD5:{digest}\r\n")?;
                Ok(())
            }
        }
    }
}

mod helper {
    use bytes::{BufMut, BytesMut};
    use std::io;

    pub struct Writer<'a>(pub &'a mut BytesMut);

    impl io::Write for Writer<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.put_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::md5_hex;

    #[test]
    fn test_frames_and_trailer() {
        let mut encoder = ChunkFileEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(ChunkFrame::Chunk(b"hello"), &mut dst).unwrap();
        encoder.encode(ChunkFrame::Chunk(b""), &mut dst).unwrap();
        encoder.encode(ChunkFrame::Chunk(b", world!!!!!"), &mut dst).unwrap();
        assert_eq!(encoder.total(), 17);
        encoder.encode(ChunkFrame::End, &mut dst).unwrap();

        let expected = format!("5\r\nhello\r\nc\r\n, world!!!!!\r\n0\r\nContent-MD5:{}\r\n", md5_hex(b"hello, world!!!!!"));
        assert_eq!(&dst[..], expected.as_bytes());
        assert!(encoder.is_finished());
    }

    #[test]
    fn test_nothing_after_end() {
        let mut encoder = ChunkFileEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(ChunkFrame::End, &mut dst).unwrap();
        let len = dst.len();
        encoder.encode(ChunkFrame::Chunk(b"late"), &mut dst).unwrap();
        assert_eq!(dst.len(), len);
        assert!(dst.starts_with(b"0\r\nContent-MD5:d41d8cd98f00b204e9800998ecf8427e\r\n"));
    }

    #[test]
    fn test_rejects_oversized_chunk() {
        let mut encoder = ChunkFileEncoder::new();
        let mut dst = BytesMut::new();
        let big = vec![0u8; MAX_CHUNK_LEN + 1];
        assert!(matches!(encoder.encode(ChunkFrame::Chunk(&big), &mut dst), Err(CodecError::BadBody { .. })));
    }
}
