//! Decoder for the chunk-file transfer stream.
//!
//! The stream is a sequence of `<hex-length>\r\n<bytes>\r\n` frames closed by
//! a zero-length frame. When a trailer is expected, exactly one
//! `Name:value\r\n` line follows the zero-length frame (the sender writes
//! `Content-MD5:<digest>`); there is no blank line after it.
//!
//! Every complete chunk is hashed as it is handed out, so once the stream is
//! over [`ChunkFileDecoder::digest_hex`] is the MD5 of all delivered bytes.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::io::ErrorKind;
use std::task::Poll;
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkState::*;

use crate::codec::Md5Stream;
use crate::codec::chunk_encoder::MAX_CHUNK_LEN;
use crate::protocol::CodecError;

/// An item of the chunk-file stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkItem {
    /// One complete chunk payload
    Chunk(Bytes),
    /// The trailer line after the last chunk
    Trailer { name: String, value: String },
    /// The stream is over
    Eof,
}

impl ChunkItem {
    pub fn is_eof(&self) -> bool {
        matches!(self, ChunkItem::Eof)
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ChunkItem::Chunk(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkFileDecoder {
    state: ChunkState,
    expect_trailer: bool,
    remaining_size: usize,
    trailer_line: Vec<u8>,
    digest: Md5Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Read the first hex digit of the chunk size
    Size,
    /// Read the remaining hex digits
    SizeDigits,
    /// Handle whitespace after size
    SizeLws,
    /// Skip chunk extensions
    Extension,
    /// Read LF after chunk size
    SizeLf,
    /// Read the whole chunk payload
    Body,
    /// Read CR after chunk data
    BodyCr,
    /// Read LF after chunk data
    BodyLf,
    /// Collect the trailer line
    Trailer,
    /// Read LF after the trailer line
    TrailerLf,
    /// Final state after the last chunk or the trailer
    End,
}

/// What a single step produced besides the next state.
#[derive(Debug, Default)]
struct StepOutput {
    chunk: Option<Bytes>,
    trailer: Option<(String, String)>,
}

impl ChunkFileDecoder {
    /// `expect_trailer` tells whether a trailer line follows the zero-length chunk.
    pub fn new(expect_trailer: bool) -> Self {
        Self { state: Size, expect_trailer, remaining_size: 0, trailer_line: Vec::new(), digest: Md5Stream::new() }
    }

    pub fn is_finished(&self) -> bool {
        self.state == End
    }

    /// Bytes of chunk payload delivered so far.
    pub fn total(&self) -> u64 {
        self.digest.total()
    }

    /// MD5 of every chunk delivered so far. Resets the running digest.
    pub fn digest_hex(&mut self) -> String {
        self.digest.finalize_hex()
    }
}

impl Decoder for ChunkFileDecoder {
    type Item = ChunkItem;
    type Error = CodecError;

    /// # Returns
    /// - `Ok(Some(ChunkItem::Chunk(bytes)))` for every complete chunk
    /// - `Ok(Some(ChunkItem::Trailer { .. }))` once, when a trailer is expected
    /// - `Ok(Some(ChunkItem::Eof))` when the stream is over
    /// - `Ok(None)` when more data is needed
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == End {
                trace!("finished reading chunk file");
                return Ok(Some(ChunkItem::Eof));
            }

            if src.is_empty() {
                return Ok(None);
            }

            let mut output = StepOutput::default();

            self.state = match self.state.step(
                src,
                &mut self.remaining_size,
                &mut self.trailer_line,
                self.expect_trailer,
                &mut output,
            ) {
                Poll::Pending => return Ok(None),
                Poll::Ready(Ok(new_state)) => new_state,
                Poll::Ready(Err(e)) => return Err(CodecError::bad_data(e)),
            };

            if let Some(bytes) = output.chunk {
                trace!(len = bytes.len(), "read chunk");
                self.digest.update(&bytes);
                return Ok(Some(ChunkItem::Chunk(bytes)));
            }

            if let Some((name, value)) = output.trailer {
                trace!(name, "read trailer");
                return Ok(Some(ChunkItem::Trailer { name, value }));
            }
        }
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.len() > 0 {
            $src.get_u8()
        } else {
            return Poll::Pending;
        }
    }};
}

fn invalid(reason: &'static str) -> Poll<Result<ChunkState, io::Error>> {
    Poll::Ready(Err(io::Error::new(ErrorKind::InvalidInput, reason)))
}

impl ChunkState {
    fn step(
        &self,
        src: &mut BytesMut,
        remaining_size: &mut usize,
        trailer_line: &mut Vec<u8>,
        expect_trailer: bool,
        output: &mut StepOutput,
    ) -> Poll<Result<ChunkState, io::Error>> {
        match self {
            Size => ChunkState::read_size(src, remaining_size, true),
            SizeDigits => ChunkState::read_size(src, remaining_size, false),
            SizeLws => ChunkState::read_size_lws(src),
            Extension => ChunkState::read_extension(src),
            SizeLf => ChunkState::read_size_lf(src, *remaining_size, expect_trailer),
            Body => ChunkState::read_body(src, remaining_size, output),
            BodyCr => ChunkState::read_body_cr(src),
            BodyLf => ChunkState::read_body_lf(src),
            Trailer => ChunkState::read_trailer(src, trailer_line),
            TrailerLf => ChunkState::read_trailer_lf(src, trailer_line, output),
            End => Poll::Ready(Ok(End)),
        }
    }

    /// Accumulates hex digits of the chunk size. A size line needs at least one digit.
    fn read_size(
        src: &mut BytesMut,
        size_per_chunk: &mut usize,
        first: bool,
    ) -> Poll<Result<ChunkState, io::Error>> {
        let digit = match try_next_byte!(src) {
            b @ b'0'..=b'9' => b - b'0',
            b @ b'a'..=b'f' => b + 10 - b'a',
            b @ b'A'..=b'F' => b + 10 - b'A',
            _ if first => return invalid("invalid chunk size line: missing size"),
            b'\t' | b' ' => return Poll::Ready(Ok(SizeLws)),
            b';' => return Poll::Ready(Ok(Extension)),
            b'\r' => return Poll::Ready(Ok(SizeLf)),
            _ => return invalid("invalid chunk size line: Invalid Size"),
        };

        match size_per_chunk.checked_mul(16).and_then(|size| size.checked_add(usize::from(digit))) {
            Some(size) if size <= MAX_CHUNK_LEN => {
                *size_per_chunk = size;
                Poll::Ready(Ok(SizeDigits))
            }
            _ => invalid("chunk size exceeds the packet limit"),
        }
    }

    fn read_size_lws(src: &mut BytesMut) -> Poll<Result<ChunkState, io::Error>> {
        match try_next_byte!(src) {
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            _ => invalid("invalid chunk size linear white space"),
        }
    }

    fn read_extension(src: &mut BytesMut) -> Poll<Result<ChunkState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => invalid("invalid chunk extension contains newline"),
            _ => Poll::Ready(Ok(Extension)),
        }
    }

    /// A zero size closes the stream, with or without a trailer line.
    fn read_size_lf(
        src: &mut BytesMut,
        size_per_chunk: usize,
        expect_trailer: bool,
    ) -> Poll<Result<ChunkState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' if size_per_chunk > 0 => Poll::Ready(Ok(Body)),
            b'\n' if expect_trailer => Poll::Ready(Ok(Trailer)),
            b'\n' => Poll::Ready(Ok(End)),
            _ => invalid("invalid chunk size LF"),
        }
    }

    /// Waits until the whole chunk is buffered, then hands it out.
    fn read_body(
        src: &mut BytesMut,
        size_per_chunk: &mut usize,
        output: &mut StepOutput,
    ) -> Poll<Result<ChunkState, io::Error>> {
        if src.len() < *size_per_chunk {
            src.reserve(*size_per_chunk - src.len());
            return Poll::Pending;
        }

        output.chunk = Some(src.split_to(*size_per_chunk).freeze());
        *size_per_chunk = 0;
        Poll::Ready(Ok(BodyCr))
    }

    fn read_body_cr(src: &mut BytesMut) -> Poll<Result<ChunkState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            _ => invalid("invalid chunk body CR"),
        }
    }

    fn read_body_lf(src: &mut BytesMut) -> Poll<Result<ChunkState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(Size)),
            _ => invalid("invalid chunk body LF"),
        }
    }

    fn read_trailer(src: &mut BytesMut, trailer_line: &mut Vec<u8>) -> Poll<Result<ChunkState, io::Error>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(TrailerLf)),
            b'\n' => invalid("invalid trailer contains bare newline"),
            b => {
                trailer_line.push(b);
                Poll::Ready(Ok(Trailer))
            }
        }
    }

    fn read_trailer_lf(
        src: &mut BytesMut,
        trailer_line: &mut Vec<u8>,
        output: &mut StepOutput,
    ) -> Poll<Result<ChunkState, io::Error>> {
        match try_next_byte!(src) {
            b'\n' => {}
            _ => return invalid("invalid trailer end LF"),
        }

        let line = std::mem::take(trailer_line);
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            return invalid("trailer line without colon");
        };
        let name = String::from_utf8_lossy(line[..colon].trim_ascii()).into_owned();
        let value = String::from_utf8_lossy(line[colon + 1..].trim_ascii()).into_owned();
        if name.is_empty() {
            return invalid("trailer line without name");
        }

        output.trailer = Some((name, value));
        Poll::Ready(Ok(End))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::md5_hex;

    #[test]
    fn test_basic() {
        let mut buffer = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n"[..]);
        let mut decoder = ChunkFileDecoder::new(false);

        let item = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(item.as_bytes().unwrap().len(), 16);
        assert_eq!(&item.as_bytes().unwrap()[..], b"1234567890abcdef");

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_multiple_chunks_with_md5_trailer() {
        let digest = md5_hex(b"hello, world");
        let stream = format!("05\r\nhello\r\n07\r\n, world\r\n0\r\nContent-MD5:{digest}\r\n");
        let mut buffer = BytesMut::from(stream.as_bytes());
        let mut decoder = ChunkFileDecoder::new(true);

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"hello"));

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b", world"));

        let trailer = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(trailer, ChunkItem::Trailer { name: "Content-MD5".into(), value: digest.clone() });

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(decoder.total(), 12);
        assert_eq!(decoder.digest_hex(), digest);
    }

    #[test]
    fn test_chunks_with_extensions() {
        let mut buffer = BytesMut::from(&b"5;chunk-ext=value\r\nhello\r\n0\r\n"[..]);
        let mut decoder = ChunkFileDecoder::new(false);

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"hello"));
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_incomplete_chunk_waits_for_whole_payload() {
        let mut buffer = BytesMut::from(&b"5\r\nhel"[..]);
        let mut decoder = ChunkFileDecoder::new(false);

        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert_eq!(&buffer[..], b"hel");

        buffer.extend_from_slice(b"lo\r\n0\r\n");
        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"hello"));
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_split_at_every_byte() {
        let stream = b"3\r\nabc\r\n2\r\nde\r\n0\r\nContent-MD5: 00ff\r\n";
        let mut decoder = ChunkFileDecoder::new(true);
        let mut buffer = BytesMut::new();
        let mut items = Vec::new();

        for byte in stream {
            buffer.extend_from_slice(&[*byte]);
            while let Some(item) = decoder.decode(&mut buffer).unwrap() {
                let eof = item.is_eof();
                items.push(item);
                if eof {
                    break;
                }
            }
        }

        assert_eq!(
            items,
            vec![
                ChunkItem::Chunk(Bytes::from_static(b"abc")),
                ChunkItem::Chunk(Bytes::from_static(b"de")),
                ChunkItem::Trailer { name: "Content-MD5".into(), value: "00ff".into() },
                ChunkItem::Eof,
            ]
        );
    }

    #[test]
    fn test_invalid_size() {
        let mut buffer = BytesMut::from(&b"xyz\r\nhello\r\n"[..]);
        let mut decoder = ChunkFileDecoder::new(false);
        assert!(matches!(decoder.decode(&mut buffer), Err(CodecError::BadData { .. })));
    }

    #[test]
    fn test_size_line_without_digits() {
        for stream in [&b"\r\nhello\r\n"[..], b";ext\r\n", b" 5\r\n"] {
            let mut buffer = BytesMut::from(stream);
            let mut decoder = ChunkFileDecoder::new(false);
            assert!(matches!(decoder.decode(&mut buffer), Err(CodecError::BadData { .. })));
        }

        // the next size line after a chunk needs digits too
        let mut buffer = BytesMut::from(&b"3\r\nabc\r\n\r\n"[..]);
        let mut decoder = ChunkFileDecoder::new(false);
        assert!(decoder.decode(&mut buffer).unwrap().is_some());
        assert!(decoder.decode(&mut buffer).is_err());
    }

    #[test]
    fn test_missing_body_crlf() {
        let mut buffer = BytesMut::from(&b"3\r\nabcX\n"[..]);
        let mut decoder = ChunkFileDecoder::new(false);
        assert!(decoder.decode(&mut buffer).unwrap().is_some());
        assert!(decoder.decode(&mut buffer).is_err());
    }

    #[test]
    fn test_oversized_chunk() {
        let mut buffer = BytesMut::from(&b"ffffff\r\n"[..]);
        let mut decoder = ChunkFileDecoder::new(false);
        assert!(decoder.decode(&mut buffer).is_err());
    }

    #[test]
    fn test_trailer_without_colon() {
        let mut buffer = BytesMut::from(&b"0\r\nContent-MD5\r\n"[..]);
        let mut decoder = ChunkFileDecoder::new(true);
        assert!(decoder.decode(&mut buffer).is_err());
    }
}
