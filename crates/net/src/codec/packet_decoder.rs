use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::buffer::{BufferAllocator, FreeListLock, SharedLock};
use crate::codec::{Packet, PacketCodec};
use crate::protocol::CodecError;

/// Turns a byte stream into [`Packet`]s backed by pool buffers.
///
/// In headered mode the decoder waits for the fixed header, then for exactly
/// the announced number of body bytes. In unheadered mode every call hands
/// out whatever the last read delivered, capped at the maximum body length.
#[derive(Debug)]
pub struct PacketDecoder<L: FreeListLock = SharedLock> {
    codec: PacketCodec,
    allocator: BufferAllocator<L>,
    state: DecodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the length header
    Head,
    /// Waiting for this many body bytes
    Body(usize),
}

impl<L: FreeListLock> PacketDecoder<L> {
    pub fn new(codec: PacketCodec, allocator: BufferAllocator<L>) -> Self {
        Self { codec, allocator, state: DecodeState::Head }
    }

    pub fn codec(&self) -> PacketCodec {
        self.codec
    }
}

impl<L: FreeListLock> Decoder for PacketDecoder<L> {
    type Item = Packet<L>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.codec.is_headered() {
            if src.is_empty() {
                return Ok(None);
            }
            let len = src.len().min(self.codec.max_body_len());
            let body = src.split_to(len);
            trace!(len, "decoded unheadered packet");
            return self.codec.encode_packet(&body, &self.allocator).map(Some);
        }

        loop {
            match self.state {
                DecodeState::Head => {
                    let head_len = self.codec.head_len();
                    if src.len() < head_len {
                        src.reserve(head_len - src.len());
                        return Ok(None);
                    }
                    let body_len = self.codec.decode_header(&src[..head_len])?;
                    src.advance(head_len);
                    self.state = DecodeState::Body(body_len);
                }
                DecodeState::Body(body_len) => {
                    if src.len() < body_len {
                        src.reserve(body_len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(body_len);
                    self.state = DecodeState::Head;
                    trace!(len = body_len, "decoded headered packet");
                    return self.codec.encode_packet(&body, &self.allocator).map(Some);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LocalAllocator;

    fn decoder(codec: PacketCodec) -> PacketDecoder<crate::buffer::LocalLock> {
        PacketDecoder::new(codec, LocalAllocator::new(&[64, 1024, 65535]))
    }

    #[test]
    fn test_headered_two_packets() {
        let mut decoder = decoder(PacketCodec::headered(4));
        let mut buffer = BytesMut::from(&b"0005hello0003abc"[..]);

        let packet = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(packet.body(), b"hello");
        assert_eq!(packet.as_bytes(), b"0005hello");

        let packet = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(packet.body(), b"abc");

        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_headered_split_across_reads() {
        let mut decoder = decoder(PacketCodec::headered(4));
        let mut buffer = BytesMut::from(&b"00"[..]);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"0chell");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"o worl");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"d!");
        let packet = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(packet.body(), b"hello world!");
        assert_eq!(packet.body_len(), 12);
    }

    #[test]
    fn test_headered_bad_head() {
        let mut decoder = decoder(PacketCodec::headered(4));
        let mut buffer = BytesMut::from(&b"xyz!body"[..]);
        assert!(matches!(decoder.decode(&mut buffer), Err(CodecError::BadHead { .. })));
    }

    #[test]
    fn test_headered_empty_body() {
        let mut decoder = decoder(PacketCodec::headered(4));
        let mut buffer = BytesMut::from(&b"0000"[..]);
        let packet = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(packet.body_len(), 0);
    }

    #[test]
    fn test_unheadered_takes_what_was_read() {
        let mut decoder = decoder(PacketCodec::unheadered());
        let mut buffer = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);

        let packet = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(packet.body(), b"GET / HTTP/1.1\r\n");
        assert!(buffer.is_empty());
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_unheadered_caps_at_max_body() {
        let mut decoder = decoder(PacketCodec::unheadered());
        let mut buffer = BytesMut::from(&vec![7u8; 70_000][..]);

        let first = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(first.body_len(), 65535);
        let second = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.body_len(), 70_000 - 65535);
    }
}
