//! Wire packets: an optional fixed-width hex length header followed by the body.
//!
//! With a header (`head_len > 0`) the packet carries its own boundary, which
//! stream transports need. Without one the body length is whatever a single
//! read delivered, which suits datagrams and raw streaming.

use std::fmt;
use std::io::Write;

use crate::buffer::{BufferAllocator, FreeListLock, PoolBuf, SharedLock};
use crate::ensure;
use crate::protocol::{CodecError, MAX_PACKET_SIZE};
use crate::utils::parse_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    head_len: usize,
}

impl PacketCodec {
    /// Packets prefixed with `head_len` hex digits holding the body length.
    /// A `head_len` of zero is the unheadered mode.
    pub const fn headered(head_len: usize) -> Self {
        Self { head_len }
    }

    pub const fn unheadered() -> Self {
        Self { head_len: 0 }
    }

    #[inline]
    pub fn head_len(&self) -> usize {
        self.head_len
    }

    #[inline]
    pub fn is_headered(&self) -> bool {
        self.head_len > 0
    }

    /// Largest body a single packet may carry.
    pub fn max_body_len(&self) -> usize {
        let by_packet = MAX_PACKET_SIZE.saturating_sub(self.head_len);
        if !self.is_headered() {
            return by_packet;
        }
        let by_digits =
            u32::try_from(self.head_len).ok().and_then(|digits| 16usize.checked_pow(digits)).map_or(usize::MAX, |v| v - 1);
        by_packet.min(by_digits)
    }

    /// Writes the header (if any) and `body` into `dest`, fixing its length.
    pub fn encode<L: FreeListLock>(&self, body: &[u8], dest: &mut PoolBuf<L>) -> Result<(), CodecError> {
        let room = dest.capacity().saturating_sub(self.head_len);
        ensure!(body.len() <= room, CodecError::bad_body(body.len(), room));
        let max_body_len = self.max_body_len();
        ensure!(body.len() <= max_body_len, CodecError::bad_body(body.len(), max_body_len));

        let total = self.head_len + body.len();
        let full = dest.as_full_mut();
        if self.is_headered() {
            let mut head = &mut full[..self.head_len];
            write!(head, "{:0width$x}", body.len(), width = self.head_len).map_err(CodecError::io)?;
        }
        full[self.head_len..total].copy_from_slice(body);
        dest.set_len(total)?;
        Ok(())
    }

    /// Allocates a buffer that fits header plus `body` and encodes into it.
    pub fn encode_packet<L: FreeListLock>(
        &self,
        body: &[u8],
        allocator: &BufferAllocator<L>,
    ) -> Result<Packet<L>, CodecError> {
        let max_body_len = self.max_body_len();
        ensure!(body.len() <= max_body_len, CodecError::bad_body(body.len(), max_body_len));

        let mut buf = allocator.alloc(self.head_len + body.len())?;
        self.encode(body, &mut buf)?;
        Ok(Packet { buf, head_len: self.head_len })
    }

    /// Reads the body length out of a header.
    pub fn decode_header(&self, head: &[u8]) -> Result<usize, CodecError> {
        ensure!(self.is_headered(), CodecError::bad_head("codec has no header"));
        ensure!(
            head.len() >= self.head_len,
            CodecError::bad_head(format!("header needs {} bytes, got {}", self.head_len, head.len()))
        );

        let head = &head[..self.head_len];
        let body_len = parse_hex(head)
            .ok_or_else(|| CodecError::bad_head(format!("not a hex length: {:?}", String::from_utf8_lossy(head))))?;

        let max_body_len = self.max_body_len();
        ensure!(
            body_len <= max_body_len,
            CodecError::bad_head(format!("body length {body_len} exceeds the limit {max_body_len}"))
        );
        Ok(body_len)
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::unheadered()
    }
}

/// A framed message backed by a pool buffer. Dropping it releases the buffer.
pub struct Packet<L: FreeListLock = SharedLock> {
    buf: PoolBuf<L>,
    head_len: usize,
}

impl<L: FreeListLock> Packet<L> {
    /// The encoded bytes, header included, as they go on the wire.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buf[self.head_len..]
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.buf.len() - self.head_len
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_buf(self) -> PoolBuf<L> {
        self.buf
    }
}

impl<L: FreeListLock> fmt::Debug for Packet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet").field("head_len", &self.head_len).field("body_len", &self.body_len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LocalAllocator;

    #[test]
    fn test_encode_into_small_buffer() {
        let allocator = LocalAllocator::new(&[20]);
        let codec = PacketCodec::headered(4);

        let mut buf = allocator.alloc(20).unwrap();
        codec.encode(b"0123456789", &mut buf).unwrap();
        assert_eq!(&buf[..4], b"000a");
        assert_eq!(codec.decode_header(&buf).unwrap(), 10);
        assert_eq!(&buf[4..], b"0123456789");

        let error = codec.encode(&[b'x'; 30], &mut buf).unwrap_err();
        assert!(matches!(error, CodecError::BadBody { len: 30, max_len: 16 }));
    }

    #[test]
    fn test_headered_round_trip() {
        let allocator = LocalAllocator::new(&[64, 1024]);
        let codec = PacketCodec::headered(4);

        let body = b"hello packet";
        let packet = codec.encode_packet(body, &allocator).unwrap();
        assert_eq!(packet.len(), 4 + body.len());
        assert_eq!(codec.decode_header(packet.as_bytes()).unwrap(), body.len());
        assert_eq!(packet.body(), body);
    }

    #[test]
    fn test_unheadered_round_trip() {
        let allocator = LocalAllocator::new(&[64]);
        let codec = PacketCodec::unheadered();

        let packet = codec.encode_packet(b"raw datagram", &allocator).unwrap();
        assert_eq!(packet.as_bytes(), b"raw datagram");
        assert_eq!(packet.body(), b"raw datagram");
        assert!(codec.decode_header(b"").is_err());
    }

    #[test]
    fn test_max_body_len() {
        assert_eq!(PacketCodec::unheadered().max_body_len(), MAX_PACKET_SIZE);
        assert_eq!(PacketCodec::headered(4).max_body_len(), MAX_PACKET_SIZE - 4);
        assert_eq!(PacketCodec::headered(2).max_body_len(), 0xff);
    }

    #[test]
    fn test_decode_bad_head() {
        let codec = PacketCodec::headered(4);
        assert!(matches!(codec.decode_header(b"zz12"), Err(CodecError::BadHead { .. })));
        assert!(matches!(codec.decode_header(b"00"), Err(CodecError::BadHead { .. })));

        let wide = PacketCodec::headered(5);
        assert!(matches!(wide.decode_header(b"fffff"), Err(CodecError::BadHead { .. })));
        assert!(matches!(wide.decode_header(b"0ffff"), Err(CodecError::BadHead { .. })));
        assert_eq!(wide.decode_header(b"0fff0").unwrap(), 0xfff0);
    }

    #[test]
    fn test_body_exceeds_hex_digits() {
        let allocator = LocalAllocator::new(&[1024]);
        let codec = PacketCodec::headered(2);

        let error = codec.encode_packet(&[0u8; 300], &allocator).unwrap_err();
        assert!(matches!(error, CodecError::BadBody { len: 300, max_len: 255 }));
    }
}
