use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::buffer::FreeListLock;
use crate::codec::Packet;
use crate::protocol::SessionError;

/// Write half of a session. Each packet goes out with one `write_all` and a
/// flush, so a datagram transport sends it as one datagram.
#[derive(Debug)]
pub(crate) struct PacketWriter<W> {
    writer: W,
    written: u64,
}

impl<W> PacketWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Total wire bytes written, headers included.
    #[inline]
    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    /// Returns the number of body bytes the packet carried.
    pub(crate) async fn write<L: FreeListLock>(&mut self, packet: &Packet<L>) -> Result<usize, SessionError> {
        if packet.is_empty() {
            return Ok(0);
        }

        self.writer.write_all(packet.as_bytes()).await?;
        self.writer.flush().await?;
        self.written += packet.len() as u64;
        Ok(packet.body_len())
    }

    pub(crate) async fn shutdown(&mut self) -> Result<(), SessionError> {
        Ok(self.writer.shutdown().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LocalAllocator;
    use crate::codec::PacketCodec;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_packets() {
        let allocator = LocalAllocator::new(&[64]);
        let codec = PacketCodec::headered(4);
        let (client, mut server) = tokio::io::duplex(64);

        let mut writer = PacketWriter::new(client);
        let packet = codec.encode_packet(b"hello", &allocator).unwrap();
        assert_eq!(writer.write(&packet).await.unwrap(), 5);
        assert_eq!(writer.written(), 9);

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0005hello");

        writer.shutdown().await.unwrap();
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }
}
