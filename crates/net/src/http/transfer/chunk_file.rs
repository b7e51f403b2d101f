use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use crate::codec::{CHUNK_PAYLOAD_LEN, ChunkFileDecoder, ChunkFrame, ChunkItem};
use crate::ensure;
use crate::http::CONTENT_MD5;
use crate::http::transfer::{HttpTransferManager, lock};
use crate::protocol::{SessionError, TransferError};
use crate::session::Session;

/// Outcome of a received chunk file.
///
/// A digest mismatch is not an error of the transfer itself: the bytes were
/// all delivered, `integrity_verified` tells whether they can be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFileReport {
    /// Payload bytes handed to the chunk callback
    pub total: u64,
    /// MD5 of the delivered bytes
    pub computed: String,
    /// Digest carried by the `Content-MD5` trailer
    pub expected: Option<String>,
    pub integrity_verified: bool,
}

impl ChunkFileReport {
    /// Turns a missing or mismatching digest into an error.
    pub fn verified(self) -> Result<Self, TransferError> {
        match &self.expected {
            None => Err(TransferError::MissingTrailer),
            Some(expected) if !self.integrity_verified => Err(TransferError::md5_mismatch(expected, &self.computed)),
            Some(_) => Ok(self),
        }
    }
}

impl HttpTransferManager {
    /// Sends `bytes` as chunks of at most [`CHUNK_PAYLOAD_LEN`] bytes,
    /// continuing the digest of earlier calls on the same session. With
    /// `is_last` the zero-length chunk and the `Content-MD5` trailer follow.
    ///
    /// Returns the number of bytes written to the session.
    pub async fn send_chunk_file(&self, session: &Session, bytes: &[u8], is_last: bool) -> Result<usize, TransferError> {
        let id = session.id();
        ensure!(session.is_connected(), SessionError::NotConnected(id).into());

        let mut wire = BytesMut::with_capacity(bytes.len() + 64);
        {
            let mut uploads = lock(&self.uploads);
            let encoder = uploads.entry(id).or_default();
            for piece in bytes.chunks(CHUNK_PAYLOAD_LEN) {
                encoder.encode(ChunkFrame::Chunk(piece), &mut wire)?;
            }
            if is_last {
                encoder.encode(ChunkFrame::End, &mut wire)?;
                uploads.remove(&id);
            }
        }

        match session.send(&wire).await {
            Ok(sent) => {
                trace!(id, payload = bytes.len(), sent, is_last, "sent chunk file part");
                Ok(sent)
            }
            Err(e) => {
                warn!(id, cause = %e, "chunk file upload aborted");
                lock(&self.uploads).remove(&id);
                Err(e.into())
            }
        }
    }

    /// Receives one chunk file, handing every chunk to `on_chunk` as soon as
    /// it is complete. With `expect_trailer` the `Content-MD5` line after the
    /// zero-length chunk is read and compared with the digest of the
    /// delivered bytes.
    pub async fn recv_chunk_file<F>(
        &self,
        session: &Session,
        mut on_chunk: F,
        expect_trailer: bool,
    ) -> Result<ChunkFileReport, TransferError>
    where
        F: FnMut(&[u8]) + Send,
    {
        let id = session.id();
        let buffered = lock(&self.downloads).remove(&id);
        let mut buffer = buffered.unwrap_or_default();
        let mut decoder = ChunkFileDecoder::new(expect_trailer);
        let mut expected = None;

        loop {
            while let Some(item) = decoder.decode(&mut buffer)? {
                match item {
                    ChunkItem::Chunk(bytes) => on_chunk(&bytes),
                    ChunkItem::Trailer { name, value } if name.eq_ignore_ascii_case(CONTENT_MD5) => {
                        expected = Some(value);
                    }
                    ChunkItem::Trailer { name, .. } => debug!(id, name, "ignored trailer"),
                    ChunkItem::Eof => {
                        if !buffer.is_empty() {
                            lock(&self.downloads).insert(id, buffer);
                        }
                        let total = decoder.total();
                        let computed = decoder.digest_hex();
                        let integrity_verified =
                            expected.as_deref().is_some_and(|expected| expected.eq_ignore_ascii_case(&computed));
                        if expected.is_some() && !integrity_verified {
                            warn!(id, expected, computed, "content-md5 mismatch");
                        } else {
                            debug!(id, total, computed, "received chunk file");
                        }
                        return Ok(ChunkFileReport { total, computed, expected, integrity_verified });
                    }
                }
            }

            let packet = session.receive().await?;
            self.mark(id, crate::registry::ConnState::Active);
            buffer.extend_from_slice(packet.body());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ChunkFileEncoder, md5_hex};
    use crate::http::transfer::testing::session_pair;
    use crate::session::SessionConfig;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_chunk_file_round_trip() {
        let (client, server) = session_pair(SessionConfig::new()).await;
        let sender = HttpTransferManager::client();
        let receiver = HttpTransferManager::server();
        let data = payload(3 * CHUNK_PAYLOAD_LEN + 100);

        let upload = tokio::spawn({
            let data = data.clone();
            async move {
                let (head, tail) = data.split_at(CHUNK_PAYLOAD_LEN + 10);
                sender.send_chunk_file(&client, head, false).await.unwrap();
                sender.send_chunk_file(&client, tail, true).await.unwrap();
                client
            }
        });

        let mut received = Vec::new();
        let mut chunks = 0;
        let report = receiver
            .recv_chunk_file(
                &server,
                |chunk| {
                    assert!(chunk.len() <= CHUNK_PAYLOAD_LEN);
                    chunks += 1;
                    received.extend_from_slice(chunk);
                },
                true,
            )
            .await
            .unwrap();

        assert_eq!(received, data);
        assert_eq!(chunks, 5);
        assert_eq!(report.total, data.len() as u64);
        assert_eq!(report.computed, md5_hex(&data));
        assert!(report.integrity_verified);
        report.clone().verified().unwrap();
        drop(upload.await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_byte_fails_digest() {
        let (client, server) = session_pair(SessionConfig::new()).await;
        let receiver = HttpTransferManager::server();

        let mut wire = BytesMut::new();
        let mut encoder = ChunkFileEncoder::new();
        encoder.encode(ChunkFrame::Chunk(b"important payload"), &mut wire).unwrap();
        encoder.encode(ChunkFrame::End, &mut wire).unwrap();
        // flip one payload byte, the size line "11\r\n" takes four
        wire[4 + 3] ^= 0x20;
        client.send(&wire).await.unwrap();

        let report = receiver.recv_chunk_file(&server, |_| {}, true).await.unwrap();
        assert!(!report.integrity_verified);
        assert_eq!(report.expected.as_deref(), Some(md5_hex(b"important payload").as_str()));

        let error = report.verified().unwrap_err();
        assert!(matches!(error, TransferError::Md5Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_without_trailer() {
        let (client, server) = session_pair(SessionConfig::new()).await;
        let receiver = HttpTransferManager::server();

        client.send(b"4\r\nabcd\r\n0\r\nGET /").await.unwrap();

        let mut received = Vec::new();
        let report = receiver.recv_chunk_file(&server, |chunk| received.extend_from_slice(chunk), false).await.unwrap();
        assert_eq!(received, b"abcd");
        assert_eq!(report.expected, None);
        assert!(!report.integrity_verified);
        assert!(matches!(report.verified(), Err(TransferError::MissingTrailer)));
        // bytes after the stream wait for the next read
        assert_eq!(receiver.remainder_len(server.id()), 5);
    }

    #[tokio::test]
    async fn test_send_on_closed_session() {
        let (client, _server) = session_pair(SessionConfig::new()).await;
        let sender = HttpTransferManager::client();
        client.close().await;

        let error = sender.send_chunk_file(&client, b"late", true).await.unwrap_err();
        assert!(matches!(error, TransferError::Session { source: SessionError::NotConnected(_) }));
    }
}
