//! Chunked body delivery
//!
//! Bodies are written in fixed-size chunks whether they come from memory or
//! from an open file. For in-memory bodies this only bounds the size of each
//! socket write; for files it also bounds memory use, since at most one chunk
//! is buffered at a time.

use bytes::Bytes;
use std::io;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Where a response body comes from
pub enum BodySource {
    /// Fully buffered body, typically a cache entry
    Memory(Bytes),
    /// Open file streamed from its current position, `len` bytes expected
    File { file: File, len: u64 },
}

impl BodySource {
    /// Number of bytes the source is expected to yield
    pub fn len(&self) -> u64 {
        match self {
            BodySource::Memory(bytes) => bytes.len() as u64,
            BodySource::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodySource::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
            BodySource::File { len, .. } => f.debug_struct("File").field("len", len).finish(),
        }
    }
}

/// Which side of the transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFailure {
    /// Writing to the client failed, usually a disconnect
    Client,
    /// Reading the body source failed
    Source,
    /// The source ended before yielding the announced length
    Truncated,
}

/// Result of streaming one body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Body bytes actually handed to the connection
    pub bytes_sent: u64,
    pub failure: Option<TransferFailure>,
}

impl StreamOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Writes response heads and bodies to a connection in bounded chunks
#[derive(Debug, Clone)]
pub struct StreamWriter {
    chunk_size: usize,
}

impl StreamWriter {
    /// Create a writer; a zero chunk size is raised to one byte
    pub fn new(chunk_size: usize) -> Self {
        StreamWriter {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Write a serialized response head
    pub async fn write_head<W>(&self, head: &[u8], dst: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        dst.write_all(head).await
    }

    /// Stream `source` into `dst`
    ///
    /// Never returns an error: failures abort the remaining chunks and are
    /// reported in the outcome together with the bytes already sent.
    pub async fn write_body<W>(&self, source: BodySource, dst: &mut W) -> StreamOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let outcome = match source {
            BodySource::Memory(bytes) => self.write_bytes(&bytes, dst).await,
            BodySource::File { file, len } => self.copy_reader(file, len, dst).await,
        };

        if outcome.is_complete() {
            if let Err(e) = dst.flush().await {
                debug!("Flush after body failed: {}", e);
                return StreamOutcome {
                    bytes_sent: outcome.bytes_sent,
                    failure: Some(TransferFailure::Client),
                };
            }
        }

        outcome
    }

    async fn write_bytes<W>(&self, bytes: &Bytes, dst: &mut W) -> StreamOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let mut sent = 0u64;
        for chunk in bytes.chunks(self.chunk_size) {
            if let Err(e) = dst.write_all(chunk).await {
                warn!("Client write failed after {} of {} bytes: {}", sent, bytes.len(), e);
                return StreamOutcome {
                    bytes_sent: sent,
                    failure: Some(TransferFailure::Client),
                };
            }
            sent += chunk.len() as u64;
        }

        StreamOutcome {
            bytes_sent: sent,
            failure: None,
        }
    }

    /// Copy exactly `len` bytes from `reader`, one chunk at a time
    pub async fn copy_reader<R, W>(&self, mut reader: R, len: u64, dst: &mut W) -> StreamOutcome
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.chunk_size.min(len.max(1) as usize)];
        let mut sent = 0u64;

        while sent < len {
            let want = buf.len().min((len - sent) as usize);
            let n = match reader.read(&mut buf[..want]).await {
                Ok(0) => {
                    warn!("Body source ended early: {} of {} bytes", sent, len);
                    return StreamOutcome {
                        bytes_sent: sent,
                        failure: Some(TransferFailure::Truncated),
                    };
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Body source read failed after {} bytes: {}", sent, e);
                    return StreamOutcome {
                        bytes_sent: sent,
                        failure: Some(TransferFailure::Source),
                    };
                }
            };

            if let Err(e) = dst.write_all(&buf[..n]).await {
                warn!("Client write failed after {} of {} bytes: {}", sent, len, e);
                return StreamOutcome {
                    bytes_sent: sent,
                    failure: Some(TransferFailure::Client),
                };
            }
            sent += n as u64;
        }

        StreamOutcome {
            bytes_sent: sent,
            failure: None,
        }
    }
}

impl Default for StreamWriter {
    fn default() -> Self {
        StreamWriter::new(64 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts `limit` bytes, then fails every write like a closed socket
    struct BrokenPipe {
        written: Vec<u8>,
        limit: usize,
        writes: usize,
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            let room = self.limit - self.written.len();
            if room == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")));
            }
            let n = room.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            self.writes += 1;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_memory_body_complete() {
        let writer = StreamWriter::new(4);
        let mut out = Vec::new();
        let body = Bytes::from_static(b"0123456789");

        let outcome = writer.write_body(BodySource::Memory(body.clone()), &mut out).await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.bytes_sent, 10);
        assert_eq!(out, body.to_vec());
    }

    #[tokio::test]
    async fn test_memory_body_written_in_chunks() {
        let writer = StreamWriter::new(4);
        let mut sink = BrokenPipe { written: Vec::new(), limit: 1000, writes: 0 };

        writer.write_body(BodySource::Memory(Bytes::from(vec![7u8; 10])), &mut sink).await;

        assert_eq!(sink.writes, 3);
    }

    #[tokio::test]
    async fn test_client_disconnect_reports_partial() {
        let writer = StreamWriter::new(4);
        let mut sink = BrokenPipe { written: Vec::new(), limit: 6, writes: 0 };

        let outcome = writer.write_body(BodySource::Memory(Bytes::from(vec![1u8; 20])), &mut sink).await;

        assert_eq!(outcome.failure, Some(TransferFailure::Client));
        // First chunk landed, the second broke midway
        assert_eq!(outcome.bytes_sent, 4);
        assert_eq!(sink.written.len(), 6);
    }

    #[tokio::test]
    async fn test_reader_copy_exact_length() {
        let writer = StreamWriter::new(3);
        let data = b"abcdefghij".to_vec();
        let mut out = Vec::new();

        let outcome = writer.copy_reader(&data[..], 10, &mut out).await;

        assert!(outcome.is_complete());
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_reader_shorter_than_announced() {
        let writer = StreamWriter::new(4);
        let data = b"abc".to_vec();
        let mut out = Vec::new();

        let outcome = writer.copy_reader(&data[..], 10, &mut out).await;

        assert_eq!(outcome.failure, Some(TransferFailure::Truncated));
        assert_eq!(outcome.bytes_sent, 3);
    }

    #[tokio::test]
    async fn test_reader_stops_at_announced_length() {
        let writer = StreamWriter::new(4);
        let data = b"abcdefgh".to_vec();
        let mut out = Vec::new();

        let outcome = writer.copy_reader(&data[..], 5, &mut out).await;

        assert!(outcome.is_complete());
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn test_file_body() {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&data).unwrap();

        let file = File::open(tmp.path()).await.unwrap();
        let writer = StreamWriter::new(4096);
        let mut out = Vec::new();

        let outcome = writer
            .write_body(BodySource::File { file, len: data.len() as u64 }, &mut out)
            .await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.bytes_sent, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_empty_body() {
        let writer = StreamWriter::default();
        let mut out = Vec::new();
        let outcome = writer.write_body(BodySource::Memory(Bytes::new()), &mut out).await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.bytes_sent, 0);
        assert_eq!(writer.chunk_size(), 64 * 1024);
    }
}
