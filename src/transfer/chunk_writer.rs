//! Streams store files to a replica in bounded chunks.
//!
//! Reads a file in `chunk_size` pieces and pushes each one as a
//! [`FileChunkRequest`], waiting for the target's ack before reading the
//! next. Chunks of one file are therefore delivered strictly in order.

use bytes::Bytes;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::debug;

use crate::checkpoint::{ShardId, StoreFileMetadata};
use crate::cluster::DiscoveryNode;
use crate::config::ReplicationSettings;
use crate::error::{Result, SourceError};
use crate::source::SessionId;
use crate::transfer::cancel::CancelFlag;
use crate::transfer::protocol::{ChunkFlags, FileChunkRequest};
use crate::transfer::retry::RetryableTransportClient;

type ThrottleSink = Arc<dyn Fn(Duration) + Send + Sync>;

/// Per-session writer pushing file chunks to one replica.
pub struct RemoteSegmentFileChunkWriter {
    session_id: SessionId,
    shard_id: ShardId,
    chunk_size: usize,
    client: RetryableTransportClient,
    seq_no: AtomicU64,
    bytes_sent: AtomicU64,
    total_bytes_sent: Arc<AtomicU64>,
    on_source_throttle: ThrottleSink,
}

impl RemoteSegmentFileChunkWriter {
    /// `total_bytes_sent` is a rollup shared with other writers; this
    /// writer's own count starts at zero.
    pub fn new(
        session_id: SessionId,
        shard_id: ShardId,
        settings: &ReplicationSettings,
        client: RetryableTransportClient,
        total_bytes_sent: Arc<AtomicU64>,
        on_source_throttle: impl Fn(Duration) + Send + Sync + 'static,
    ) -> Self {
        Self {
            session_id,
            shard_id,
            chunk_size: settings.chunk_size.max(1),
            client,
            seq_no: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            total_bytes_sent,
            on_source_throttle: Arc::new(on_source_throttle),
        }
    }

    pub fn target(&self) -> &DiscoveryNode {
        self.client.target()
    }

    /// Cumulative bytes acknowledged across all files of this writer.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Stream `metadata.name` from `path`, starting at `start_offset`.
    ///
    /// Returns the number of content bytes acknowledged by the target. An
    /// empty remainder is sent as a single empty last chunk.
    pub async fn send_file(
        &self,
        path: &Path,
        metadata: &StoreFileMetadata,
        start_offset: u64,
        cancel: &CancelFlag,
    ) -> Result<u64> {
        let mut file = File::open(path).await.map_err(|e| {
            SourceError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to open {}: {e}", path.display()),
            ))
        })?;
        if start_offset > 0 {
            file.seek(SeekFrom::Start(start_offset)).await?;
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut position = start_offset;
        let mut sent = 0u64;

        loop {
            if let Some(reason) = cancel.reason() {
                return Err(SourceError::cancelled(reason));
            }

            let n = read_chunk(&mut file, &mut buf).await?;
            let last = n < buf.len() || position + n as u64 >= metadata.length;
            let mut flags = ChunkFlags::empty();
            if last {
                flags |= ChunkFlags::LAST_CHUNK;
            }

            let request = FileChunkRequest {
                session_id: self.session_id,
                seq_no: self.seq_no.fetch_add(1, Ordering::Relaxed),
                shard_id: self.shard_id.clone(),
                metadata: metadata.clone(),
                position,
                flags,
                content: Bytes::copy_from_slice(&buf[..n]),
            };
            let ack = self.client.send_file_chunk(&request, cancel).await?;
            if ack.throttle_time_ms > 0 {
                (self.on_source_throttle)(Duration::from_millis(ack.throttle_time_ms));
            }

            self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            self.total_bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            sent += n as u64;
            position += n as u64;

            if last {
                break;
            }
        }

        debug!(
            session = %self.session_id,
            node = %self.target().id,
            file = %metadata.name,
            bytes = sent,
            "file sent"
        );
        Ok(sent)
    }
}

/// Fill `buf` from `reader`, stopping early only at end of file.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl fmt::Debug for RemoteSegmentFileChunkWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSegmentFileChunkWriter")
            .field("session_id", &self.session_id)
            .field("shard_id", &self.shard_id)
            .field("target", &self.target().id)
            .field("chunk_size", &self.chunk_size)
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::test_support::{node, ScriptedTransport};
    use crate::transfer::retry::RetryPolicy;
    use std::fs;
    use tempfile::TempDir;

    fn writer(transport: Arc<ScriptedTransport>, chunk_size: usize, attempts: usize) -> RemoteSegmentFileChunkWriter {
        let mut settings = ReplicationSettings::for_testing();
        settings.chunk_size = chunk_size;
        settings.chunk_retry_attempts = attempts;
        let client = RetryableTransportClient::new(transport, node("replica-1"), RetryPolicy::from_settings(&settings));
        RemoteSegmentFileChunkWriter::new(
            SessionId(11),
            ShardId::new("idx", "uuid", 0),
            &settings,
            client,
            Arc::new(AtomicU64::new(0)),
            |_| {},
        )
    }

    fn write_file(tmp: &TempDir, name: &str, content: &[u8]) -> StoreFileMetadata {
        fs::write(tmp.path().join(name), content).unwrap();
        StoreFileMetadata::new(name, content.len() as u64, "cksum", "9.4.0")
    }

    #[tokio::test]
    async fn test_file_sent_in_ordered_chunks() {
        let tmp = TempDir::new().unwrap();
        let meta = write_file(&tmp, "_0.cfs", b"hello world");
        let transport = Arc::new(ScriptedTransport::default());
        let writer = writer(transport.clone(), 4, 3);

        let sent = writer
            .send_file(&tmp.path().join("_0.cfs"), &meta, 0, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(sent, 11);
        assert_eq!(writer.bytes_sent(), 11);

        let chunks = transport.delivered();
        assert_eq!(chunks.len(), 3);
        let positions: Vec<_> = chunks.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 4, 8]);
        let seq: Vec<_> = chunks.iter().map(|c| c.seq_no).collect();
        assert_eq!(seq, vec![0, 1, 2]);
        assert!(!chunks[0].is_last_chunk());
        assert!(!chunks[1].is_last_chunk());
        assert!(chunks[2].is_last_chunk());

        let content: Vec<u8> = chunks.iter().flat_map(|c| c.content.to_vec()).collect();
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_last_flag() {
        let tmp = TempDir::new().unwrap();
        let meta = write_file(&tmp, "seg", b"abcdefgh");
        let transport = Arc::new(ScriptedTransport::default());
        let writer = writer(transport.clone(), 4, 3);

        writer
            .send_file(&tmp.path().join("seg"), &meta, 0, &CancelFlag::new())
            .await
            .unwrap();
        let chunks = transport.delivered();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_last_chunk());
    }

    #[tokio::test]
    async fn test_empty_file_single_last_chunk() {
        let tmp = TempDir::new().unwrap();
        let meta = write_file(&tmp, "empty", b"");
        let transport = Arc::new(ScriptedTransport::default());
        let writer = writer(transport.clone(), 4, 3);

        let sent = writer
            .send_file(&tmp.path().join("empty"), &meta, 0, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(sent, 0);
        let chunks = transport.delivered();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last_chunk());
        assert!(chunks[0].content.is_empty());
    }

    #[tokio::test]
    async fn test_start_offset() {
        let tmp = TempDir::new().unwrap();
        let meta = write_file(&tmp, "f", b"0123456789");
        let transport = Arc::new(ScriptedTransport::default());
        let writer = writer(transport.clone(), 4, 3);

        let sent = writer
            .send_file(&tmp.path().join("f"), &meta, 6, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(sent, 4);
        let chunks = transport.delivered();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].position, 6);
        assert_eq!(&chunks[0].content[..], b"6789");
        assert!(chunks[0].is_last_chunk());
    }

    #[tokio::test]
    async fn test_sequence_numbers_span_files() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(&tmp, "a", b"12345");
        let b = write_file(&tmp, "b", b"678");
        let transport = Arc::new(ScriptedTransport::default());
        let writer = writer(transport.clone(), 4, 3);
        let cancel = CancelFlag::new();

        writer.send_file(&tmp.path().join("a"), &a, 0, &cancel).await.unwrap();
        writer.send_file(&tmp.path().join("b"), &b, 0, &cancel).await.unwrap();
        let seq: Vec<_> = transport.delivered().iter().map(|c| c.seq_no).collect();
        assert_eq!(seq, vec![0, 1, 2]);
        assert_eq!(writer.bytes_sent(), 8);
    }

    #[tokio::test]
    async fn test_writers_count_own_bytes_and_share_total() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(&tmp, "a", b"12345");
        let b = write_file(&tmp, "b", b"678");
        let transport = Arc::new(ScriptedTransport::default());
        let settings = ReplicationSettings::for_testing();
        let total = Arc::new(AtomicU64::new(0));
        let make = |id: u64| {
            let client =
                RetryableTransportClient::new(transport.clone(), node("r"), RetryPolicy::from_settings(&settings));
            RemoteSegmentFileChunkWriter::new(
                SessionId(id),
                ShardId::new("idx", "uuid", 0),
                &settings,
                client,
                total.clone(),
                |_| {},
            )
        };
        let first = make(1);
        let second = make(2);
        let cancel = CancelFlag::new();

        first.send_file(&tmp.path().join("a"), &a, 0, &cancel).await.unwrap();
        assert_eq!(first.bytes_sent(), 5);
        assert_eq!(second.bytes_sent(), 0);

        second.send_file(&tmp.path().join("b"), &b, 0, &cancel).await.unwrap();
        assert_eq!(first.bytes_sent(), 5);
        assert_eq!(second.bytes_sent(), 3);
        assert_eq!(total.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_throttle_reported_to_sink() {
        let tmp = TempDir::new().unwrap();
        let meta = write_file(&tmp, "f", b"12345678");
        let transport = Arc::new(ScriptedTransport::default());
        transport.set_throttle(Duration::from_millis(3));

        let settings = ReplicationSettings::for_testing();
        let client = RetryableTransportClient::new(transport.clone(), node("r"), RetryPolicy::from_settings(&settings));
        let throttled = Arc::new(AtomicU64::new(0));
        let sink = throttled.clone();
        let writer = RemoteSegmentFileChunkWriter::new(
            SessionId(1),
            ShardId::new("idx", "uuid", 0),
            &settings,
            client,
            Arc::new(AtomicU64::new(0)),
            move |d| {
                sink.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
            },
        );

        writer.send_file(&tmp.path().join("f"), &meta, 0, &CancelFlag::new()).await.unwrap();
        assert_eq!(throttled.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_cancelled_before_next_chunk() {
        let tmp = TempDir::new().unwrap();
        let meta = write_file(&tmp, "f", b"0123456789abcdef");
        let transport = Arc::new(ScriptedTransport::default());
        let writer = writer(transport.clone(), 4, 3);

        let cancel = CancelFlag::new();
        cancel.cancel("shard is closed");
        let err = writer
            .send_file(&tmp.path().join("f"), &meta, 0, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(transport.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_resend_same_chunk() {
        let tmp = TempDir::new().unwrap();
        let meta = write_file(&tmp, "f", b"abcdef");
        let transport = Arc::new(ScriptedTransport::failing_with(vec![
            TransportError::Timeout(Duration::from_millis(1)),
            TransportError::Timeout(Duration::from_millis(1)),
        ]));
        let writer = writer(transport.clone(), 4, 3);

        writer.send_file(&tmp.path().join("f"), &meta, 0, &CancelFlag::new()).await.unwrap();
        assert_eq!(transport.attempts(), 4);
        let seq: Vec<_> = transport.delivered().iter().map(|c| c.seq_no).collect();
        assert_eq!(seq, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let meta = StoreFileMetadata::new("gone", 4, "c", "9.4.0");
        let transport = Arc::new(ScriptedTransport::default());
        let writer = writer(transport.clone(), 4, 3);

        let err = writer
            .send_file(&tmp.path().join("gone"), &meta, 0, &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Io(_)));
        assert_eq!(transport.attempts(), 0);
    }
}
