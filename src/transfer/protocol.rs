//! Wire messages for segment replication.
//!
//! Frame format: `len:u32 | type:u8 | payload`, big-endian, where `len` is the
//! payload length. Request/response payloads are bincode; file chunks are
//! hand-encoded so the chunk content is written without an extra copy.
//! Strings are length-prefixed (u16 len + UTF-8).

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::checkpoint::{MetadataSnapshot, ReplicationCheckpoint, ShardId, StoreFileMetadata};
use crate::cluster::DiscoveryNode;
use crate::error::SourceError;
use crate::source::SessionId;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// `FileChunk` payload bytes besides the content, with every string at its
/// longest.
const FILE_CHUNK_MAX_OVERHEAD: usize = 8 + 8 + 8 + 1 + 4 + 8 + 4 + 5 * (2 + u16::MAX as usize);

/// Largest chunk content that always fits in one `FileChunk` frame.
pub const MAX_CHUNK_CONTENT: usize = MAX_FRAME_SIZE as usize - FILE_CHUNK_MAX_OVERHEAD;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    CheckpointInfoRequest = 0x01,
    CheckpointInfoResponse = 0x02,
    GetSegmentFilesRequest = 0x03,
    GetSegmentFilesResponse = 0x04,
    FileChunk = 0x05,
    FileChunkAck = 0x06,
    Error = 0x0E,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::CheckpointInfoRequest),
            0x02 => Some(Self::CheckpointInfoResponse),
            0x03 => Some(Self::GetSegmentFilesRequest),
            0x04 => Some(Self::GetSegmentFilesResponse),
            0x05 => Some(Self::FileChunk),
            0x06 => Some(Self::FileChunkAck),
            0x0E => Some(Self::Error),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChunkFlags: u8 {
        const LAST_CHUNK = 1 << 0;
    }
}

/// A message that can be framed onto the wire.
pub trait WireMessage: Sized {
    const TYPE: MessageType;

    /// Encode as a complete frame, header included.
    fn encode(&self) -> Result<Bytes>;

    /// Decode from a frame payload (header stripped).
    fn decode(payload: Bytes) -> Result<Self>;
}

fn frame(msg_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

macro_rules! bincode_message {
    ($ty:ty, $msg_type:expr) => {
        impl WireMessage for $ty {
            const TYPE: MessageType = $msg_type;

            fn encode(&self) -> Result<Bytes> {
                let payload = bincode::serialize(self)
                    .with_context(|| format!("Failed to encode {:?}", Self::TYPE))?;
                Ok(frame(Self::TYPE, &payload))
            }

            fn decode(payload: Bytes) -> Result<Self> {
                bincode::deserialize(&payload)
                    .with_context(|| format!("Invalid {:?} payload", Self::TYPE))
            }
        }
    };
}

// =============================================================================
// GET_CHECKPOINT_INFO (0x01 / 0x02)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfoRequest {
    pub session_id: SessionId,
    pub target_node: DiscoveryNode,
    pub checkpoint: ReplicationCheckpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfoResponse {
    pub checkpoint: ReplicationCheckpoint,
    pub metadata_snapshot: MetadataSnapshot,
    pub infos_bytes: Vec<u8>,
    pub pending_delete_files: Vec<StoreFileMetadata>,
}

bincode_message!(CheckpointInfoRequest, MessageType::CheckpointInfoRequest);
bincode_message!(CheckpointInfoResponse, MessageType::CheckpointInfoResponse);

// =============================================================================
// GET_SEGMENT_FILES (0x03 / 0x04)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSegmentFilesRequest {
    pub session_id: SessionId,
    pub target_node: DiscoveryNode,
    pub checkpoint: ReplicationCheckpoint,
    pub files: Vec<StoreFileMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSegmentFilesResponse {
    pub files: Vec<StoreFileMetadata>,
}

bincode_message!(GetSegmentFilesRequest, MessageType::GetSegmentFilesRequest);
bincode_message!(GetSegmentFilesResponse, MessageType::GetSegmentFilesResponse);

// =============================================================================
// FILE_CHUNK (0x05)
// =============================================================================

/// One bounded piece of a file, pushed to the replica.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChunkRequest {
    pub session_id: SessionId,
    /// Increases by one for every chunk a session sends
    pub seq_no: u64,
    pub shard_id: ShardId,
    pub metadata: StoreFileMetadata,
    /// Offset of `content` within the file
    pub position: u64,
    pub flags: ChunkFlags,
    pub content: Bytes,
}

impl FileChunkRequest {
    pub fn is_last_chunk(&self) -> bool {
        self.flags.contains(ChunkFlags::LAST_CHUNK)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(payload: &mut Bytes, field: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", field);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            field,
            len,
            payload.remaining()
        );
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", field))
}

fn get_u64(payload: &mut Bytes, field: &str) -> Result<u64> {
    if payload.remaining() < 8 {
        anyhow::bail!("{} truncated", field);
    }
    Ok(payload.get_u64())
}

impl WireMessage for FileChunkRequest {
    const TYPE: MessageType = MessageType::FileChunk;

    fn encode(&self) -> Result<Bytes> {
        let strings = [
            self.shard_id.index_name.as_str(),
            self.shard_id.index_uuid.as_str(),
            self.metadata.name.as_str(),
            self.metadata.checksum.as_str(),
            self.metadata.written_by.as_str(),
        ];
        if let Some(s) = strings.iter().find(|s| s.len() > u16::MAX as usize) {
            anyhow::bail!("FileChunk string field too long ({} bytes)", s.len());
        }
        let strings_len: usize = strings.iter().map(|s| 2 + s.len()).sum();
        let payload_len = 8 + 8 + 8 + 1 + 4 + 8 + strings_len + 4 + self.content.len();
        if payload_len > MAX_FRAME_SIZE as usize {
            anyhow::bail!("FileChunk frame too large: {payload_len} bytes (max {MAX_FRAME_SIZE})");
        }

        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::FileChunk as u8);
        buf.put_u64(self.session_id.0);
        buf.put_u64(self.seq_no);
        buf.put_u64(self.position);
        buf.put_u8(self.flags.bits());
        put_str(&mut buf, &self.shard_id.index_name);
        put_str(&mut buf, &self.shard_id.index_uuid);
        buf.put_u32(self.shard_id.shard);
        put_str(&mut buf, &self.metadata.name);
        buf.put_u64(self.metadata.length);
        put_str(&mut buf, &self.metadata.checksum);
        put_str(&mut buf, &self.metadata.written_by);
        buf.put_u32(self.content.len() as u32);
        buf.put_slice(&self.content);

        Ok(buf.freeze())
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 25 {
            anyhow::bail!("FileChunk payload too short");
        }
        let session_id = SessionId(payload.get_u64());
        let seq_no = payload.get_u64();
        let position = payload.get_u64();
        let flags = ChunkFlags::from_bits_truncate(payload.get_u8());

        let index_name = get_str(&mut payload, "FileChunk index name")?;
        let index_uuid = get_str(&mut payload, "FileChunk index uuid")?;
        if payload.remaining() < 4 {
            anyhow::bail!("FileChunk shard number truncated");
        }
        let shard = payload.get_u32();

        let name = get_str(&mut payload, "FileChunk file name")?;
        let length = get_u64(&mut payload, "FileChunk file length")?;
        let checksum = get_str(&mut payload, "FileChunk checksum")?;
        let written_by = get_str(&mut payload, "FileChunk written_by")?;

        if payload.remaining() < 4 {
            anyhow::bail!("FileChunk content length truncated");
        }
        let content_len = payload.get_u32() as usize;
        if payload.remaining() < content_len {
            anyhow::bail!("FileChunk content truncated");
        }
        let content = payload.copy_to_bytes(content_len);

        Ok(Self {
            session_id,
            seq_no,
            shard_id: ShardId::new(index_name, index_uuid, shard),
            metadata: StoreFileMetadata::new(name, length, checksum, written_by),
            position,
            flags,
            content,
        })
    }
}

// =============================================================================
// FILE_CHUNK_ACK (0x06)
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileChunkAck {
    /// Time the target's rate limiter held this chunk
    pub throttle_time_ms: u64,
}

impl WireMessage for FileChunkAck {
    const TYPE: MessageType = MessageType::FileChunkAck;

    fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(5 + 8);
        buf.put_u32(8);
        buf.put_u8(MessageType::FileChunkAck as u8);
        buf.put_u64(self.throttle_time_ms);
        Ok(buf.freeze())
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: get_u64(&mut payload, "FileChunkAck payload")?,
        })
    }
}

// =============================================================================
// ERROR (0x0E)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    SnapshotUnavailable = 1,
    SessionAlreadyExists = 2,
    SessionNotFound = 3,
    TransferAborted = 4,
    Cancelled = 5,
    Timeout = 6,
    BadRequest = 7,
    Internal = 8,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::SnapshotUnavailable),
            2 => Some(Self::SessionAlreadyExists),
            3 => Some(Self::SessionNotFound),
            4 => Some(Self::TransferAborted),
            5 => Some(Self::Cancelled),
            6 => Some(Self::Timeout),
            7 => Some(Self::BadRequest),
            8 => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn of(err: &SourceError) -> Self {
        match err {
            SourceError::SnapshotUnavailable { .. } => Self::SnapshotUnavailable,
            SourceError::SessionAlreadyExists(_) => Self::SessionAlreadyExists,
            SourceError::SessionNotFound(_) => Self::SessionNotFound,
            SourceError::TransferAborted { .. } => Self::TransferAborted,
            SourceError::Cancelled { .. } => Self::Cancelled,
            SourceError::Timeout(_) => Self::Timeout,
            SourceError::AlreadyReplicating(_)
            | SourceError::FileNotInSnapshot { .. }
            | SourceError::Protocol(_) => Self::BadRequest,
            SourceError::Transport(_)
            | SourceError::Io(_)
            | SourceError::Config(_)
            | SourceError::Internal(_) => Self::Internal,
        }
    }
}

/// Failure reply to a request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&SourceError> for ErrorFrame {
    fn from(err: &SourceError) -> Self {
        Self {
            code: ErrorCode::of(err),
            message: err.to_string(),
        }
    }
}

impl WireMessage for ErrorFrame {
    const TYPE: MessageType = MessageType::Error;

    fn encode(&self) -> Result<Bytes> {
        // Truncate on a char boundary so the frame always decodes
        let mut end = self.message.len().min(u16::MAX as usize);
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }
        let msg_bytes = &self.message.as_bytes()[..end];
        let payload_len = 2 + 2 + msg_bytes.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::Error as u8);
        buf.put_u16(self.code as u16);
        buf.put_u16(msg_bytes.len() as u16);
        buf.put_slice(msg_bytes);
        Ok(buf.freeze())
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("Error payload too short");
        }
        let code = payload.get_u16();
        let code = ErrorCode::from_u16(code).context("Unknown error code")?;
        let message = get_str(&mut payload, "Error message")?;
        Ok(Self { code, message })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;
    read_frame_body(r, len).await
}

/// Like [`read_frame`], but a clean end of stream before the next frame
/// yields `None`.
pub async fn try_read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<(MessageType, Bytes)>> {
    let len = match r.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read frame length"),
    };
    read_frame_body(r, len).await.map(Some)
}

async fn read_frame_body<R: AsyncRead + Unpin>(r: &mut R, len: u32) -> Result<(MessageType, Bytes)> {
    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
