//! File transfer towards replicas.
//!
//! ```text
//! SourceHandler --> RemoteSegmentFileChunkWriter --> RetryableTransportClient --> ReplicaTransport
//!                   (read file, chunk, seq_no)       (timeout, retry, cancel)
//! ```

pub mod cancel;
pub mod chunk_writer;
pub mod protocol;
pub mod retry;

pub use cancel::CancelFlag;
pub use chunk_writer::RemoteSegmentFileChunkWriter;
pub use protocol::{
    read_frame, try_read_frame, write_frame, CheckpointInfoRequest, CheckpointInfoResponse,
    ChunkFlags, ErrorCode, ErrorFrame, FileChunkAck, FileChunkRequest, GetSegmentFilesRequest,
    GetSegmentFilesResponse, MessageType, WireMessage, MAX_CHUNK_CONTENT, MAX_FRAME_SIZE,
};
pub use retry::{ReplicaTransport, RetryPolicy, RetryableTransportClient};
