//! Framed request loop for one replica connection.
//!
//! Requests on a connection are answered in order. A file request holds the
//! connection until the copy finishes, since chunks travel over the
//! [`ReplicaTransport`](crate::transfer::ReplicaTransport) and not back over
//! this stream.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::Result;
use crate::source::service::SegmentReplicationSourceService;
use crate::transfer::protocol::{
    self as wire, CheckpointInfoRequest, ErrorCode, ErrorFrame, GetSegmentFilesRequest, MessageType, WireMessage,
};

/// Serve request frames from `reader` until the peer closes the stream.
///
/// Handler failures are answered with an error frame and the loop goes on;
/// only a broken stream ends it with an error.
pub async fn serve_connection<R, W>(service: &SegmentReplicationSourceService, mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut served = 0u64;
    while let Some((msg_type, payload)) = wire::try_read_frame(&mut reader).await? {
        let reply = match dispatch(service, msg_type, payload).await {
            Ok(frame) => frame,
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(?msg_type, error = %err, "replication request failed");
                }
                ErrorFrame::from(&err).encode()?
            }
        };
        wire::write_frame(&mut writer, &reply).await?;
        writer.flush().await?;
        served += 1;
    }
    debug!(requests = served, "replica connection closed");
    Ok(())
}

async fn dispatch(service: &SegmentReplicationSourceService, msg_type: MessageType, payload: Bytes) -> Result<Bytes> {
    let frame = match msg_type {
        MessageType::CheckpointInfoRequest => {
            let request = CheckpointInfoRequest::decode(payload)?;
            service.handle_checkpoint_info(&request).await?.encode()?
        }
        MessageType::GetSegmentFilesRequest => {
            let request = GetSegmentFilesRequest::decode(payload)?;
            service.handle_get_segment_files(&request).await?.encode()?
        }
        other => {
            return Ok(ErrorFrame {
                code: ErrorCode::BadRequest,
                message: format!("unexpected {other:?} frame"),
            }
            .encode()?)
        }
    };
    Ok(frame)
}
