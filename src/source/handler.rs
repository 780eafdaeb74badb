//! One replication session: a copy state, a target, and a file writer.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::checkpoint::{ShardId, StoreFileMetadata};
use crate::cluster::DiscoveryNode;
use crate::copy_state::CopyState;
use crate::error::{Result, SourceError};
use crate::source::SessionId;
use crate::transfer::protocol::GetSegmentFilesRequest;
use crate::transfer::{CancelFlag, RemoteSegmentFileChunkWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Checkpoint info answered, waiting for the file request
    Preparing,
    ServingFiles,
    Complete,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

pub struct SegmentReplicationSourceHandler {
    session_id: SessionId,
    target: DiscoveryNode,
    copy_state: Arc<CopyState>,
    writer: RemoteSegmentFileChunkWriter,
    cancel: CancelFlag,
    state: Mutex<SessionState>,
    current_file: Mutex<Option<String>>,
}

impl SegmentReplicationSourceHandler {
    /// The caller must already hold a reference on `copy_state` for this
    /// session.
    pub fn new(
        session_id: SessionId,
        target: DiscoveryNode,
        copy_state: Arc<CopyState>,
        writer: RemoteSegmentFileChunkWriter,
    ) -> Self {
        Self {
            session_id,
            target,
            copy_state,
            writer,
            cancel: CancelFlag::new(),
            state: Mutex::new(SessionState::Preparing),
            current_file: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn target(&self) -> &DiscoveryNode {
        &self.target
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.copy_state.checkpoint().shard_id
    }

    pub fn copy_state(&self) -> &Arc<CopyState> {
        &self.copy_state
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_replicating(&self) -> bool {
        self.state() == SessionState::ServingFiles
    }

    /// Name of the file being streamed right now, if any.
    pub fn current_file(&self) -> Option<String> {
        self.current_file.lock().clone()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.writer.bytes_sent()
    }

    /// Stream the requested files to the target, one after the other.
    ///
    /// Every requested name must be servable from the copy state. Runs at most
    /// once per session; a second call fails with `AlreadyReplicating`.
    pub async fn send_files(&self, request: &GetSegmentFilesRequest) -> Result<Vec<StoreFileMetadata>> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Preparing => *state = SessionState::ServingFiles,
                SessionState::ServingFiles => return Err(SourceError::AlreadyReplicating(self.session_id)),
                finished => {
                    let reason = self
                        .cancel
                        .reason()
                        .unwrap_or_else(|| format!("session already {finished:?}"));
                    return Err(SourceError::cancelled(reason));
                }
            }
        }

        let started = Instant::now();
        let result = self.stream_files(request).await;
        *self.current_file.lock() = None;

        let mut state = self.state.lock();
        match &result {
            Ok(files) => {
                if *state == SessionState::ServingFiles {
                    *state = SessionState::Complete;
                }
                info!(
                    session = %self.session_id,
                    node = %self.target.id,
                    shard = %self.shard_id(),
                    files = files.len(),
                    bytes = self.bytes_sent(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "segment files sent"
                );
            }
            Err(err) if err.is_cancelled() => {
                *state = SessionState::Cancelled;
                debug!(session = %self.session_id, error = %err, "file copy cancelled");
            }
            Err(err) => {
                *state = SessionState::Failed;
                warn!(
                    session = %self.session_id,
                    node = %self.target.id,
                    shard = %self.shard_id(),
                    error = %err,
                    "file copy failed"
                );
            }
        }
        result
    }

    async fn stream_files(&self, request: &GetSegmentFilesRequest) -> Result<Vec<StoreFileMetadata>> {
        let mut files = Vec::with_capacity(request.files.len());
        for requested in &request.files {
            let meta = self
                .copy_state
                .servable_file(&requested.name)
                .ok_or_else(|| SourceError::FileNotInSnapshot {
                    session: self.session_id,
                    file: requested.name.clone(),
                })?;
            files.push(meta.clone());
        }

        for meta in &files {
            *self.current_file.lock() = Some(meta.name.clone());
            let path = self.copy_state.file_path(&meta.name);
            self.writer.send_file(&path, meta, 0, &self.cancel).await?;
        }
        Ok(files)
    }

    /// Abort the session. Safe to call repeatedly and from any state; an
    /// in-flight file copy stops before its next chunk.
    pub fn cancel(&self, reason: &str) {
        let first = self.cancel.cancel(reason);
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = SessionState::Cancelled;
        }
        if first {
            debug!(session = %self.session_id, node = %self.target.id, reason, "session cancelled");
        }
    }
}

impl fmt::Debug for SegmentReplicationSourceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentReplicationSourceHandler")
            .field("session_id", &self.session_id)
            .field("target", &self.target.id)
            .field("checkpoint", self.copy_state.checkpoint())
            .field("state", &self.state())
            .finish()
    }
}
