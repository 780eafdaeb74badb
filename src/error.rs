//! Error types for the replication source.
//!
//! | Error | Retryable | Meaning |
//! |-------|-----------|---------|
//! | `SnapshotUnavailable` | No | Shard has no commit, is closing, or is not on this node |
//! | `SessionAlreadyExists` | No | Duplicate session id from the replica |
//! | `SessionNotFound` | No | File copy requested for an unknown or finished session |
//! | `TransferAborted` | No | Chunk retry budget exhausted; replica starts a new session |
//! | `Timeout` | Yes | An inbound operation exceeded its configured deadline |
//! | `Transport` | Depends | See [`TransportError::is_retryable`] |

use std::time::Duration;

use thiserror::Error;

use crate::checkpoint::ShardId;
use crate::source::SessionId;

/// Result type alias for replication source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Failures reported by the transport collaborator for a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection to node {node} was lost")]
    Disconnected { node: String },

    #[error("node {node} is unavailable: {message}")]
    Unavailable { node: String, message: String },

    /// The target verified a chunk and found it corrupt.
    #[error("target reported corruption: {0}")]
    Corruption(String),

    #[error("target shard {0} is closed")]
    ShardClosed(String),

    #[error("request rejected by target: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Transient failures are worth resending the same request for.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Disconnected { .. } => true,
            Self::Unavailable { .. } => true,
            Self::Corruption(_) => false,
            Self::ShardClosed(_) => false,
            Self::Rejected(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("snapshot unavailable for shard {shard}: {reason}")]
    SnapshotUnavailable { shard: ShardId, reason: String },

    #[error("replication session {0} already exists")]
    SessionAlreadyExists(SessionId),

    #[error("replication session {0} not found")]
    SessionNotFound(SessionId),

    #[error("replication session {0} is already serving files")]
    AlreadyReplicating(SessionId),

    #[error("file {file} is not part of the snapshot held by session {session}")]
    FileNotInSnapshot { session: SessionId, file: String },

    #[error("transfer of {file} aborted after {attempts} attempt(s): {source}")]
    TransferAborted {
        file: String,
        attempts: usize,
        #[source]
        source: TransportError,
    },

    #[error("replication cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("{0} timed out")]
    Timeout(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Protocol(#[from] anyhow::Error),
}

impl SourceError {
    pub fn snapshot_unavailable(shard: &ShardId, reason: impl Into<String>) -> Self {
        Self::SnapshotUnavailable {
            shard: shard.clone(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Transport(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
