//! segrep - source side of segment replication.
//!
//! A primary shard serves its current on-disk state to replicas without
//! re-indexing. The hard part is exposing a live, mutating directory to many
//! concurrent remote readers while the primary keeps committing and merging.
//!
//! # Architecture
//!
//! ```text
//! replica                          primary (this crate)
//! +---------+  GET_CHECKPOINT_INFO  +---------------------------+
//! |         | --------------------> | SegmentReplicationSource- |
//! |         | <-------------------- | Service                   |
//! |         |   manifest + infos    |   |                       |
//! |         |                       |   v                       |
//! |         |  GET_SEGMENT_FILES    | OngoingSegmentReplications| --> CopyState (pinned commit,
//! |         | --------------------> |   |                       |     refcounted per session)
//! |         | <==== FILE_CHUNK ==== | RemoteSegmentFileChunk-   |
//! +---------+                       | Writer (retry, throttle)  |
//!                                   +---------------------------+
//! ```
//!
//! Cluster membership changes and shard closes cancel sessions through the
//! same teardown path as normal completion, so a pinned commit is released
//! exactly once whatever ends the session.

pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod copy_state;
pub mod error;
pub mod shard;
pub mod source;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use checkpoint::{MetadataSnapshot, RecoveryDiff, ReplicationCheckpoint, ShardId, StoreFileMetadata};
pub use cluster::{ClusterChangedEvent, ClusterService, ClusterStateListener, DiscoveryNode, IndexEventListener, NodeRoles};
pub use config::ReplicationSettings;
pub use copy_state::CopyState;
pub use error::{Result, SourceError, TransportError};
pub use shard::{GatedHandle, IndexCommit, IndexShard, IndicesService, SegmentInfos, ShardState};
pub use source::{
    serve_connection, OngoingSegmentReplications, SegmentReplicationSourceHandler,
    SegmentReplicationSourceService, SessionId, SessionState,
};
pub use transfer::{CancelFlag, RemoteSegmentFileChunkWriter, ReplicaTransport, RetryPolicy, RetryableTransportClient};
