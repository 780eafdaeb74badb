//! Storage engine collaborator.
//!
//! The engine owns commits, merges and file reclamation. This crate only needs
//! to acquire a commit or segment infos snapshot behind a [`GatedHandle`] so
//! the engine keeps the referenced files until the handle is released.

use bytes::Bytes;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::checkpoint::{MetadataSnapshot, ShardId};

/// A value paired with a release callback that runs exactly once.
///
/// The callback fires on [`close`](Self::close) or on drop, whichever comes
/// first, so every exit path releases the underlying resource.
pub struct GatedHandle<T> {
    value: T,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> GatedHandle<T> {
    pub fn new(value: T, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            value,
            release: Some(Box::new(release)),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Release now.
    pub fn close(self) {
        drop(self);
    }
}

impl<T> Drop for GatedHandle<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for GatedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatedHandle")
            .field("value", &self.value)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// A durable commit point (`segments_N` on disk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCommit {
    pub generation: u64,
    pub segments_file_name: String,
}

/// The live, possibly uncommitted, segment infos of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfos {
    pub generation: u64,
    pub version: u64,
    /// Serialized form, shipped to replicas verbatim
    pub encoded: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Recovering,
    Started,
    Closing,
    Closed,
}

impl ShardState {
    pub fn is_closing(self) -> bool {
        matches!(self, ShardState::Closing | ShardState::Closed)
    }
}

/// A locally allocated shard, as seen by the replication source.
pub trait IndexShard: Send + Sync {
    fn shard_id(&self) -> &ShardId;

    fn state(&self) -> ShardState;

    fn operation_primary_term(&self) -> u64;

    fn processed_local_checkpoint(&self) -> i64;

    /// Pin the current in-memory segment infos.
    fn segment_infos_snapshot(&self) -> io::Result<GatedHandle<SegmentInfos>>;

    /// Pin the last durable commit. `None` if the shard never committed.
    fn acquire_last_index_commit(&self) -> io::Result<Option<GatedHandle<IndexCommit>>>;

    fn metadata_for_commit(&self, commit: &IndexCommit) -> io::Result<MetadataSnapshot>;

    fn metadata_for_infos(&self, infos: &SegmentInfos) -> io::Result<MetadataSnapshot>;

    /// Location of a store file on local disk.
    fn file_path(&self, name: &str) -> PathBuf;
}

/// Lookup of shards allocated on this node.
pub trait IndicesService: Send + Sync {
    fn index_shard(&self, shard_id: &ShardId) -> Option<Arc<dyn IndexShard>>;
}
