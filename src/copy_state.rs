//! Point-in-time copy state of a shard.
//!
//! A [`CopyState`] freezes what a replica needs to converge on one checkpoint:
//! the live segment infos file manifest, the serialized infos, and the files
//! that the last commit still references but the live infos merged away.
//! Those pending-delete files survive only because the copy state keeps the
//! commit pinned.
//!
//! The copy state is shared by every session replicating the same checkpoint.
//! It counts its holders and releases the pinned handles when the last one
//! lets go. Once released it can never be referenced again.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::checkpoint::{MetadataSnapshot, ReplicationCheckpoint, StoreFileMetadata};
use crate::error::{Result, SourceError};
use crate::shard::{GatedHandle, IndexCommit, IndexShard, SegmentInfos};

/// Terminal refcount value. No increment succeeds from here.
const RELEASED: usize = usize::MAX;

/// Handles pinned by a copy state. Dropping them hands them back to the
/// store, commit first.
#[derive(Default)]
pub(crate) struct Pinned {
    commit: Option<GatedHandle<IndexCommit>>,
    infos: Option<GatedHandle<SegmentInfos>>,
}

pub struct CopyState {
    requested_checkpoint: ReplicationCheckpoint,
    checkpoint: ReplicationCheckpoint,
    metadata_snapshot: MetadataSnapshot,
    pending_delete_files: Vec<StoreFileMetadata>,
    infos_bytes: Bytes,
    shard: Arc<dyn IndexShard>,
    refs: AtomicUsize,
    pinned: Mutex<Pinned>,
}

impl CopyState {
    /// Capture the shard's current state. Blocks on store metadata reads.
    ///
    /// Starts with zero references; holders claim one with
    /// [`try_inc_ref`](Self::try_inc_ref).
    pub fn new(requested_checkpoint: ReplicationCheckpoint, shard: Arc<dyn IndexShard>) -> Result<Self> {
        let shard_id = shard.shard_id().clone();
        if shard.state().is_closing() {
            return Err(SourceError::snapshot_unavailable(&shard_id, "shard is closing"));
        }

        let infos_ref = shard.segment_infos_snapshot().map_err(|e| {
            SourceError::snapshot_unavailable(&shard_id, format!("failed to acquire segment infos: {e}"))
        })?;
        let infos = infos_ref.get();
        let metadata_snapshot = shard.metadata_for_infos(infos).map_err(|e| {
            SourceError::snapshot_unavailable(&shard_id, format!("failed to read infos metadata: {e}"))
        })?;
        let checkpoint = ReplicationCheckpoint::new(
            shard_id.clone(),
            shard.operation_primary_term(),
            infos.generation,
            shard.processed_local_checkpoint(),
            infos.version,
        );
        let infos_bytes = infos.encoded.clone();

        // Files merged away in the live infos but still on disk in segments_N.
        // Replicas need them to match the primary's last commit.
        let commit_ref = shard
            .acquire_last_index_commit()
            .map_err(|e| {
                SourceError::snapshot_unavailable(&shard_id, format!("failed to acquire last commit: {e}"))
            })?
            .ok_or_else(|| SourceError::snapshot_unavailable(&shard_id, "shard has no commit"))?;
        let commit_metadata = shard.metadata_for_commit(commit_ref.get()).map_err(|e| {
            SourceError::snapshot_unavailable(&shard_id, format!("failed to read commit metadata: {e}"))
        })?;
        let pending_delete_files = commit_metadata.recovery_diff(&metadata_snapshot).missing;

        let commit = if pending_delete_files.is_empty() {
            commit_ref.close();
            None
        } else {
            Some(commit_ref)
        };

        debug!(
            checkpoint = %checkpoint,
            files = metadata_snapshot.len(),
            pending_delete = pending_delete_files.len(),
            "created copy state"
        );

        Ok(Self {
            requested_checkpoint,
            checkpoint,
            metadata_snapshot,
            pending_delete_files,
            infos_bytes,
            shard,
            refs: AtomicUsize::new(0),
            pinned: Mutex::new(Pinned {
                infos: Some(infos_ref),
                commit,
            }),
        })
    }

    /// The checkpoint a replica asked for; keys the shared table.
    pub fn requested_checkpoint(&self) -> &ReplicationCheckpoint {
        &self.requested_checkpoint
    }

    /// The checkpoint actually captured from the shard.
    pub fn checkpoint(&self) -> &ReplicationCheckpoint {
        &self.checkpoint
    }

    pub fn metadata_snapshot(&self) -> &MetadataSnapshot {
        &self.metadata_snapshot
    }

    pub fn pending_delete_files(&self) -> &[StoreFileMetadata] {
        &self.pending_delete_files
    }

    pub fn infos_bytes(&self) -> &Bytes {
        &self.infos_bytes
    }

    /// A file a replica may fetch: in the manifest or pinned for deletion.
    pub fn servable_file(&self, name: &str) -> Option<&StoreFileMetadata> {
        self.metadata_snapshot
            .get(name)
            .or_else(|| self.pending_delete_files.iter().find(|f| f.name == name))
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.shard.file_path(name)
    }

    pub fn ref_count(&self) -> usize {
        match self.refs.load(Ordering::Acquire) {
            RELEASED => 0,
            n => n,
        }
    }

    pub fn is_released(&self) -> bool {
        self.refs.load(Ordering::Acquire) == RELEASED
    }

    /// Add a holder. Fails once the copy state was released.
    pub fn try_inc_ref(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == RELEASED {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a holder. Returns `true` if this call released the pinned handles.
    pub fn dec_ref(&self) -> bool {
        self.dec_ref_detached().is_some()
    }

    /// Drop a holder like [`dec_ref`](Self::dec_ref), but hand the pinned
    /// handles to the caller instead of releasing them in place, so they can
    /// be dropped after the caller's own locks are gone.
    pub(crate) fn dec_ref_detached(&self) -> Option<Pinned> {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            debug_assert!(
                current != 0 && current != RELEASED,
                "dec_ref on unreferenced copy state"
            );
            if current == 0 || current == RELEASED {
                tracing::warn!(checkpoint = %self.checkpoint, "dec_ref on unreferenced copy state");
                return None;
            }
            let next = if current == 1 { RELEASED } else { current - 1 };
            match self
                .refs
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == RELEASED => return Some(self.take_pinned()),
                Ok(_) => return None,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release a copy state nobody ever claimed.
    pub fn release_unreferenced(&self) -> bool {
        self.release_unreferenced_detached().is_some()
    }

    pub(crate) fn release_unreferenced_detached(&self) -> Option<Pinned> {
        self.refs
            .compare_exchange(0, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.take_pinned())
    }

    fn take_pinned(&self) -> Pinned {
        debug!(checkpoint = %self.checkpoint, "released copy state");
        std::mem::take(&mut *self.pinned.lock())
    }
}

impl fmt::Debug for CopyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyState")
            .field("checkpoint", &self.checkpoint)
            .field("files", &self.metadata_snapshot.len())
            .field("pending_delete_files", &self.pending_delete_files.len())
            .field("refs", &self.ref_count())
            .field("released", &self.is_released())
            .finish()
    }
}
