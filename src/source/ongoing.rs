//! Registry of in-flight replication sessions on the primary.
//!
//! Sessions live in one arena keyed by [`SessionId`], with secondary indexes
//! by shard and by target node so cancellation can find them without a scan.
//! Copy states are cached per checkpoint: concurrent requests for the same
//! checkpoint share one build through a [`OnceCell`] slot, and the slot is
//! dropped once the copy state's last holder releases it.
//!
//! Completion, failure and cancellation all unregister a session the same
//! way, dropping exactly one copy state reference. Handles a released copy
//! state pinned go back to the store only after the registry lock is
//! dropped, so store callbacks may call back into the registry.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::checkpoint::{ReplicationCheckpoint, ShardId};
use crate::cluster::DiscoveryNode;
use crate::copy_state::{CopyState, Pinned};
use crate::error::{Result, SourceError};
use crate::shard::IndicesService;
use crate::source::handler::SegmentReplicationSourceHandler;
use crate::source::SessionId;
use crate::transfer::protocol::{CheckpointInfoRequest, GetSegmentFilesRequest, GetSegmentFilesResponse};
use crate::transfer::RemoteSegmentFileChunkWriter;

type CopyStateSlot = Arc<OnceCell<Arc<CopyState>>>;

#[derive(Default)]
struct Registry {
    handlers: HashMap<SessionId, Arc<SegmentReplicationSourceHandler>>,
    by_shard: HashMap<ShardId, HashSet<SessionId>>,
    by_node: HashMap<String, HashSet<SessionId>>,
    copy_states: HashMap<ReplicationCheckpoint, CopyStateSlot>,
}

impl Registry {
    fn insert(&mut self, handler: Arc<SegmentReplicationSourceHandler>) {
        let id = handler.session_id();
        self.by_shard.entry(handler.shard_id().clone()).or_default().insert(id);
        self.by_node.entry(handler.target().id.clone()).or_default().insert(id);
        self.handlers.insert(id, handler);
    }

    /// Drop a session from the arena and both indexes.
    fn take(&mut self, id: SessionId) -> Option<Arc<SegmentReplicationSourceHandler>> {
        let handler = self.handlers.remove(&id)?;
        remove_from_bucket(&mut self.by_shard, handler.shard_id(), id);
        remove_from_bucket(&mut self.by_node, &handler.target().id, id);
        Some(handler)
    }

    fn remove_slot_if(&mut self, checkpoint: &ReplicationCheckpoint, slot: &CopyStateSlot) {
        if self
            .copy_states
            .get(checkpoint)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            self.copy_states.remove(checkpoint);
        }
    }
}

/// A copy state slot this request waits on. Dropping it, on error or
/// because the request future was abandoned mid-build, removes the slot if
/// it was never filled and nobody else waits on it.
struct PendingSlot<'a> {
    registry: &'a Mutex<Registry>,
    checkpoint: &'a ReplicationCheckpoint,
    slot: CopyStateSlot,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let slot = std::mem::take(&mut self.slot);
        let mut inner = self.registry.lock();
        // the map and this waiter hold the only references
        if !slot.initialized() && Arc::strong_count(&slot) == 2 {
            inner.remove_slot_if(self.checkpoint, &slot);
            debug!(checkpoint = %self.checkpoint, "dropped abandoned copy state slot");
        }
        // released under the lock: the last waiter must see a count of two
        drop(slot);
    }
}

fn remove_from_bucket<K>(index: &mut HashMap<K, HashSet<SessionId>>, key: &K, id: SessionId)
where
    K: std::hash::Hash + Eq,
{
    if let Some(bucket) = index.get_mut(key) {
        bucket.remove(&id);
        if bucket.is_empty() {
            index.remove(key);
        }
    }
}

pub struct OngoingSegmentReplications {
    indices: Arc<dyn IndicesService>,
    inner: Mutex<Registry>,
}

impl OngoingSegmentReplications {
    pub fn new(indices: Arc<dyn IndicesService>) -> Self {
        Self {
            indices,
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Register a session for `request` and return its copy state.
    ///
    /// Reuses the cached copy state for the requested checkpoint or builds
    /// one. A concurrent request for the same checkpoint waits on the same
    /// build instead of starting its own.
    pub async fn prepare_for_replication(
        &self,
        request: &CheckpointInfoRequest,
        writer: RemoteSegmentFileChunkWriter,
    ) -> Result<Arc<CopyState>> {
        let session_id = request.session_id;
        let checkpoint = &request.checkpoint;

        loop {
            let pending = {
                let mut inner = self.inner.lock();
                if inner.handlers.contains_key(&session_id) {
                    return Err(SourceError::SessionAlreadyExists(session_id));
                }
                PendingSlot {
                    registry: &self.inner,
                    checkpoint,
                    slot: inner.copy_states.entry(checkpoint.clone()).or_default().clone(),
                }
            };

            let copy_state = pending
                .slot
                .get_or_try_init(|| self.build_copy_state(checkpoint))
                .await?
                .clone();

            let mut inner = self.inner.lock();
            if inner.handlers.contains_key(&session_id) {
                let pins = copy_state.release_unreferenced_detached();
                if pins.is_some() {
                    inner.remove_slot_if(checkpoint, &pending.slot);
                }
                drop(inner);
                drop(pins);
                return Err(SourceError::SessionAlreadyExists(session_id));
            }
            if !copy_state.try_inc_ref() {
                // Released between the build and now; start over with a fresh slot
                inner.remove_slot_if(checkpoint, &pending.slot);
                continue;
            }

            let handler = Arc::new(SegmentReplicationSourceHandler::new(
                session_id,
                request.target_node.clone(),
                copy_state.clone(),
                writer,
            ));
            inner.insert(handler);
            drop(inner);

            info!(
                session = %session_id,
                node = %request.target_node.id,
                checkpoint = %copy_state.checkpoint(),
                refs = copy_state.ref_count(),
                "prepared replication session"
            );
            return Ok(copy_state);
        }
    }

    async fn build_copy_state(&self, requested: &ReplicationCheckpoint) -> Result<Arc<CopyState>> {
        let shard = self.indices.index_shard(&requested.shard_id).ok_or_else(|| {
            SourceError::snapshot_unavailable(&requested.shard_id, "shard is not allocated on this node")
        })?;
        let requested = requested.clone();
        let copy_state = tokio::task::spawn_blocking(move || CopyState::new(requested, shard))
            .await
            .map_err(|e| SourceError::Internal(format!("copy state build panicked: {e}")))??;
        Ok(Arc::new(copy_state))
    }

    /// Serve the file request of a prepared session, then tear it down.
    ///
    /// A duplicate request for a session already serving files is rejected
    /// without touching the running copy.
    pub async fn start_segment_copy(&self, request: &GetSegmentFilesRequest) -> Result<GetSegmentFilesResponse> {
        let handler = self
            .inner
            .lock()
            .handlers
            .get(&request.session_id)
            .cloned()
            .ok_or(SourceError::SessionNotFound(request.session_id))?;

        let result = handler.send_files(request).await;
        if let Err(err @ SourceError::AlreadyReplicating(_)) = result {
            return Err(err);
        }
        self.remove(&handler);
        result.map(|files| GetSegmentFilesResponse { files })
    }

    /// Cancel every session targeting `node`.
    pub fn cancel_replication(&self, node: &DiscoveryNode) {
        let (removed, pins) = {
            let mut inner = self.inner.lock();
            let ids: Vec<_> = inner
                .by_node
                .get(&node.id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            Self::take_all(&mut inner, ids)
        };
        Self::cancel_handlers(removed, "node left the cluster");
        drop(pins);
    }

    /// Cancel every session replicating `shard_id`.
    pub fn cancel(&self, shard_id: &ShardId, reason: &str) {
        let (removed, pins) = {
            let mut inner = self.inner.lock();
            let ids: Vec<_> = inner
                .by_shard
                .get(shard_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            Self::take_all(&mut inner, ids)
        };
        Self::cancel_handlers(removed, reason);
        drop(pins);
    }

    /// Cancel one session. Returns `false` if it was not registered.
    pub fn cancel_session(&self, session_id: SessionId, reason: &str) -> bool {
        let (removed, pins) = {
            let mut inner = self.inner.lock();
            Self::take_all(&mut inner, vec![session_id])
        };
        let found = !removed.is_empty();
        Self::cancel_handlers(removed, reason);
        drop(pins);
        found
    }

    /// Unregister `ids`, returning their handlers and the handles of any
    /// copy state they were the last holders of. Both are for the caller to
    /// finish off once the lock is gone.
    fn take_all(
        inner: &mut Registry,
        ids: Vec<SessionId>,
    ) -> (Vec<Arc<SegmentReplicationSourceHandler>>, Vec<Pinned>) {
        let mut handlers = Vec::with_capacity(ids.len());
        let mut pins = Vec::new();
        for id in ids {
            let Some(handler) = inner.take(id) else { continue };
            pins.extend(Self::release_copy_state(inner, &handler));
            handlers.push(handler);
        }
        (handlers, pins)
    }

    fn cancel_handlers(handlers: Vec<Arc<SegmentReplicationSourceHandler>>, reason: &str) {
        for handler in handlers {
            handler.cancel(reason);
            debug!(
                session = %handler.session_id(),
                node = %handler.target().id,
                shard = %handler.shard_id(),
                reason,
                "cancelled replication session"
            );
        }
    }

    /// Unregister `handler` if it is still the registered session for its id.
    fn remove(&self, handler: &Arc<SegmentReplicationSourceHandler>) {
        let pins = {
            let mut inner = self.inner.lock();
            let registered = inner
                .handlers
                .get(&handler.session_id())
                .is_some_and(|current| Arc::ptr_eq(current, handler));
            if !registered {
                return;
            }
            inner.take(handler.session_id());
            Self::release_copy_state(&mut inner, handler)
        };
        drop(pins);
    }

    /// Drop the session's copy state reference. The last holder gets the
    /// pinned handles back and the cached slot is cleared.
    fn release_copy_state(inner: &mut Registry, handler: &SegmentReplicationSourceHandler) -> Option<Pinned> {
        let copy_state = handler.copy_state();
        let pins = copy_state.dec_ref_detached()?;
        let checkpoint = copy_state.requested_checkpoint();
        let stale = inner
            .copy_states
            .get(checkpoint)
            .is_some_and(|slot| slot.get().is_some_and(|cs| Arc::ptr_eq(cs, copy_state)));
        if stale {
            inner.copy_states.remove(checkpoint);
        }
        Some(pins)
    }

    /// Number of registered sessions.
    pub fn size(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    /// Number of cached copy states.
    pub fn copy_state_count(&self) -> usize {
        self.inner.lock().copy_states.len()
    }

    pub fn is_in_copy_state_map(&self, checkpoint: &ReplicationCheckpoint) -> bool {
        self.inner.lock().copy_states.contains_key(checkpoint)
    }

    /// Cached copy state for `checkpoint`, once built.
    pub fn copy_state(&self, checkpoint: &ReplicationCheckpoint) -> Option<Arc<CopyState>> {
        self.inner.lock().copy_states.get(checkpoint)?.get().cloned()
    }

    pub fn handler(&self, session_id: SessionId) -> Option<Arc<SegmentReplicationSourceHandler>> {
        self.inner.lock().handlers.get(&session_id).cloned()
    }

    pub fn sessions_for_shard(&self, shard_id: &ShardId) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .inner
            .lock()
            .by_shard
            .get(shard_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn sessions_for_node(&self, node_id: &str) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .inner
            .lock()
            .by_node
            .get(node_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl fmt::Debug for OngoingSegmentReplications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OngoingSegmentReplications")
            .field("sessions", &inner.handlers.len())
            .field("copy_states", &inner.copy_states.len())
            .finish()
    }
}
