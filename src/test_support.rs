//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::{MetadataSnapshot, ShardId, StoreFileMetadata};
use crate::cluster::{ClusterChangedEvent, ClusterService, ClusterStateListener, DiscoveryNode, NodeRoles};
use crate::error::TransportError;
use crate::shard::{GatedHandle, IndexCommit, IndexShard, IndicesService, SegmentInfos, ShardState};
use crate::transfer::protocol::{FileChunkAck, FileChunkRequest};
use crate::transfer::ReplicaTransport;

pub(crate) fn meta(name: &str, checksum: &str) -> StoreFileMetadata {
    StoreFileMetadata::new(name, 1, checksum, "9.4.0")
}

pub(crate) fn node(id: &str) -> DiscoveryNode {
    DiscoveryNode::new(id, format!("name-{id}"), format!("{id}:9300"))
}

type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct FakeShard {
    shard_id: ShardId,
    state: Mutex<ShardState>,
    commit: Option<MetadataSnapshot>,
    live: MetadataSnapshot,
    dir: PathBuf,
    build_delay: Duration,
    infos_acquired: AtomicUsize,
    infos_released: Arc<AtomicUsize>,
    commits_acquired: AtomicUsize,
    commits_released: Arc<AtomicUsize>,
    on_infos_release: Arc<Mutex<Option<ReleaseHook>>>,
}

impl FakeShard {
    pub(crate) fn new(
        shard_id: ShardId,
        commit_files: Vec<StoreFileMetadata>,
        live_files: Vec<StoreFileMetadata>,
    ) -> Self {
        Self {
            shard_id,
            state: Mutex::new(ShardState::Started),
            commit: Some(MetadataSnapshot::new(commit_files)),
            live: MetadataSnapshot::new(live_files),
            dir: PathBuf::from("/nonexistent"),
            build_delay: Duration::ZERO,
            infos_acquired: AtomicUsize::new(0),
            infos_released: Arc::new(AtomicUsize::new(0)),
            commits_acquired: AtomicUsize::new(0),
            commits_released: Arc::new(AtomicUsize::new(0)),
            on_infos_release: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn without_commit(mut self) -> Self {
        self.commit = None;
        self
    }

    pub(crate) fn with_dir(mut self, dir: PathBuf) -> Self {
        self.dir = dir;
        self
    }

    pub(crate) fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Run `hook` whenever pinned segment infos go back to the store.
    pub(crate) fn on_infos_release(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_infos_release.lock() = Some(Arc::new(hook));
    }

    pub(crate) fn set_state(&self, state: ShardState) {
        *self.state.lock() = state;
    }

    pub(crate) fn infos_acquired(&self) -> usize {
        self.infos_acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn infos_released(&self) -> usize {
        self.infos_released.load(Ordering::SeqCst)
    }

    pub(crate) fn commits_acquired(&self) -> usize {
        self.commits_acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn commits_released(&self) -> usize {
        self.commits_released.load(Ordering::SeqCst)
    }
}

impl IndexShard for FakeShard {
    fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    fn state(&self) -> ShardState {
        *self.state.lock()
    }

    fn operation_primary_term(&self) -> u64 {
        1
    }

    fn processed_local_checkpoint(&self) -> i64 {
        1
    }

    fn segment_infos_snapshot(&self) -> io::Result<GatedHandle<SegmentInfos>> {
        if !self.build_delay.is_zero() {
            std::thread::sleep(self.build_delay);
        }
        self.infos_acquired.fetch_add(1, Ordering::SeqCst);
        let released = self.infos_released.clone();
        let hook = self.on_infos_release.clone();
        Ok(GatedHandle::new(
            SegmentInfos {
                generation: 0,
                version: 0,
                encoded: Bytes::from_static(b"infos"),
            },
            move || {
                released.fetch_add(1, Ordering::SeqCst);
                let hook = hook.lock().clone();
                if let Some(hook) = hook {
                    hook();
                }
            },
        ))
    }

    fn acquire_last_index_commit(&self) -> io::Result<Option<GatedHandle<IndexCommit>>> {
        if self.commit.is_none() {
            return Ok(None);
        }
        self.commits_acquired.fetch_add(1, Ordering::SeqCst);
        let released = self.commits_released.clone();
        Ok(Some(GatedHandle::new(
            IndexCommit {
                generation: 1,
                segments_file_name: "segments_1".to_string(),
            },
            move || {
                released.fetch_add(1, Ordering::SeqCst);
            },
        )))
    }

    fn metadata_for_commit(&self, _commit: &IndexCommit) -> io::Result<MetadataSnapshot> {
        self.commit
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no commit"))
    }

    fn metadata_for_infos(&self, _infos: &SegmentInfos) -> io::Result<MetadataSnapshot> {
        Ok(self.live.clone())
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

#[derive(Default)]
pub(crate) struct FakeIndices {
    shards: Mutex<HashMap<ShardId, Arc<dyn IndexShard>>>,
}

impl FakeIndices {
    pub(crate) fn add(&self, shard: Arc<dyn IndexShard>) {
        self.shards.lock().insert(shard.shard_id().clone(), shard);
    }
}

impl IndicesService for FakeIndices {
    fn index_shard(&self, shard_id: &ShardId) -> Option<Arc<dyn IndexShard>> {
        self.shards.lock().get(shard_id).cloned()
    }
}

pub(crate) struct FakeCluster {
    roles: NodeRoles,
    listeners: Mutex<Vec<Arc<dyn ClusterStateListener>>>,
}

impl FakeCluster {
    pub(crate) fn new(roles: NodeRoles) -> Self {
        Self {
            roles,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn publish(&self, event: &ClusterChangedEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.cluster_changed(event);
        }
    }
}

impl ClusterService for FakeCluster {
    fn local_node_roles(&self) -> NodeRoles {
        self.roles
    }

    fn add_listener(&self, listener: Arc<dyn ClusterStateListener>) {
        self.listeners.lock().push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn ClusterStateListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }
}

/// Transport that records chunks and fails according to a script.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    failures: Mutex<VecDeque<TransportError>>,
    pub(crate) chunks: Mutex<Vec<FileChunkRequest>>,
    pub(crate) attempts: AtomicUsize,
    delay: Mutex<Duration>,
    throttle: Mutex<Duration>,
}

impl ScriptedTransport {
    pub(crate) fn failing_with(errors: Vec<TransportError>) -> Self {
        Self {
            failures: Mutex::new(errors.into()),
            ..Default::default()
        }
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn set_throttle(&self, throttle: Duration) {
        *self.throttle.lock() = throttle;
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn delivered(&self) -> Vec<FileChunkRequest> {
        self.chunks.lock().clone()
    }
}

#[async_trait]
impl ReplicaTransport for ScriptedTransport {
    async fn send_file_chunk(
        &self,
        _target: &DiscoveryNode,
        request: &FileChunkRequest,
    ) -> Result<FileChunkAck, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.failures.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        self.chunks.lock().push(request.clone());
        Ok(FileChunkAck {
            throttle_time_ms: self.throttle.lock().as_millis() as u64,
        })
    }
}
