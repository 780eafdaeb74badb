//! Disk-backed shard and a replica-side transport for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use segrep::transfer::{FileChunkAck, FileChunkRequest};
use segrep::{
    ClusterChangedEvent, ClusterService, ClusterStateListener, DiscoveryNode, GatedHandle, IndexCommit,
    IndexShard, IndicesService, MetadataSnapshot, NodeRoles, ReplicaTransport, SegmentInfos, ShardId,
    ShardState, StoreFileMetadata, TransportError,
};

pub fn shard_id() -> ShardId {
    ShardId::new("logs", "uuid-logs", 0)
}

pub fn replica(id: &str) -> DiscoveryNode {
    DiscoveryNode::new(id, format!("replica-{id}"), format!("10.0.0.{}:9300", id.len()))
}

/// Write `content` under `dir` and describe it.
pub fn segment_file(dir: &Path, name: &str, content: &[u8]) -> StoreFileMetadata {
    fs::write(dir.join(name), content).unwrap();
    StoreFileMetadata::new(name, content.len() as u64, format!("{:08x}", content.len()), "9.4.0")
}

/// A shard whose files live in a directory, with a fixed last commit and a
/// live segment set that may have moved past it.
pub struct DiskShard {
    id: ShardId,
    dir: PathBuf,
    commit: MetadataSnapshot,
    live: Mutex<(MetadataSnapshot, u64)>,
    state: Mutex<ShardState>,
    pub open_handles: Arc<AtomicUsize>,
}

impl DiskShard {
    pub fn new(dir: &Path, commit: Vec<StoreFileMetadata>, live: Vec<StoreFileMetadata>) -> Self {
        Self {
            id: shard_id(),
            dir: dir.to_path_buf(),
            commit: MetadataSnapshot::new(commit),
            live: Mutex::new((MetadataSnapshot::new(live), 1)),
            state: Mutex::new(ShardState::Started),
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the live segment set, as a refresh or merge would.
    pub fn refresh(&self, live: Vec<StoreFileMetadata>) {
        let mut current = self.live.lock();
        current.0 = MetadataSnapshot::new(live);
        current.1 += 1;
    }

    pub fn set_state(&self, state: ShardState) {
        *self.state.lock() = state;
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    fn handle<T>(&self, value: T) -> GatedHandle<T> {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        let open = self.open_handles.clone();
        GatedHandle::new(value, move || {
            open.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

impl IndexShard for DiskShard {
    fn shard_id(&self) -> &ShardId {
        &self.id
    }

    fn state(&self) -> ShardState {
        *self.state.lock()
    }

    fn operation_primary_term(&self) -> u64 {
        2
    }

    fn processed_local_checkpoint(&self) -> i64 {
        41
    }

    fn segment_infos_snapshot(&self) -> io::Result<GatedHandle<SegmentInfos>> {
        let version = self.live.lock().1;
        Ok(self.handle(SegmentInfos {
            generation: 1,
            version,
            encoded: Bytes::from(format!("infos-v{version}")),
        }))
    }

    fn acquire_last_index_commit(&self) -> io::Result<Option<GatedHandle<IndexCommit>>> {
        Ok(Some(self.handle(IndexCommit {
            generation: 1,
            segments_file_name: "segments_1".to_string(),
        })))
    }

    fn metadata_for_commit(&self, _commit: &IndexCommit) -> io::Result<MetadataSnapshot> {
        Ok(self.commit.clone())
    }

    fn metadata_for_infos(&self, _infos: &SegmentInfos) -> io::Result<MetadataSnapshot> {
        Ok(self.live.lock().0.clone())
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

#[derive(Default)]
pub struct Indices {
    shards: Mutex<HashMap<ShardId, Arc<dyn IndexShard>>>,
}

impl Indices {
    pub fn with(shard: Arc<dyn IndexShard>) -> Arc<Self> {
        let indices = Self::default();
        indices.shards.lock().insert(shard.shard_id().clone(), shard);
        Arc::new(indices)
    }
}

impl IndicesService for Indices {
    fn index_shard(&self, shard_id: &ShardId) -> Option<Arc<dyn IndexShard>> {
        self.shards.lock().get(shard_id).cloned()
    }
}

/// Replica side of the chunk transport: writes chunks into a per-node
/// directory and can be scripted to fail or stall.
pub struct ReplicaDisk {
    root: PathBuf,
    failures: Mutex<VecDeque<TransportError>>,
    delay: Mutex<Duration>,
    pub chunks: Mutex<Vec<(String, FileChunkRequest)>>,
    pub attempts: AtomicUsize,
}

impl ReplicaDisk {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            chunks: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn fail_next(&self, errors: Vec<TransportError>) {
        self.failures.lock().extend(errors);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    fn write_chunk(&self, node: &str, request: &FileChunkRequest) -> io::Result<()> {
        let dir = self.node_dir(node);
        fs::create_dir_all(&dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(&request.metadata.name))?;
        file.seek(SeekFrom::Start(request.position))?;
        file.write_all(&request.content)?;
        Ok(())
    }
}

#[async_trait]
impl ReplicaTransport for ReplicaDisk {
    async fn send_file_chunk(
        &self,
        target: &DiscoveryNode,
        request: &FileChunkRequest,
    ) -> Result<FileChunkAck, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.write_chunk(&target.id, request)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.chunks.lock().push((target.id.clone(), request.clone()));
        Ok(FileChunkAck::default())
    }
}

pub struct Cluster {
    roles: NodeRoles,
    listeners: Mutex<Vec<Arc<dyn ClusterStateListener>>>,
}

impl Cluster {
    pub fn data_node() -> Arc<Self> {
        Arc::new(Self {
            roles: NodeRoles::DATA,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn remove_node(&self, node: DiscoveryNode) {
        let event = ClusterChangedEvent {
            added_nodes: Vec::new(),
            removed_nodes: vec![node],
        };
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.cluster_changed(&event);
        }
    }
}

impl ClusterService for Cluster {
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
