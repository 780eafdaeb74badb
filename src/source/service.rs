//! Primary-side entry point for replication requests.
//!
//! Answers the two inbound actions, bounds how many run at once, and cancels
//! sessions when their target leaves the cluster or their shard closes.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace};

use crate::checkpoint::ShardId;
use crate::cluster::{ClusterChangedEvent, ClusterService, ClusterStateListener, DiscoveryNode, IndexEventListener, NodeRoles};
use crate::config::ReplicationSettings;
use crate::error::{Result, SourceError};
use crate::shard::{IndexShard, IndicesService};
use crate::source::ongoing::OngoingSegmentReplications;
use crate::source::SessionId;
use crate::transfer::protocol::{
    CheckpointInfoRequest, CheckpointInfoResponse, GetSegmentFilesRequest, GetSegmentFilesResponse,
};
use crate::transfer::{RemoteSegmentFileChunkWriter, ReplicaTransport, RetryPolicy, RetryableTransportClient};

/// Transport action names.
pub mod actions {
    pub const GET_CHECKPOINT_INFO: &str = "internal:index/shard/replication/get_checkpoint_info";
    pub const GET_SEGMENT_FILES: &str = "internal:index/shard/replication/get_segment_files";
    /// Handled by the target; the source only sends it.
    pub const FILE_CHUNK: &str = "internal:index/shard/replication/file_chunk";
}

/// Counters shared by every session of the service.
#[derive(Debug, Default)]
struct Totals {
    bytes_sent: Arc<AtomicU64>,
    throttle_ms: Arc<AtomicU64>,
}

pub struct SegmentReplicationSourceService {
    settings: ReplicationSettings,
    transport: Arc<dyn ReplicaTransport>,
    cluster: Arc<dyn ClusterService>,
    ongoing: Arc<OngoingSegmentReplications>,
    permits: Arc<Semaphore>,
    totals: Totals,
    listener: Mutex<Option<Arc<dyn ClusterStateListener>>>,
}

impl SegmentReplicationSourceService {
    pub fn new(
        settings: ReplicationSettings,
        indices: Arc<dyn IndicesService>,
        transport: Arc<dyn ReplicaTransport>,
        cluster: Arc<dyn ClusterService>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        Ok(Arc::new(Self {
            permits: Arc::new(Semaphore::new(settings.max_concurrent_requests)),
            ongoing: Arc::new(OngoingSegmentReplications::new(indices)),
            settings,
            transport,
            cluster,
            totals: Totals::default(),
            listener: Mutex::new(None),
        }))
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    pub fn ongoing_replications(&self) -> &Arc<OngoingSegmentReplications> {
        &self.ongoing
    }

    /// Bytes acknowledged by replicas across all sessions.
    pub fn total_bytes_sent(&self) -> u64 {
        self.totals.bytes_sent.load(Ordering::Relaxed)
    }

    /// Throttle time reported back by replicas across all sessions.
    pub fn total_throttle_time(&self) -> Duration {
        Duration::from_millis(self.totals.throttle_ms.load(Ordering::Relaxed))
    }

    /// Subscribe to cluster changes. Only data nodes hold shards to serve.
    ///
    /// The cluster service only gets a weak handle; dropping the last
    /// reference to this service unsubscribes it.
    pub fn start(self: &Arc<Self>) {
        if !self.cluster.local_node_roles().contains(NodeRoles::DATA) {
            debug!("not a data node, segment replication source stays idle");
            return;
        }
        let mut registered = self.listener.lock();
        if registered.is_none() {
            let listener: Arc<dyn ClusterStateListener> = Arc::new(SourceClusterListener(Arc::downgrade(self)));
            self.cluster.add_listener(listener.clone());
            *registered = Some(listener);
            info!("segment replication source started");
        }
    }

    pub fn stop(&self) {
        if !self.cluster.local_node_roles().contains(NodeRoles::DATA) {
            return;
        }
        if let Some(listener) = self.listener.lock().take() {
            self.cluster.remove_listener(&listener);
            info!("segment replication source stopped");
        }
    }

    /// Answer `internal:index/shard/replication/get_checkpoint_info`.
    pub async fn handle_checkpoint_info(&self, request: &CheckpointInfoRequest) -> Result<CheckpointInfoResponse> {
        let _permit = self.acquire_permit().await?;
        let writer = self.chunk_writer(
            request.session_id,
            &request.target_node,
            &request.checkpoint.shard_id,
        );

        let prepare = self.ongoing.prepare_for_replication(request, writer);
        let copy_state = tokio::time::timeout(self.settings.checkpoint_info_timeout(), prepare)
            .await
            .map_err(|_| SourceError::Timeout(actions::GET_CHECKPOINT_INFO.to_string()))??;

        Ok(CheckpointInfoResponse {
            checkpoint: copy_state.checkpoint().clone(),
            metadata_snapshot: copy_state.metadata_snapshot().clone(),
            infos_bytes: copy_state.infos_bytes().to_vec(),
            pending_delete_files: copy_state.pending_delete_files().to_vec(),
        })
    }

    /// Answer `internal:index/shard/replication/get_segment_files`.
    pub async fn handle_get_segment_files(&self, request: &GetSegmentFilesRequest) -> Result<GetSegmentFilesResponse> {
        let _permit = self.acquire_permit().await?;
        self.ongoing.start_segment_copy(request).await
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SourceError::Internal("request pool is closed".to_string()))
    }

    fn chunk_writer(&self, session_id: SessionId, target: &DiscoveryNode, shard_id: &ShardId) -> RemoteSegmentFileChunkWriter {
        let client = RetryableTransportClient::new(
            self.transport.clone(),
            target.clone(),
            RetryPolicy::from_settings(&self.settings),
        );
        let throttle_ms = self.totals.throttle_ms.clone();
        let node = target.id.clone();
        RemoteSegmentFileChunkWriter::new(
            session_id,
            shard_id.clone(),
            &self.settings,
            client,
            self.totals.bytes_sent.clone(),
            move |throttle| {
                throttle_ms.fetch_add(throttle.as_millis() as u64, Ordering::Relaxed);
                trace!(session = %session_id, node = %node, throttle_ms = throttle.as_millis() as u64, "replica throttled");
            },
        )
    }
}

impl Drop for SegmentReplicationSourceService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forwards cluster changes to a live service.
struct SourceClusterListener(Weak<SegmentReplicationSourceService>);

impl ClusterStateListener for SourceClusterListener {
    fn cluster_changed(&self, event: &ClusterChangedEvent) {
        if let Some(service) = self.0.upgrade() {
            service.cluster_changed(event);
        }
    }
}

impl ClusterStateListener for SegmentReplicationSourceService {
    fn cluster_changed(&self, event: &ClusterChangedEvent) {
        if !event.nodes_removed() {
            return;
        }
        for node in &event.removed_nodes {
            self.ongoing.cancel_replication(node);
        }
    }
}

impl IndexEventListener for SegmentReplicationSourceService {
    fn before_index_shard_closed(&self, shard_id: &ShardId, shard: Option<&Arc<dyn IndexShard>>) {
        if shard.is_some() {
            self.ongoing.cancel(shard_id, "shard is closed");
        }
    }
}
