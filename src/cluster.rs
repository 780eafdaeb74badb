//! Cluster membership and shard lifecycle collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::checkpoint::ShardId;
use crate::shard::IndexShard;

/// A cluster member. Identity is the node id alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: String,
    pub name: String,
    pub address: String,
}

impl DiscoveryNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
        }
    }
}

impl PartialEq for DiscoveryNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DiscoveryNode {}

impl Hash for DiscoveryNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{{{}}}{{{}}}", self.name, self.id, self.address)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeRoles: u8 {
        const DATA = 1 << 0;
        const CLUSTER_MANAGER = 1 << 1;
        const INGEST = 1 << 2;
    }
}

/// Delta between two published cluster states.
#[derive(Debug, Clone, Default)]
pub struct ClusterChangedEvent {
    pub added_nodes: Vec<DiscoveryNode>,
    pub removed_nodes: Vec<DiscoveryNode>,
}

impl ClusterChangedEvent {
    pub fn nodes_removed(&self) -> bool {
        !self.removed_nodes.is_empty()
    }
}

pub trait ClusterStateListener: Send + Sync {
    fn cluster_changed(&self, event: &ClusterChangedEvent);
}

pub trait IndexEventListener: Send + Sync {
    /// Called before a local shard closes. `shard` is `None` if the shard
    /// was never fully created.
    fn before_index_shard_closed(&self, shard_id: &ShardId, shard: Option<&Arc<dyn IndexShard>>);
}

pub trait ClusterService: Send + Sync {
    /// Roles configured for the local node.
    fn local_node_roles(&self) -> NodeRoles;

    fn add_listener(&self, listener: Arc<dyn ClusterStateListener>);

    /// Remove a listener previously added; matched by pointer identity.
    fn remove_listener(&self, listener: &Arc<dyn ClusterStateListener>);
}
