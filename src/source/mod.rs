//! Replication source: session registry, per-session handlers, and the
//! service answering replica requests.

pub mod handler;
pub mod ongoing;
pub mod server;
pub mod service;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use handler::{SegmentReplicationSourceHandler, SessionState};
pub use ongoing::OngoingSegmentReplications;
pub use server::serve_connection;
pub use service::{actions, SegmentReplicationSourceService};

/// Replication session id, chosen by the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
