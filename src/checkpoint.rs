//! Replication checkpoints and store file metadata.
//!
//! A checkpoint names one durable version of a shard. File metadata is what a
//! replica compares against its own store to decide which files to fetch.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one shard of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index_name: String,
    pub index_uuid: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index_name: impl Into<String>, index_uuid: impl Into<String>, shard: u32) -> Self {
        Self {
            index_name: index_name.into(),
            index_uuid: index_uuid.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index_name, self.shard)
    }
}

/// A specific durable version of a shard's segments.
///
/// Only checkpoints of the same shard are comparable; ordering is by primary
/// term, then segment infos generation, then segment infos version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationCheckpoint {
    pub shard_id: ShardId,
    /// Increases whenever a new primary is promoted
    pub primary_term: u64,
    /// Generation of the segment infos (`segments_N`)
    pub segments_gen: u64,
    /// Highest processed operation sequence number
    pub seq_no: i64,
    /// Segment infos version, bumped on every in-memory change
    pub segment_infos_version: u64,
}

impl ReplicationCheckpoint {
    pub fn new(
        shard_id: ShardId,
        primary_term: u64,
        segments_gen: u64,
        seq_no: i64,
        segment_infos_version: u64,
    ) -> Self {
        Self {
            shard_id,
            primary_term,
            segments_gen,
            seq_no,
            segment_infos_version,
        }
    }

    /// Compare against another checkpoint of the same shard.
    /// Returns `None` for checkpoints of different shards.
    pub fn compare(&self, other: &ReplicationCheckpoint) -> Option<Ordering> {
        if self.shard_id != other.shard_id {
            return None;
        }
        Some(
            self.primary_term
                .cmp(&other.primary_term)
                .then(self.segments_gen.cmp(&other.segments_gen))
                .then(self.segment_infos_version.cmp(&other.segment_infos_version)),
        )
    }

    pub fn is_ahead_of(&self, other: Option<&ReplicationCheckpoint>) -> bool {
        match other {
            None => true,
            Some(other) => self.compare(other) == Some(Ordering::Greater),
        }
    }
}

impl fmt::Display for ReplicationCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} term={} gen={} version={} seq_no={}",
            self.shard_id, self.primary_term, self.segments_gen, self.segment_infos_version, self.seq_no
        )
    }
}

/// Metadata of one file in a shard's store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    pub name: String,
    pub length: u64,
    pub checksum: String,
    /// Format version of the writer that produced the file
    pub written_by: String,
}

impl StoreFileMetadata {
    pub fn new(
        name: impl Into<String>,
        length: u64,
        checksum: impl Into<String>,
        written_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            length,
            checksum: checksum.into(),
            written_by: written_by.into(),
        }
    }

    /// Same name, length and checksum.
    pub fn is_same(&self, other: &StoreFileMetadata) -> bool {
        self.name == other.name && self.length == other.length && self.checksum == other.checksum
    }
}

/// Files of a commit or segment infos snapshot, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    files: BTreeMap<String, StoreFileMetadata>,
    commit_user_data: BTreeMap<String, String>,
    num_docs: u64,
}

/// Result of comparing a source snapshot against a target snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryDiff {
    /// Present on both sides with the same length and checksum
    pub identical: Vec<StoreFileMetadata>,
    /// Present on both sides but with different content
    pub different: Vec<StoreFileMetadata>,
    /// Present in the source, absent in the target
    pub missing: Vec<StoreFileMetadata>,
}

impl RecoveryDiff {
    pub fn size(&self) -> usize {
        self.identical.len() + self.different.len() + self.missing.len()
    }
}

impl MetadataSnapshot {
    pub fn new(files: impl IntoIterator<Item = StoreFileMetadata>) -> Self {
        Self {
            files: files.into_iter().map(|f| (f.name.clone(), f)).collect(),
            commit_user_data: BTreeMap::new(),
            num_docs: 0,
        }
    }

    pub fn with_user_data(mut self, user_data: BTreeMap<String, String>, num_docs: u64) -> Self {
        self.commit_user_data = user_data;
        self.num_docs = num_docs;
        self
    }

    pub fn get(&self, name: &str) -> Option<&StoreFileMetadata> {
        self.files.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoreFileMetadata> {
        self.files.values()
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn commit_user_data(&self) -> &BTreeMap<String, String> {
        &self.commit_user_data
    }

    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    /// Total bytes across all files.
    pub fn size_in_bytes(&self) -> u64 {
        self.files.values().map(|f| f.length).sum()
    }

    /// Partition this snapshot's files relative to `target`.
    pub fn recovery_diff(&self, target: &MetadataSnapshot) -> RecoveryDiff {
        let mut diff = RecoveryDiff::default();
        for file in self.files.values() {
            match target.get(&file.name) {
                None => diff.missing.push(file.clone()),
                Some(other) if other.is_same(file) => diff.identical.push(file.clone()),
                Some(_) => diff.different.push(file.clone()),
            }
        }
        diff
    }
}
