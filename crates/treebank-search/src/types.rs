//! Core identifiers and persisted record types.
//!
//! The records here are plain data; behaviour lives in `shard_result` and
//! `query`, persistence in `storage`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a logical partition of the corpus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one physical shard inside a partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A shard together with its size as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub size_bytes: u64,
}

/// Repository-assigned identity of a ShardResult. Also names its cache file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShardResultId(pub u64);

impl fmt::Display for ShardResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque query identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A declared query variable: `path` is `<anchor>/<relative path>`, where the
/// anchor is `$node` or a previously declared variable name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub path: String,
}

impl Variable {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Identifies a ShardResult: identical keys share one cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    pub query_string: String,
    pub variables: Vec<Variable>,
    pub partition: PartitionId,
}

impl ContentKey {
    pub fn new(
        query_string: impl Into<String>,
        variables: Vec<Variable>,
        partition: PartitionId,
    ) -> Self {
        Self {
            query_string: query_string.into(),
            variables,
            partition,
        }
    }
}

/// Persisted state of one ShardResult.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardResultRecord {
    pub id: ShardResultId,
    pub key: ContentKey,
    pub num_results: u64,
    /// Sum of the sizes of the shards fully processed. Never decreases.
    pub completed_bytes: u64,
    /// Number of catalog shards processed, in catalog order.
    pub completed_shards: usize,
    /// Bytes of the cache file covered by the last checkpoint.
    pub cache_len: u64,
    pub search_completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub failed_shards: Vec<ShardId>,
    /// Set once the cache file is finalized (completed or cancelled run).
    pub cache_size_bytes: Option<u64>,
}

impl ShardResultRecord {
    pub fn new(id: ShardResultId, key: ContentKey) -> Self {
        Self {
            id,
            key,
            num_results: 0,
            completed_bytes: 0,
            completed_shards: 0,
            cache_len: 0,
            search_completed_at: None,
            last_accessed_at: None,
            errors: Vec::new(),
            failed_shards: Vec::new(),
            cache_size_bytes: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.search_completed_at.is_some()
    }

    /// Complete and without shard faults: nothing left to do.
    pub fn is_settled(&self) -> bool {
        self.is_complete() && self.failed_shards.is_empty()
    }

    pub fn is_unstarted(&self) -> bool {
        !self.is_complete() && self.completed_shards == 0 && self.completed_bytes == 0
    }

    pub fn errors_text(&self) -> String {
        let mut text = String::new();
        for error in &self.errors {
            text.push_str(error);
            text.push('\n');
        }
        text
    }
}

/// Fields a caller supplies to create a query; the repository assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDraft {
    pub query_string: String,
    pub variables: Vec<Variable>,
    pub partitions: BTreeSet<PartitionId>,
}

/// Persisted state of one Query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: QueryId,
    pub query_string: String,
    pub variables: Vec<Variable>,
    pub partitions: BTreeSet<PartitionId>,
    pub shard_results: BTreeMap<PartitionId, ShardResultId>,
    pub total_partition_bytes: u64,
    pub initialized: bool,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl QueryRecord {
    pub fn from_draft(id: QueryId, draft: QueryDraft) -> Self {
        Self {
            id,
            query_string: draft.query_string,
            variables: draft.variables,
            partitions: draft.partitions,
            shard_results: BTreeMap::new(),
            total_partition_bytes: 0,
            initialized: false,
            cancelled: false,
            created_at: Utc::now(),
            last_accessed_at: None,
        }
    }

    pub fn content_key(&self, partition: &PartitionId) -> ContentKey {
        ContentKey::new(
            self.query_string.clone(),
            self.variables.clone(),
            partition.clone(),
        )
    }

    pub fn references(&self, id: ShardResultId) -> bool {
        self.shard_results.values().any(|candidate| *candidate == id)
    }
}

/// Progress and counts for one partition of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub partition: PartitionId,
    pub number_of_results: u64,
    pub completed: bool,
    pub percentage: u8,
}

/// `floor(100 * done / max(1, total))`, or 100 when there is nothing to do.
pub fn completion_percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percentage = (u128::from(done) * 100) / u128::from(total.max(1));
    percentage.min(100) as u8
}
