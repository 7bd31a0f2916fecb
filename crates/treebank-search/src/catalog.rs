//! Partition catalog: which shards make up a partition, and how big they are.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::types::{PartitionId, Shard, ShardId};

/// Read-only view of the corpus layout.
pub trait PartitionCatalog: Send + Sync {
    /// Shards of `partition` in catalog order.
    fn shards_of(&self, partition: &PartitionId) -> Result<Vec<Shard>>;

    fn total_bytes(&self, partition: &PartitionId) -> Result<u64> {
        Ok(self
            .shards_of(partition)?
            .iter()
            .map(|shard| shard.size_bytes)
            .sum())
    }

    fn contains(&self, partition: &PartitionId) -> bool {
        self.shards_of(partition).is_ok()
    }
}

/// A catalog held in memory, typically loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticCatalog {
    partitions: BTreeMap<PartitionId, Vec<Shard>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition<I, S>(mut self, partition: &str, shards: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        self.insert(
            PartitionId::new(partition),
            shards
                .into_iter()
                .map(|(id, size_bytes)| Shard {
                    id: ShardId::new(id),
                    size_bytes,
                })
                .collect(),
        );
        self
    }

    pub fn insert(&mut self, partition: PartitionId, shards: Vec<Shard>) {
        self.partitions.insert(partition, shards);
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|error| SearchError::Config(format!("invalid partition catalog: {error}")))
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionId> {
        self.partitions.keys()
    }
}

impl PartitionCatalog for StaticCatalog {
    fn shards_of(&self, partition: &PartitionId) -> Result<Vec<Shard>> {
        self.partitions
            .get(partition)
            .cloned()
            .ok_or_else(|| SearchError::UnknownPartition(partition.clone()))
    }
}
