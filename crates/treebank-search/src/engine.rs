//! Boundary to the external XML query engine.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::types::ShardId;

/// The engine that executes structural queries against a single shard.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Raw text holding zero or more `<match>...</match>` records.
    async fn search(&self, shard: &ShardId, query: &str) -> Result<String, EngineError>;

    /// Number of matches of `query` in `shard`, without returning them.
    async fn count(&self, shard: &ShardId, query: &str) -> Result<u64, EngineError>;
}

/// Runs a search call, failing with [`EngineError::Timeout`] after `limit`.
pub async fn search_with_timeout(
    engine: &dyn QueryEngine,
    shard: &ShardId,
    query: &str,
    limit: Duration,
) -> Result<String, EngineError> {
    match tokio::time::timeout(limit, engine.search(shard, query)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(limit)),
    }
}

/// Runs a count call, failing with [`EngineError::Timeout`] after `limit`.
pub async fn count_with_timeout(
    engine: &dyn QueryEngine,
    shard: &ShardId,
    query: &str,
    limit: Duration,
) -> Result<u64, EngineError> {
    match tokio::time::timeout(limit, engine.count(shard, query)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(limit)),
    }
}
