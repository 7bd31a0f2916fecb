//! Incremental, cacheable, cancellable structural search over treebanks.
//!
//! This crate orchestrates searches of partitioned treebank corpora:
//! - ShardResults: per-partition result caches shared by content key
//! - Queries: multi-partition searches with progress and late-bound filters
//! - Cache management with a byte budget and least-recently-used eviction
//! - A service facade running searches as background tasks

pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod filter;
pub mod lease;
pub mod match_record;
pub mod query;
pub mod service;
pub mod shard_result;
pub mod storage;
pub mod tree;
pub mod types;
pub mod variables;

#[cfg(test)]
mod testing;

// Re-export main types
pub use cache::{CacheManager, PurgeReport};
pub use cancel::{CancellationCheck, CancellationToken};
pub use catalog::{PartitionCatalog, StaticCatalog};
pub use config::{load_or_create_search_config, SearchConfig};
pub use context::SearchContext;
pub use engine::QueryEngine;
pub use error::{EngineError, Result, SearchError};
pub use filter::{Behaviour, FilterOp};
pub use match_record::SearchMatch;
pub use query::{Query, ResultPage};
pub use service::{CreateQueryRequest, PollRequest, PollResponse, SearchService};
pub use shard_result::{SearchOutcome, ShardResult};
pub use storage::{FileRepository, MemoryRepository, Repository};
pub use types::{
    PartitionId, PartitionStats, QueryId, Shard, ShardId, ShardResultId, Variable,
};
