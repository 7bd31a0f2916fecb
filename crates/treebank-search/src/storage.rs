//! Persistence of ShardResult and Query records.
//!
//! The [`Repository`] is the only place records are created, looked up and
//! deleted. Content-key uniqueness is enforced here with explicit key lookups.

mod file;
mod memory;
mod table;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ContentKey, QueryDraft, QueryId, QueryRecord, ShardResultId, ShardResultRecord};

pub use file::FileRepository;
pub use memory::MemoryRepository;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn shard_result(&self, id: ShardResultId) -> Result<Option<ShardResultRecord>>;

    /// The record for `key`, created (with a fresh id) when none exists.
    async fn get_or_create_shard_result(&self, key: &ContentKey) -> Result<ShardResultRecord>;

    /// Stores progress fields. `last_accessed_at` never moves backwards.
    async fn save_shard_result(&self, record: &ShardResultRecord) -> Result<()>;

    /// Bumps only `last_accessed_at`; a missing record is ignored.
    async fn touch_shard_result(&self, id: ShardResultId, at: DateTime<Utc>) -> Result<()>;

    /// Deletes the record and its cache file. Returns false when unknown.
    async fn delete_shard_result(&self, id: ShardResultId) -> Result<bool>;

    async fn shard_results(&self) -> Result<Vec<ShardResultRecord>>;

    async fn create_query(&self, draft: QueryDraft) -> Result<QueryRecord>;

    async fn query(&self, id: QueryId) -> Result<Option<QueryRecord>>;

    /// Stores the query. `cancelled` is sticky and `last_accessed_at` never
    /// moves backwards, whatever the saved copy says.
    async fn save_query(&self, record: &QueryRecord) -> Result<()>;

    async fn touch_query(&self, id: QueryId, at: DateTime<Utc>) -> Result<()>;

    /// Returns false when the query is unknown.
    async fn mark_query_cancelled(&self, id: QueryId) -> Result<bool>;

    /// Deletes the query record only. Returns false when unknown.
    async fn delete_query(&self, id: QueryId) -> Result<bool>;

    async fn queries_referencing(&self, id: ShardResultId) -> Result<Vec<QueryRecord>>;
}

pub type SharedRepository = Arc<dyn Repository>;

/// Where ShardResult cache files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    dir: PathBuf,
}

impl CacheLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: ShardResultId) -> PathBuf {
        self.dir.join(format!("{id}.matches"))
    }

    /// Removes the cache file of `id`; a missing file is not an error.
    pub async fn remove(&self, id: ShardResultId) -> Result<()> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("removed cache file path={}", path.display());
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cache_files_are_named_by_id() {
        let layout = CacheLayout::new("/var/cache/search");
        assert_eq!(
            layout.path_for(ShardResultId(17)),
            PathBuf::from("/var/cache/search/17.matches")
        );
    }

    #[tokio::test]
    async fn removing_missing_file_is_ok() {
        let dir = tempdir().expect("tempdir");
        let layout = CacheLayout::new(dir.path());
        layout.remove(ShardResultId(1)).await.expect("remove missing");

        tokio::fs::write(layout.path_for(ShardResultId(2)), b"<match></match>")
            .await
            .expect("write");
        layout.remove(ShardResultId(2)).await.expect("remove");
        assert!(!layout.path_for(ShardResultId(2)).exists());
    }
}
