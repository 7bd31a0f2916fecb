//! Repository kept entirely in memory. Cache files still live on disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::table::RecordTable;
use super::{CacheLayout, Repository};
use crate::error::Result;
use crate::types::{ContentKey, QueryDraft, QueryId, QueryRecord, ShardResultId, ShardResultRecord};

#[derive(Debug)]
pub struct MemoryRepository {
    table: Mutex<RecordTable>,
    layout: CacheLayout,
}

impl MemoryRepository {
    pub fn new(layout: CacheLayout) -> Self {
        Self {
            table: Mutex::new(RecordTable::default()),
            layout,
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn shard_result(&self, id: ShardResultId) -> Result<Option<ShardResultRecord>> {
        Ok(self.table.lock().shard_result(id))
    }

    async fn get_or_create_shard_result(&self, key: &ContentKey) -> Result<ShardResultRecord> {
        Ok(self.table.lock().get_or_create_shard_result(key).0)
    }

    async fn save_shard_result(&self, record: &ShardResultRecord) -> Result<()> {
        self.table.lock().save_shard_result(record);
        Ok(())
    }

    async fn touch_shard_result(&self, id: ShardResultId, at: DateTime<Utc>) -> Result<()> {
        self.table.lock().touch_shard_result(id, at);
        Ok(())
    }

    async fn delete_shard_result(&self, id: ShardResultId) -> Result<bool> {
        let deleted = self.table.lock().delete_shard_result(id);
        self.layout.remove(id).await?;
        Ok(deleted)
    }

    async fn shard_results(&self) -> Result<Vec<ShardResultRecord>> {
        Ok(self.table.lock().shard_results())
    }

    async fn create_query(&self, draft: QueryDraft) -> Result<QueryRecord> {
        Ok(self.table.lock().create_query(draft))
    }

    async fn query(&self, id: QueryId) -> Result<Option<QueryRecord>> {
        Ok(self.table.lock().query(id))
    }

    async fn save_query(&self, record: &QueryRecord) -> Result<()> {
        self.table.lock().save_query(record);
        Ok(())
    }

    async fn touch_query(&self, id: QueryId, at: DateTime<Utc>) -> Result<()> {
        self.table.lock().touch_query(id, at);
        Ok(())
    }

    async fn mark_query_cancelled(&self, id: QueryId) -> Result<bool> {
        Ok(self.table.lock().mark_query_cancelled(id).is_some())
    }

    async fn delete_query(&self, id: QueryId) -> Result<bool> {
        Ok(self.table.lock().delete_query(id))
    }

    async fn queries_referencing(&self, id: ShardResultId) -> Result<Vec<QueryRecord>> {
        Ok(self.table.lock().queries_referencing(id))
    }
}
