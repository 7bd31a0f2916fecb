//! In-memory record tables shared by the repository implementations.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::types::{
    ContentKey, QueryDraft, QueryId, QueryRecord, ShardResultId, ShardResultRecord,
};

#[derive(Debug)]
pub(crate) struct RecordTable {
    next_shard_result_id: u64,
    shard_results: BTreeMap<ShardResultId, ShardResultRecord>,
    by_key: HashMap<ContentKey, ShardResultId>,
    queries: BTreeMap<QueryId, QueryRecord>,
}

impl Default for RecordTable {
    fn default() -> Self {
        Self {
            next_shard_result_id: 1,
            shard_results: BTreeMap::new(),
            by_key: HashMap::new(),
            queries: BTreeMap::new(),
        }
    }
}

impl RecordTable {
    pub(crate) fn from_records(
        shard_results: Vec<ShardResultRecord>,
        queries: Vec<QueryRecord>,
    ) -> Self {
        let mut table = Self::default();
        for record in shard_results {
            // A duplicate key can only come from a crash between writes; the
            // lower id wins since it was created first.
            table.next_shard_result_id = table.next_shard_result_id.max(record.id.0 + 1);
            if let Some(existing) = table.by_key.get(&record.key).copied() {
                if existing < record.id {
                    continue;
                }
                table.shard_results.remove(&existing);
            }
            table.by_key.insert(record.key.clone(), record.id);
            table.shard_results.insert(record.id, record);
        }
        for query in queries {
            table.queries.insert(query.id, query);
        }
        table
    }

    pub(crate) fn shard_result(&self, id: ShardResultId) -> Option<ShardResultRecord> {
        self.shard_results.get(&id).cloned()
    }

    pub(crate) fn find_shard_result(&self, key: &ContentKey) -> Option<ShardResultRecord> {
        self.by_key
            .get(key)
            .and_then(|id| self.shard_results.get(id))
            .cloned()
    }

    /// Returns the record and whether it was created.
    pub(crate) fn get_or_create_shard_result(
        &mut self,
        key: &ContentKey,
    ) -> (ShardResultRecord, bool) {
        if let Some(record) = self.find_shard_result(key) {
            return (record, false);
        }
        let id = ShardResultId(self.next_shard_result_id);
        self.next_shard_result_id += 1;
        let record = ShardResultRecord::new(id, key.clone());
        self.by_key.insert(key.clone(), id);
        self.shard_results.insert(id, record.clone());
        (record, true)
    }

    /// Stores `record`, merging access time, and returns the stored copy.
    pub(crate) fn save_shard_result(&mut self, record: &ShardResultRecord) -> ShardResultRecord {
        let mut stored = record.clone();
        if let Some(existing) = self.shard_results.get(&record.id) {
            stored.last_accessed_at = latest(existing.last_accessed_at, record.last_accessed_at);
        }
        self.next_shard_result_id = self.next_shard_result_id.max(record.id.0 + 1);
        self.by_key.insert(stored.key.clone(), stored.id);
        self.shard_results.insert(stored.id, stored.clone());
        stored
    }

    pub(crate) fn touch_shard_result(
        &mut self,
        id: ShardResultId,
        at: DateTime<Utc>,
    ) -> Option<ShardResultRecord> {
        let record = self.shard_results.get_mut(&id)?;
        record.last_accessed_at = latest(record.last_accessed_at, Some(at));
        Some(record.clone())
    }

    pub(crate) fn delete_shard_result(&mut self, id: ShardResultId) -> bool {
        match self.shard_results.remove(&id) {
            Some(record) => {
                if self.by_key.get(&record.key) == Some(&id) {
                    self.by_key.remove(&record.key);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn shard_results(&self) -> Vec<ShardResultRecord> {
        self.shard_results.values().cloned().collect()
    }

    pub(crate) fn create_query(&mut self, draft: QueryDraft) -> QueryRecord {
        let mut id = QueryId::new();
        while self.queries.contains_key(&id) {
            id = QueryId::new();
        }
        let record = QueryRecord::from_draft(id, draft);
        self.queries.insert(id, record.clone());
        record
    }

    pub(crate) fn query(&self, id: QueryId) -> Option<QueryRecord> {
        self.queries.get(&id).cloned()
    }

    pub(crate) fn save_query(&mut self, record: &QueryRecord) -> QueryRecord {
        let mut stored = record.clone();
        if let Some(existing) = self.queries.get(&record.id) {
            stored.cancelled |= existing.cancelled;
            stored.last_accessed_at = latest(existing.last_accessed_at, record.last_accessed_at);
        }
        self.queries.insert(stored.id, stored.clone());
        stored
    }

    pub(crate) fn touch_query(&mut self, id: QueryId, at: DateTime<Utc>) -> Option<QueryRecord> {
        let record = self.queries.get_mut(&id)?;
        record.last_accessed_at = latest(record.last_accessed_at, Some(at));
        Some(record.clone())
    }

    pub(crate) fn mark_query_cancelled(&mut self, id: QueryId) -> Option<QueryRecord> {
        let record = self.queries.get_mut(&id)?;
        record.cancelled = true;
        Some(record.clone())
    }

    pub(crate) fn delete_query(&mut self, id: QueryId) -> bool {
        self.queries.remove(&id).is_some()
    }

    pub(crate) fn queries_referencing(&self, id: ShardResultId) -> Vec<QueryRecord> {
        self.queries
            .values()
            .filter(|query| query.references(id))
            .cloned()
            .collect()
    }
}

fn latest(
    left: Option<DateTime<Utc>>,
    right: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.max(right)),
        (left, right) => left.or(right),
    }
}
