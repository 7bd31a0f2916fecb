//! Repository persisted as one postcard file per record.
//!
//! Layout under the state directory:
//! - `shard-results/<id>.bin`
//! - `queries/<uuid>.bin`
//!
//! Every write goes to a temp file that is renamed over the record file, so
//! a crash leaves either the old or the new record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::table::RecordTable;
use super::{CacheLayout, Repository};
use crate::error::{Result, SearchError};
use crate::types::{ContentKey, QueryDraft, QueryId, QueryRecord, ShardResultId, ShardResultRecord};

/// Record format version - increment when changing the stored records.
pub const RECORD_FORMAT_VERSION: u32 = 1;

const SHARD_RESULTS_DIR: &str = "shard-results";
const QUERIES_DIR: &str = "queries";
const RECORD_EXTENSION: &str = "bin";

#[derive(Serialize, Deserialize)]
struct StoredRecord<T> {
    version: u32,
    record: T,
}

pub struct FileRepository {
    root: PathBuf,
    table: Mutex<RecordTable>,
    /// Serializes table updates with their file writes so files land in the
    /// same order as the updates.
    write_lane: tokio::sync::Mutex<()>,
    layout: CacheLayout,
}

impl FileRepository {
    /// Opens the repository at `root`, loading every readable record.
    pub async fn open(root: impl Into<PathBuf>, layout: CacheLayout) -> Result<Self> {
        let root = root.into();
        for dir in [SHARD_RESULTS_DIR, QUERIES_DIR] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path).await.map_err(|error| {
                SearchError::Internal(format!(
                    "failed to create state directory {}: {error}",
                    path.display()
                ))
            })?;
        }

        let shard_results: Vec<ShardResultRecord> =
            load_records(&root.join(SHARD_RESULTS_DIR)).await?;
        let queries: Vec<QueryRecord> = load_records(&root.join(QUERIES_DIR)).await?;
        tracing::info!(
            "opened search state root={} shard_results={} queries={}",
            root.display(),
            shard_results.len(),
            queries.len()
        );

        Ok(Self {
            root,
            table: Mutex::new(RecordTable::from_records(shard_results, queries)),
            write_lane: tokio::sync::Mutex::new(()),
            layout,
        })
    }

    fn shard_result_path(&self, id: ShardResultId) -> PathBuf {
        self.root
            .join(SHARD_RESULTS_DIR)
            .join(format!("{id}.{RECORD_EXTENSION}"))
    }

    fn query_path(&self, id: QueryId) -> PathBuf {
        self.root
            .join(QUERIES_DIR)
            .join(format!("{id}.{RECORD_EXTENSION}"))
    }

    async fn write_shard_result(&self, record: &ShardResultRecord) -> Result<()> {
        write_record(&self.shard_result_path(record.id), record).await
    }

    async fn write_query(&self, record: &QueryRecord) -> Result<()> {
        write_record(&self.query_path(record.id), record).await
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn shard_result(&self, id: ShardResultId) -> Result<Option<ShardResultRecord>> {
        Ok(self.table.lock().shard_result(id))
    }

    async fn get_or_create_shard_result(&self, key: &ContentKey) -> Result<ShardResultRecord> {
        let _lane = self.write_lane.lock().await;
        let (record, created) = self.table.lock().get_or_create_shard_result(key);
        if created {
            self.write_shard_result(&record).await?;
        }
        Ok(record)
    }

    async fn save_shard_result(&self, record: &ShardResultRecord) -> Result<()> {
        let _lane = self.write_lane.lock().await;
        let stored = self.table.lock().save_shard_result(record);
        self.write_shard_result(&stored).await
    }

    async fn touch_shard_result(&self, id: ShardResultId, at: DateTime<Utc>) -> Result<()> {
        let _lane = self.write_lane.lock().await;
        let touched = self.table.lock().touch_shard_result(id, at);
        match touched {
            Some(record) => self.write_shard_result(&record).await,
            None => Ok(()),
        }
    }

    async fn delete_shard_result(&self, id: ShardResultId) -> Result<bool> {
        let _lane = self.write_lane.lock().await;
        let deleted = self.table.lock().delete_shard_result(id);
        remove_record(&self.shard_result_path(id)).await?;
        self.layout.remove(id).await?;
        Ok(deleted)
    }

    async fn shard_results(&self) -> Result<Vec<ShardResultRecord>> {
        Ok(self.table.lock().shard_results())
    }

    async fn create_query(&self, draft: QueryDraft) -> Result<QueryRecord> {
        let _lane = self.write_lane.lock().await;
        let record = self.table.lock().create_query(draft);
        self.write_query(&record).await?;
        Ok(record)
    }

    async fn query(&self, id: QueryId) -> Result<Option<QueryRecord>> {
        Ok(self.table.lock().query(id))
    }

    async fn save_query(&self, record: &QueryRecord) -> Result<()> {
        let _lane = self.write_lane.lock().await;
        let stored = self.table.lock().save_query(record);
        self.write_query(&stored).await
    }

    async fn touch_query(&self, id: QueryId, at: DateTime<Utc>) -> Result<()> {
        let _lane = self.write_lane.lock().await;
        let touched = self.table.lock().touch_query(id, at);
        match touched {
            Some(record) => self.write_query(&record).await,
            None => Ok(()),
        }
    }

    async fn mark_query_cancelled(&self, id: QueryId) -> Result<bool> {
        let _lane = self.write_lane.lock().await;
        let cancelled = self.table.lock().mark_query_cancelled(id);
        match cancelled {
            Some(record) => {
                self.write_query(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_query(&self, id: QueryId) -> Result<bool> {
        let _lane = self.write_lane.lock().await;
        let deleted = self.table.lock().delete_query(id);
        remove_record(&self.query_path(id)).await?;
        Ok(deleted)
    }

    async fn queries_referencing(&self, id: ShardResultId) -> Result<Vec<QueryRecord>> {
        Ok(self.table.lock().queries_referencing(id))
    }
}

async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let bytes = postcard::to_allocvec(&StoredRecord {
        version: RECORD_FORMAT_VERSION,
        record,
    })
    .map_err(|error| {
        SearchError::Serialization(format!(
            "failed to encode record {}: {error}",
            path.display()
        ))
    })?;

    let temp_path = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
    tokio::fs::write(&temp_path, bytes).await.map_err(|error| {
        SearchError::Internal(format!(
            "failed to write record {}: {error}",
            temp_path.display()
        ))
    })?;
    tokio::fs::rename(&temp_path, path).await.map_err(|error| {
        SearchError::Internal(format!(
            "failed to move record into place {}: {error}",
            path.display()
        ))
    })?;
    Ok(())
}

async fn remove_record(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(SearchError::Internal(format!(
            "failed to remove record {}: {error}",
            path.display()
        ))),
    }
}

async fn load_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|error| {
        SearchError::Internal(format!(
            "failed to list state directory {}: {error}",
            dir.display()
        ))
    })?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!("skipping unreadable record path={} error={error}", path.display());
                continue;
            }
        };
        match postcard::from_bytes::<StoredRecord<T>>(&bytes) {
            Ok(stored) if stored.version == RECORD_FORMAT_VERSION => records.push(stored.record),
            Ok(stored) => {
                tracing::warn!(
                    "skipping record with unsupported version path={} version={}",
                    path.display(),
                    stored.version
                );
            }
            Err(error) => {
                tracing::warn!("skipping undecodable record path={} error={error}", path.display());
            }
        }
    }

    Ok(records)
}
