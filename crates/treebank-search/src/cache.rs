//! Byte budget over all ShardResult cache files.

use chrono::{DateTime, Utc};

use crate::context::SearchContext;
use crate::error::Result;
use crate::types::{ShardResultId, ShardResultRecord};

/// Summary of one purge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub total_bytes_before: u64,
    pub deleted: Vec<ShardResultId>,
    pub freed_bytes: u64,
    /// Whether the cache is within budget after the run.
    pub within_budget: bool,
}

#[derive(Clone)]
pub struct CacheManager {
    context: SearchContext,
}

impl CacheManager {
    pub fn new(context: SearchContext) -> Self {
        Self { context }
    }

    /// Evicts least recently accessed ShardResults until the finalized cache
    /// files fit in `max_total_bytes`.
    ///
    /// ShardResults referenced by a query accessed within the recent-activity
    /// window are kept, and so are ShardResults whose search is running.
    pub async fn purge(&self, max_total_bytes: u64) -> Result<PurgeReport> {
        let records = self.context.repository.shard_results().await?;
        let total_bytes: u64 = records.iter().filter_map(|record| record.cache_size_bytes).sum();
        let mut report = PurgeReport {
            total_bytes_before: total_bytes,
            within_budget: total_bytes <= max_total_bytes,
            ..PurgeReport::default()
        };
        if report.within_budget {
            tracing::info!("cache size ok total_bytes={total_bytes} budget={max_total_bytes}");
            return Ok(report);
        }

        let mut candidates = records
            .into_iter()
            .filter(|record| record.cache_size_bytes.is_some())
            .collect::<Vec<_>>();
        // Never-accessed records sort first.
        candidates.sort_by_key(|record| (record.last_accessed_at, record.id));

        // An unrepresentable window protects every referenced ShardResult.
        let recent_cutoff = self
            .context
            .config
            .recent_activity_window()
            .and_then(|window| Utc::now().checked_sub_signed(window));
        if recent_cutoff.is_none() {
            tracing::warn!(
                "recent activity window out of range hours={}, keeping referenced results",
                self.context.config.recent_activity_hours
            );
        }
        let mut remaining = total_bytes;
        for record in candidates {
            if remaining <= max_total_bytes {
                break;
            }
            if self.recently_used(&record, recent_cutoff).await? {
                continue;
            }
            let Some(_lease) = self.context.leases.try_acquire(record.id) else {
                tracing::debug!("skipping busy shard result id={}", record.id);
                continue;
            };
            // Re-read under the lease: a search may have grown the file.
            let Some(current) = self.context.repository.shard_result(record.id).await? else {
                continue;
            };
            let size = current.cache_size_bytes.unwrap_or(0);
            self.context.repository.delete_shard_result(record.id).await?;
            remaining = remaining.saturating_sub(size);
            report.freed_bytes += size;
            report.deleted.push(record.id);
        }

        report.within_budget = remaining <= max_total_bytes;
        if report.within_budget {
            tracing::info!(
                "purged cache deleted={} freed_bytes={}",
                report.deleted.len(),
                report.freed_bytes
            );
        } else {
            tracing::warn!(
                "purged cache but still over budget deleted={} remaining_bytes={remaining} budget={max_total_bytes}",
                report.deleted.len()
            );
        }
        Ok(report)
    }

    /// Deletes every ShardResult and its cache file, waiting for running
    /// searches to release them. Returns the number deleted.
    pub async fn delete_all(&self) -> Result<usize> {
        let records = self.context.repository.shard_results().await?;
        let mut deleted = 0usize;
        for record in records {
            let _lease = self.context.leases.acquire(record.id).await;
            if self.context.repository.delete_shard_result(record.id).await? {
                deleted += 1;
            }
        }
        tracing::info!("emptied cache deleted={deleted}");
        Ok(deleted)
    }

    async fn recently_used(
        &self,
        record: &ShardResultRecord,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let queries = self.context.repository.queries_referencing(record.id).await?;
        Ok(queries.iter().any(|query| {
            cutoff.map_or(true, |cutoff| {
                query.last_accessed_at.unwrap_or(query.created_at) >= cutoff
            })
        }))
    }
}
