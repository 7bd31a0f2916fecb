//! A user search request spanning one or more partitions.
//!
//! A [`Query`] owns one ShardResult per partition, shared by content key with
//! every other query asking the same thing. Filters are process-local and
//! rebuilt per request; everything else lives in the repository.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;

use crate::cancel::{CancellationCheck, CancellationToken};
use crate::context::SearchContext;
use crate::engine::count_with_timeout;
use crate::error::{Result, SearchError};
use crate::filter::{Behaviour, FilterOp, FilterPipeline};
use crate::match_record::SearchMatch;
use crate::shard_result::{SearchOutcome, ShardResult};
use crate::storage::Repository;
use crate::types::{
    completion_percentage, PartitionId, PartitionStats, QueryDraft, QueryId, QueryRecord,
    ShardResultId, ShardResultRecord,
};
use crate::variables::resolve_variables;

/// A page of results plus progress.
#[derive(Debug, Clone)]
pub struct ResultPage {
    pub matches: Vec<SearchMatch>,
    /// Overall completion, 0 to 100.
    pub percentage: u8,
    pub stats: Vec<PartitionStats>,
    /// Matches available in partition order before slicing; pass it back as
    /// `from` to continue.
    pub next_cursor: usize,
}

pub struct Query {
    id: QueryId,
    context: SearchContext,
    filters: FilterPipeline,
}

impl Query {
    /// Persists a new, uninitialized query.
    pub async fn create(context: SearchContext, draft: QueryDraft) -> Result<Self> {
        if draft.partitions.is_empty() {
            return Err(SearchError::InvalidInput(
                "a query needs at least one partition".to_string(),
            ));
        }
        let record = context.repository.create_query(draft).await?;
        tracing::info!(
            "created query id={} partitions={}",
            record.id,
            record.partitions.len()
        );
        Ok(Self::with_context(record.id, context))
    }

    pub async fn load(context: SearchContext, id: QueryId) -> Result<Self> {
        if context.repository.query(id).await?.is_none() {
            return Err(SearchError::QueryNotFound(id));
        }
        Ok(Self::with_context(id, context))
    }

    fn with_context(id: QueryId, context: SearchContext) -> Self {
        let filters = FilterPipeline::new(context.expander.clone(), context.annotator.clone());
        Self {
            id,
            context,
            filters,
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub async fn record(&self) -> Result<QueryRecord> {
        self.context
            .repository
            .query(self.id)
            .await?
            .ok_or(SearchError::QueryNotFound(self.id))
    }

    async fn initialized_record(&self) -> Result<QueryRecord> {
        let record = self.record().await?;
        if !record.initialized {
            return Err(SearchError::NotInitialized(self.id));
        }
        Ok(record)
    }

    /// Attaches one ShardResult per partition, creating missing ones.
    /// Must be called exactly once, before any search or read.
    pub async fn initialize(&self) -> Result<()> {
        let mut record = self.record().await?;
        if record.initialized {
            return Err(SearchError::AlreadyInitialized(self.id));
        }

        // Resolve sizes first so an unknown partition leaves nothing behind.
        let mut total_bytes = 0u64;
        for partition in &record.partitions {
            total_bytes += self.context.catalog.total_bytes(partition)?;
        }

        for partition in record.partitions.clone() {
            let key = record.content_key(&partition);
            let shard_result = self
                .context
                .repository
                .get_or_create_shard_result(&key)
                .await?;
            record.shard_results.insert(partition, shard_result.id);
        }
        record.total_partition_bytes = total_bytes;
        record.initialized = true;
        self.context.repository.save_query(&record).await?;

        tracing::info!(
            "initialized query id={} shard_results={} total_bytes={total_bytes}",
            self.id,
            record.shard_results.len()
        );
        Ok(())
    }

    pub fn add_filter(&mut self, op: FilterOp) -> Result<()> {
        self.filters.push(op)
    }

    pub fn apply_behaviour(&mut self, behaviour: &Behaviour) -> Result<()> {
        for op in behaviour.filters() {
            self.add_filter(op)?;
        }
        Ok(())
    }

    pub fn filters(&self) -> &[FilterOp] {
        self.filters.ops()
    }

    /// Searches every ShardResult that still has work, unstarted ones first,
    /// then the most advanced. Stops after the ShardResult in progress once
    /// the query is cancelled.
    pub async fn perform_search(&self, token: &CancellationToken) -> Result<()> {
        let record = self.initialized_record().await?;
        let cancellation = QueryCancellation {
            id: self.id,
            repository: self.context.repository.as_ref(),
            token,
        };
        if cancellation.should_stop().await {
            return Ok(());
        }

        // Settled ShardResults stay in the list so a lost cache file is noticed.
        let mut pending = Vec::new();
        for (partition, id) in &record.shard_results {
            let shard_result = self.context.repository.shard_result(*id).await?;
            pending.push((search_priority(shard_result.as_ref()), partition.clone(), *id));
        }
        // Stable: equal priorities stay in partition order.
        pending.sort_by_key(|(priority, _, _)| *priority);

        for (_, partition, id) in pending {
            let mut id = id;
            // A lost or evicted ShardResult is recreated once per pass.
            for attempt in 0..2 {
                let outcome = ShardResult::new(id, self.context.clone())
                    .perform_search(&cancellation)
                    .await?;
                match outcome {
                    SearchOutcome::CacheLost | SearchOutcome::Missing if attempt == 0 => {
                        id = self.replace_shard_result(&partition, id, outcome).await?;
                    }
                    _ => break,
                }
            }

            if cancellation.should_stop().await {
                tracing::info!("query cancelled id={} at partition={partition}", self.id);
                break;
            }
        }
        Ok(())
    }

    async fn replace_shard_result(
        &self,
        partition: &PartitionId,
        id: ShardResultId,
        outcome: SearchOutcome,
    ) -> Result<ShardResultId> {
        if outcome == SearchOutcome::CacheLost {
            let _lease = self.context.leases.acquire(id).await;
            self.context.repository.delete_shard_result(id).await?;
        }

        let mut record = self.record().await?;
        let key = record.content_key(partition);
        let fresh = self
            .context
            .repository
            .get_or_create_shard_result(&key)
            .await?;
        record.shard_results.insert(partition.clone(), fresh.id);
        self.context.repository.save_query(&record).await?;

        tracing::info!(
            "replaced shard result query={} partition={partition} old={id} new={} reason={outcome:?}",
            self.id,
            fresh.id
        );
        Ok(fresh.id)
    }

    /// Matches `[from, to)` of the complete prefix in partition order, with
    /// overall and per-partition progress.
    ///
    /// Matches are only taken from ShardResults that are complete, stopping
    /// at the first one that is not, so the order never changes between
    /// polls. Progress covers every ShardResult. A retry of failed shards
    /// appends its matches after the ones already cached, so positions past
    /// the retried ShardResult shift; `get_results_excluding` is unaffected.
    pub async fn get_results(&self, from: usize, to: Option<usize>) -> Result<ResultPage> {
        let record = self.initialized_record().await?;

        let mut collected = Vec::new();
        if to.map_or(true, |to| to > from) {
            collected = self.collect_complete(&record, to, None).await?;
        }
        let next_cursor = collected.len();

        let end = to.unwrap_or(usize::MAX).min(collected.len());
        let matches = if from < end {
            collected.drain(from..end).collect()
        } else {
            Vec::new()
        };

        self.finish_page(&record, matches, next_cursor).await
    }

    /// Up to `limit` matches of the complete prefix whose ids are not in
    /// `exclude`, so callers can poll repeatedly without tracking cursors.
    pub async fn get_results_excluding(
        &self,
        limit: usize,
        exclude: &HashSet<String>,
    ) -> Result<ResultPage> {
        let record = self.initialized_record().await?;

        let mut matches = Vec::new();
        if limit > 0 {
            matches = self
                .collect_complete(&record, Some(limit), Some(exclude))
                .await?;
            matches.truncate(limit);
        }
        let next_cursor = matches.len();

        self.finish_page(&record, matches, next_cursor).await
    }

    async fn collect_complete(
        &self,
        record: &QueryRecord,
        stop_after: Option<usize>,
        exclude: Option<&HashSet<String>>,
    ) -> Result<Vec<SearchMatch>> {
        let mut collected = Vec::new();
        for id in record.shard_results.values() {
            let complete = self
                .context
                .repository
                .shard_result(*id)
                .await?
                .is_some_and(|shard_result| shard_result.is_complete());
            if !complete {
                break;
            }

            let matches = ShardResult::new(*id, self.context.clone())
                .get_results()
                .await?;
            let matches = self.filters.apply(matches);
            match exclude {
                Some(exclude) => collected.extend(
                    matches
                        .into_iter()
                        .filter(|hit| !exclude.contains(hit.id())),
                ),
                None => collected.extend(matches),
            }

            if stop_after.is_some_and(|limit| collected.len() >= limit) {
                break;
            }
        }
        Ok(collected)
    }

    async fn finish_page(
        &self,
        record: &QueryRecord,
        mut matches: Vec<SearchMatch>,
        next_cursor: usize,
    ) -> Result<ResultPage> {
        let (percentage, stats) = self.progress(record).await?;
        self.context
            .repository
            .touch_query(self.id, Utc::now())
            .await?;
        resolve_variables(&mut matches, &record.variables);

        Ok(ResultPage {
            matches,
            percentage,
            stats,
            next_cursor,
        })
    }

    async fn progress(&self, record: &QueryRecord) -> Result<(u8, Vec<PartitionStats>)> {
        let mut completed_bytes = 0u64;
        let mut all_complete = true;
        let mut stats = Vec::with_capacity(record.shard_results.len());

        for (partition, id) in &record.shard_results {
            let Some(shard_result) = self.context.repository.shard_result(*id).await? else {
                // Evicted: it will be searched again from scratch.
                all_complete = false;
                stats.push(PartitionStats {
                    partition: partition.clone(),
                    number_of_results: 0,
                    completed: false,
                    percentage: 0,
                });
                continue;
            };
            completed_bytes += shard_result.completed_bytes;
            all_complete &= shard_result.is_complete();

            let number_of_results = if self.filters.is_empty() {
                shard_result.num_results
            } else {
                let matches = ShardResult::new(*id, self.context.clone())
                    .get_results()
                    .await?;
                self.filters.apply(matches).len() as u64
            };
            let partition_bytes = self.context.catalog.total_bytes(partition)?;
            stats.push(PartitionStats {
                partition: partition.clone(),
                number_of_results,
                completed: shard_result.is_complete(),
                percentage: completion_percentage(shard_result.completed_bytes, partition_bytes),
            });
        }

        // 100 is only reported once every match can be read.
        let mut percentage = completion_percentage(completed_bytes, record.total_partition_bytes);
        if !all_complete {
            percentage = percentage.min(99);
        }
        Ok((percentage, stats))
    }

    /// Shard fault messages, grouped per partition in partition order.
    pub async fn errors(&self) -> Result<String> {
        let record = self.record().await?;
        let mut text = String::new();
        for (partition, id) in &record.shard_results {
            let Some(shard_result) = self.context.repository.shard_result(*id).await? else {
                continue;
            };
            if !shard_result.errors.is_empty() {
                text.push_str(&format!(
                    "Errors in searching partition {partition}: \n{}\n\n",
                    shard_result.errors_text()
                ));
            }
        }
        Ok(text)
    }

    /// Marks the query cancelled. The running search stops at its next
    /// checkpoint; finished ShardResults are kept.
    pub async fn cancel(&self) -> Result<()> {
        if !self.context.repository.mark_query_cancelled(self.id).await? {
            return Err(SearchError::QueryNotFound(self.id));
        }
        tracing::info!("cancel requested query={}", self.id);
        Ok(())
    }

    /// Deletes the query together with the ShardResults (and cache files)
    /// no other query references. Waits for searches holding them.
    pub async fn delete(self) -> Result<usize> {
        let record = self.record().await?;
        let mut deleted = 0usize;
        for id in record.shard_results.values() {
            let shared = self
                .context
                .repository
                .queries_referencing(*id)
                .await?
                .iter()
                .any(|query| query.id != self.id);
            if shared {
                continue;
            }
            let _lease = self.context.leases.acquire(*id).await;
            if self.context.repository.delete_shard_result(*id).await? {
                deleted += 1;
            }
        }
        self.context.repository.delete_query(self.id).await?;
        tracing::info!("deleted query id={} shard_results={deleted}", self.id);
        Ok(deleted)
    }

    pub async fn is_cancelled(&self) -> Result<bool> {
        Ok(self.record().await?.cancelled)
    }

    /// Counts matches per partition straight from the engine, bypassing the
    /// cache. Any engine fault fails the whole count. Does not need
    /// [`Query::initialize`].
    pub async fn perform_count(&self) -> Result<BTreeMap<PartitionId, u64>> {
        let record = self.record().await?;
        count_partitions(&self.context, &record.query_string, &record.partitions).await
    }
}

/// Uncached per-partition count of `query_string`.
pub(crate) async fn count_partitions<'a>(
    context: &SearchContext,
    query_string: &str,
    partitions: impl IntoIterator<Item = &'a PartitionId>,
) -> Result<BTreeMap<PartitionId, u64>> {
    let timeout = context.config.engine_timeout();
    let mut counts = BTreeMap::new();
    for partition in partitions {
        let mut total = 0u64;
        for shard in context.catalog.shards_of(partition)? {
            total += count_with_timeout(context.engine.as_ref(), &shard.id, query_string, timeout)
                .await?;
        }
        counts.insert(partition.clone(), total);
    }
    Ok(counts)
}

/// Unstarted (or evicted) first, then the most progress, then retries,
/// then settled ones.
fn search_priority(record: Option<&ShardResultRecord>) -> (u8, Reverse<u64>) {
    match record {
        None => (0, Reverse(0)),
        Some(record) if record.is_unstarted() => (0, Reverse(0)),
        Some(record) if !record.is_complete() => (1, Reverse(record.completed_bytes)),
        Some(record) if !record.is_settled() => (2, Reverse(0)),
        Some(_) => (3, Reverse(0)),
    }
}

/// Stops a search when the in-process token fires or the persisted query is
/// cancelled (possibly by another process).
struct QueryCancellation<'a> {
    id: QueryId,
    repository: &'a dyn Repository,
    token: &'a CancellationToken,
}

#[async_trait]
impl CancellationCheck for QueryCancellation<'_> {
    async fn should_stop(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match self.repository.query(self.id).await {
            Ok(Some(record)) => record.cancelled,
            Ok(None) => true,
            Err(error) => {
                tracing::warn!("cannot read cancellation state query={} error={error}", self.id);
                false
            }
        }
    }
}
