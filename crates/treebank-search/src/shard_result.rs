//! Searching one partition for one query and caching the raw matches.
//!
//! A ShardResult walks its partition's shards in catalog order, appends the
//! engine's match records to its cache file and checkpoints its progress at
//! least once per checkpoint interval. Progress survives cancellation: a
//! later run resumes at the first shard not yet processed.

use std::io::SeekFrom;
use std::path::PathBuf;

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::cancel::CancellationCheck;
use crate::context::SearchContext;
use crate::engine::{count_with_timeout, search_with_timeout};
use crate::error::{EngineError, Result, SearchError};
use crate::match_record::{parse_records, truncate_records, SearchMatch};
use crate::types::{Shard, ShardResultId, ShardResultRecord};

/// How a call to [`ShardResult::perform_search`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Already complete without shard faults; nothing was searched.
    Skipped,
    Completed,
    /// Stopped at a checkpoint; progress so far is persisted.
    Cancelled,
    /// The record claims cached matches that are no longer on disk.
    CacheLost,
    /// The record no longer exists, typically because it was evicted.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Start or resume at `completed_shards`.
    Forward,
    /// Re-run only the shards that failed during a completed run.
    Retry,
}

/// What one shard adds: its match count and the records to cache.
struct ShardContribution {
    matches: u64,
    records: String,
}

/// Handle on a persisted ShardResult.
#[derive(Clone)]
pub struct ShardResult {
    id: ShardResultId,
    context: SearchContext,
}

impl ShardResult {
    pub fn new(id: ShardResultId, context: SearchContext) -> Self {
        Self { id, context }
    }

    pub fn id(&self) -> ShardResultId {
        self.id
    }

    pub fn cache_path(&self) -> PathBuf {
        self.context.layout.path_for(self.id)
    }

    pub async fn record(&self) -> Result<Option<ShardResultRecord>> {
        self.context.repository.shard_result(self.id).await
    }

    /// Runs (or resumes, or retries) the search of this ShardResult.
    ///
    /// Engine faults are recorded per shard and never fail the call. Failing
    /// to create the cache directory or open the cache file does, before any
    /// state is written.
    pub async fn perform_search(&self, cancel: &dyn CancellationCheck) -> Result<SearchOutcome> {
        let _lease = self.context.leases.acquire(self.id).await;

        let Some(mut record) = self.context.repository.shard_result(self.id).await? else {
            return Ok(SearchOutcome::Missing);
        };

        let path = self.cache_path();
        let on_disk = tokio::fs::metadata(&path)
            .await
            .ok()
            .map(|metadata| metadata.len());
        if record.cache_len > 0 && on_disk.map_or(true, |len| len < record.cache_len) {
            tracing::warn!(
                "cache file lost shard_result={} path={} expected_bytes={}",
                self.id,
                path.display(),
                record.cache_len
            );
            return Ok(SearchOutcome::CacheLost);
        }
        if record.is_settled() {
            return Ok(SearchOutcome::Skipped);
        }

        let shards = self.context.catalog.shards_of(&record.key.partition)?;
        let (mode, pending) = if record.is_complete() {
            let failed = shards
                .into_iter()
                .filter(|shard| record.failed_shards.contains(&shard.id))
                .collect::<Vec<_>>();
            (RunMode::Retry, failed)
        } else {
            let remaining = shards
                .into_iter()
                .skip(record.completed_shards)
                .collect::<Vec<_>>();
            (RunMode::Forward, remaining)
        };

        let mut file = self.open_cache_file(record.cache_len).await?;

        tracing::info!(
            "searching shard_result={} partition={} mode={mode:?} shards={} resume_at={}",
            self.id,
            record.key.partition,
            pending.len(),
            record.completed_shards
        );

        let cap = self.context.config.max_results_per_partition;
        let interval = self.context.config.checkpoint_interval();
        let mut last_checkpoint = Instant::now();
        let mut retry_errors = Vec::new();
        let mut cancelled = false;

        for (index, shard) in pending.iter().enumerate() {
            let remaining = cap.saturating_sub(record.num_results);
            match self.search_shard(shard, &record, remaining).await {
                Ok(contribution) => {
                    file.write_all(contribution.records.as_bytes()).await?;
                    record.num_results += contribution.matches;
                    record.cache_len += contribution.records.len() as u64;
                    if mode == RunMode::Retry {
                        record.failed_shards.retain(|failed| *failed != shard.id);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        "shard search failed shard_result={} shard={} error={error}",
                        self.id,
                        shard.id
                    );
                    let message = format!("Error searching database {}: {error}", shard.id);
                    match mode {
                        RunMode::Forward => {
                            record.errors.push(message);
                            if !record.failed_shards.contains(&shard.id) {
                                record.failed_shards.push(shard.id.clone());
                            }
                        }
                        RunMode::Retry => retry_errors.push(message),
                    }
                }
            }

            if mode == RunMode::Forward {
                record.completed_bytes += shard.size_bytes;
                record.completed_shards += 1;
            }

            // The final save below covers the last shard, so progress never
            // reads as fully searched while the record is still incomplete.
            let is_last = index + 1 == pending.len();
            if !is_last && last_checkpoint.elapsed() >= interval {
                self.checkpoint(&mut file, &record).await?;
                last_checkpoint = Instant::now();
                if cancel.should_stop().await {
                    cancelled = true;
                    break;
                }
            }
        }

        file.flush().await?;
        let now = Utc::now();
        if !cancelled {
            if mode == RunMode::Retry {
                record.errors = retry_errors;
            }
            record.search_completed_at = Some(now);
        }
        record.cache_size_bytes = Some(record.cache_len);
        record.last_accessed_at = Some(now);
        self.context.repository.save_shard_result(&record).await?;

        tracing::info!(
            "search {} shard_result={} results={} completed_bytes={} errors={}",
            if cancelled { "cancelled" } else { "finished" },
            self.id,
            record.num_results,
            record.completed_bytes,
            record.errors.len()
        );

        Ok(if cancelled {
            SearchOutcome::Cancelled
        } else {
            SearchOutcome::Completed
        })
    }

    /// Matches covered by the last checkpoint. A ShardResult that has not
    /// written anything yet has no matches.
    pub async fn get_results(&self) -> Result<Vec<SearchMatch>> {
        let Some(record) = self.context.repository.shard_result(self.id).await? else {
            return Ok(Vec::new());
        };

        let path = self.cache_path();
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SearchError::CacheFile { path, source }),
        };

        let mut bytes = Vec::new();
        file.take(record.cache_len).read_to_end(&mut bytes).await?;
        if (bytes.len() as u64) < record.cache_len {
            tracing::warn!(
                "cache file shorter than checkpoint shard_result={} path={} expected_bytes={} actual_bytes={}",
                self.id,
                path.display(),
                record.cache_len,
                bytes.len()
            );
            return Ok(Vec::new());
        }

        let text = String::from_utf8(bytes).map_err(|error| {
            SearchError::MalformedRecord(format!(
                "cache file {} is not UTF-8: {error}",
                path.display()
            ))
        })?;
        let matches = parse_records(&text, &record.key.partition)?;

        self.context
            .repository
            .touch_shard_result(self.id, Utc::now())
            .await?;
        Ok(matches)
    }

    async fn open_cache_file(&self, keep_bytes: u64) -> Result<File> {
        let dir = self.context.layout.dir().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SearchError::CacheDirectory { path: dir, source })?;

        let path = self.cache_path();
        let mut file = match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(source) => return Err(SearchError::CacheFile { path, source }),
        };
        // Bytes past the last checkpoint belong to an interrupted run.
        if let Err(source) = file.set_len(keep_bytes).await {
            return Err(SearchError::CacheFile { path, source });
        }
        file.seek(SeekFrom::End(0)).await?;
        Ok(file)
    }

    async fn search_shard(
        &self,
        shard: &Shard,
        record: &ShardResultRecord,
        remaining: u64,
    ) -> std::result::Result<ShardContribution, EngineError> {
        let engine = self.context.engine.as_ref();
        let timeout = self.context.config.engine_timeout();
        let query = record.key.query_string.as_str();

        if remaining == 0 {
            let count = count_with_timeout(engine, &shard.id, query, timeout).await?;
            return Ok(ShardContribution {
                matches: count,
                records: String::new(),
            });
        }

        let text = search_with_timeout(engine, &shard.id, query, timeout).await?;
        // Malformed responses never reach the cache file.
        let returned = parse_records(&text, &record.key.partition)
            .map_err(|error| EngineError::Malformed(error.to_string()))?
            .len() as u64;

        let kept = usize::try_from(remaining).unwrap_or(usize::MAX);
        if returned > remaining {
            tracing::debug!(
                "truncating shard results shard_result={} shard={} returned={returned} kept={remaining}",
                self.id,
                shard.id
            );
        }
        let records = truncate_records(&text, kept)
            .map_err(|error| EngineError::Malformed(error.to_string()))?
            .trim()
            .to_string();

        Ok(ShardContribution {
            matches: returned,
            records,
        })
    }

    async fn checkpoint(&self, file: &mut File, record: &ShardResultRecord) -> Result<()> {
        file.flush().await?;
        self.context.repository.save_shard_result(record).await?;
        tracing::debug!(
            "checkpoint shard_result={} results={} completed_bytes={} cache_len={}",
            self.id,
            record.num_results,
            record.completed_bytes,
            record.cache_len
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancellationToken, NeverCancel};
    use crate::catalog::StaticCatalog;
    use crate::config::SearchConfig;
    use crate::match_record::count_records;
    use crate::testing::{test_config, test_context, EngineCall, FakeEngine, SMAIN_QUERY};
    use crate::types::{ContentKey, PartitionId, ShardId};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        engine: Arc<FakeEngine>,
        context: SearchContext,
        shard_result: ShardResult,
    }

    async fn fixture_with(
        engine: FakeEngine,
        shards: &[(&str, u64)],
        configure: impl FnOnce(&mut SearchConfig),
    ) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        configure(&mut config);
        let engine = Arc::new(engine);
        let catalog = StaticCatalog::new().with_partition("p", shards.iter().copied());
        let context = test_context(config, engine.clone(), catalog);
        let key = ContentKey::new(SMAIN_QUERY, Vec::new(), PartitionId::new("p"));
        let record = context
            .repository
            .get_or_create_shard_result(&key)
            .await
            .expect("create");
        let shard_result = ShardResult::new(record.id, context.clone());
        Fixture {
            _dir: dir,
            engine,
            context,
            shard_result,
        }
    }

    async fn fixture(engine: FakeEngine) -> Fixture {
        fixture_with(engine, &[("s1", 100), ("s2", 50)], |_| {}).await
    }

    async fn record(fixture: &Fixture) -> ShardResultRecord {
        fixture
            .shard_result
            .record()
            .await
            .expect("lookup")
            .expect("record")
    }

    async fn cache_text(fixture: &Fixture) -> String {
        tokio::fs::read_to_string(fixture.shard_result.cache_path())
            .await
            .expect("read cache")
    }

    #[tokio::test]
    async fn searches_every_shard_in_order() {
        let fixture = fixture(FakeEngine::new().with_matches("s1", 4).with_matches("s2", 3)).await;

        let outcome = fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");
        assert_eq!(outcome, SearchOutcome::Completed);

        let record = record(&fixture).await;
        assert_eq!(record.num_results, 7);
        assert_eq!(record.completed_bytes, 150);
        assert!(record.errors.is_empty());
        assert!(record.search_completed_at.is_some());
        assert!(record.last_accessed_at.is_some());
        let file_len = tokio::fs::metadata(fixture.shard_result.cache_path())
            .await
            .expect("metadata")
            .len();
        assert_eq!(record.cache_size_bytes, Some(file_len));
        assert_eq!(
            fixture.engine.calls(),
            vec![
                EngineCall::Search("s1".to_string()),
                EngineCall::Search("s2".to_string())
            ]
        );

        let matches = fixture.shard_result.get_results().await.expect("results");
        assert_eq!(matches.len(), 7);
        assert_eq!(matches[0].id(), "s1-1");
        assert_eq!(matches[6].id(), "s2-3");
        assert_eq!(matches[0].partition, PartitionId::new("p"));
    }

    #[tokio::test]
    async fn full_partition_switches_to_counting() {
        let fixture = fixture_with(
            FakeEngine::new().with_matches("s1", 4).with_matches("s2", 3),
            &[("s1", 100), ("s2", 50)],
            |config| config.max_results_per_partition = 4,
        )
        .await;

        fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");

        assert_eq!(
            fixture.engine.calls(),
            vec![
                EngineCall::Search("s1".to_string()),
                EngineCall::Count("s2".to_string())
            ]
        );
        assert_eq!(record(&fixture).await.num_results, 7);
        assert_eq!(count_records(&cache_text(&fixture).await).expect("count"), 4);
    }

    #[tokio::test]
    async fn oversized_shard_is_truncated_at_a_record_boundary() {
        let fixture = fixture_with(
            FakeEngine::new().with_matches("s1", 6).with_matches("s2", 3),
            &[("s1", 100), ("s2", 50)],
            |config| config.max_results_per_partition = 4,
        )
        .await;

        fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");

        let text = cache_text(&fixture).await;
        assert_eq!(count_records(&text).expect("count"), 4);
        assert!(text.ends_with("</match>"));
        assert_eq!(record(&fixture).await.num_results, 9);
        let matches = fixture.shard_result.get_results().await.expect("results");
        assert_eq!(matches.len(), 4);
        assert_eq!(matches[3].id(), "s1-4");
    }

    #[tokio::test]
    async fn engine_faults_are_recorded_and_skipped() {
        let engine = FakeEngine::new().with_matches("s2", 3);
        engine.fail("s1", EngineError::Io("connection refused".to_string()));
        let fixture = fixture(engine).await;

        let outcome = fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");
        assert_eq!(outcome, SearchOutcome::Completed);

        let record = record(&fixture).await;
        assert_eq!(record.num_results, 3);
        assert_eq!(record.completed_bytes, 150);
        assert_eq!(
            record.errors,
            vec!["Error searching database s1: engine IO error: connection refused".to_string()]
        );
        assert_eq!(record.failed_shards, vec![ShardId::new("s1")]);
    }

    #[tokio::test]
    async fn malformed_responses_never_reach_the_cache() {
        let engine = FakeEngine::new().with_matches("s2", 2);
        engine.respond("s1", "<match>only||three||fields</match>");
        let fixture = fixture(engine).await;

        fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");

        let record = record(&fixture).await;
        assert_eq!(record.errors.len(), 1);
        assert!(record.errors[0].starts_with("Error searching database s1:"));
        assert_eq!(count_records(&cache_text(&fixture).await).expect("count"), 2);
    }

    #[tokio::test]
    async fn cancelled_search_keeps_whole_shards_and_resumes() {
        let token = CancellationToken::new();
        let engine = FakeEngine::new()
            .with_matches("s1", 2)
            .with_matches("s2", 3)
            .with_matches("s3", 4);
        engine.cancel_on_search("s2", token.clone());
        let fixture =
            fixture_with(engine, &[("s1", 10), ("s2", 20), ("s3", 30)], |_| {}).await;

        let outcome = fixture
            .shard_result
            .perform_search(&token)
            .await
            .expect("search");
        assert_eq!(outcome, SearchOutcome::Cancelled);

        let cancelled = record(&fixture).await;
        assert!(cancelled.search_completed_at.is_none());
        assert_eq!(cancelled.completed_shards, 2);
        assert_eq!(cancelled.completed_bytes, 30);
        assert_eq!(cancelled.cache_size_bytes, Some(cancelled.cache_len));
        assert_eq!(count_records(&cache_text(&fixture).await).expect("count"), 5);
        assert_eq!(
            fixture.shard_result.get_results().await.expect("results").len(),
            5
        );

        fixture.engine.clear_calls();
        let outcome = fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("resume");
        assert_eq!(outcome, SearchOutcome::Completed);
        assert_eq!(
            fixture.engine.calls(),
            vec![EngineCall::Search("s3".to_string())]
        );
        let finished = record(&fixture).await;
        assert_eq!(finished.num_results, 9);
        assert_eq!(finished.completed_bytes, 60);
        assert_eq!(count_records(&cache_text(&fixture).await).expect("count"), 9);
    }

    /// Records `completed_bytes` as persisted at every checkpoint.
    struct ProgressRecorder {
        repository: crate::storage::SharedRepository,
        id: ShardResultId,
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl CancellationCheck for ProgressRecorder {
        async fn should_stop(&self) -> bool {
            if let Ok(Some(record)) = self.repository.shard_result(self.id).await {
                self.seen.lock().push(record.completed_bytes);
            }
            false
        }
    }

    #[tokio::test]
    async fn checkpoints_never_lose_progress() {
        let engine = FakeEngine::new()
            .with_matches("s1", 1)
            .with_matches("s3", 2);
        engine.fail("s2", EngineError::Decode("bad bytes".to_string()));
        let fixture =
            fixture_with(engine, &[("s1", 10), ("s2", 20), ("s3", 30)], |_| {}).await;
        let recorder = ProgressRecorder {
            repository: fixture.context.repository.clone(),
            id: fixture.shard_result.id(),
            seen: Mutex::new(Vec::new()),
        };

        fixture
            .shard_result
            .perform_search(&recorder)
            .await
            .expect("search");

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen, vec![10, 30]);
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(record(&fixture).await.completed_bytes, 60);
    }

    #[tokio::test]
    async fn cancelling_during_the_last_shard_still_completes() {
        let token = CancellationToken::new();
        let engine = FakeEngine::new().with_matches("s1", 2).with_matches("s2", 1);
        engine.cancel_on_search("s2", token.clone());
        let fixture = fixture(engine).await;

        let outcome = fixture
            .shard_result
            .perform_search(&token)
            .await
            .expect("search");
        assert_eq!(outcome, SearchOutcome::Completed);
        let record = record(&fixture).await;
        assert!(record.is_complete());
        assert_eq!(record.completed_bytes, 150);
        assert_eq!(record.num_results, 3);
    }

    #[tokio::test]
    async fn failed_shards_are_retried_alone() {
        let engine = FakeEngine::new().with_matches("s1", 2).with_matches("s2", 3);
        engine.fail("s1", EngineError::Io("timeout".to_string()));
        let fixture = fixture(engine).await;
        fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");
        assert_eq!(record(&fixture).await.num_results, 3);

        fixture.engine.heal("s1");
        fixture.engine.clear_calls();
        let outcome = fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("retry");
        assert_eq!(outcome, SearchOutcome::Completed);
        assert_eq!(
            fixture.engine.calls(),
            vec![EngineCall::Search("s1".to_string())]
        );

        let record = record(&fixture).await;
        assert_eq!(record.num_results, 5);
        assert_eq!(record.completed_bytes, 150);
        assert!(record.errors.is_empty());
        assert!(record.failed_shards.is_empty());
        assert!(record.is_settled());
        assert_eq!(
            fixture.shard_result.get_results().await.expect("results").len(),
            5
        );
    }

    #[tokio::test]
    async fn settled_results_are_not_searched_again() {
        let fixture = fixture(FakeEngine::new().with_matches("s1", 1)).await;
        fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");
        fixture.engine.clear_calls();

        let outcome = fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search again");
        assert_eq!(outcome, SearchOutcome::Skipped);
        assert!(fixture.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn unusable_cache_directory_fails_without_writing() {
        let blocker = tempdir().expect("tempdir");
        let blocking_file = blocker.path().join("not-a-dir");
        std::fs::write(&blocking_file, b"").expect("write");
        let fixture = fixture_with(
            FakeEngine::new().with_matches("s1", 1),
            &[("s1", 100)],
            |config| config.cache_dir = blocking_file.join("cache"),
        )
        .await;

        let err = fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect_err("directory error");
        assert!(matches!(err, SearchError::CacheDirectory { .. }));

        let record = record(&fixture).await;
        assert!(record.is_unstarted());
        assert!(record.last_accessed_at.is_none());
        assert!(fixture.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn reading_before_search_is_empty() {
        let fixture = fixture(FakeEngine::new().with_matches("s1", 1)).await;
        let matches = fixture.shard_result.get_results().await.expect("results");
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn reads_stop_at_the_checkpoint() {
        let fixture = fixture(FakeEngine::new().with_matches("s1", 2)).await;
        fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");

        let mut text = cache_text(&fixture).await;
        text.push_str("<match>half-written");
        tokio::fs::write(fixture.shard_result.cache_path(), text)
            .await
            .expect("append");

        let matches = fixture.shard_result.get_results().await.expect("results");
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn missing_cache_file_is_reported_as_lost() {
        let token = CancellationToken::new();
        let engine = FakeEngine::new().with_matches("s1", 2).with_matches("s2", 1);
        engine.cancel_on_search("s1", token.clone());
        let fixture = fixture(engine).await;
        assert_eq!(
            fixture
                .shard_result
                .perform_search(&token)
                .await
                .expect("search"),
            SearchOutcome::Cancelled
        );

        tokio::fs::remove_file(fixture.shard_result.cache_path())
            .await
            .expect("remove");
        let outcome = fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");
        assert_eq!(outcome, SearchOutcome::CacheLost);
    }

    #[tokio::test]
    async fn evicted_record_is_missing() {
        let fixture = fixture(FakeEngine::new()).await;
        fixture
            .context
            .repository
            .delete_shard_result(fixture.shard_result.id())
            .await
            .expect("delete");
        let outcome = fixture
            .shard_result
            .perform_search(&NeverCancel)
            .await
            .expect("search");
        assert_eq!(outcome, SearchOutcome::Missing);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_searches_of_one_shard_result_run_once() {
        let fixture = fixture(FakeEngine::new().with_matches("s1", 4).with_matches("s2", 3)).await;
        let gate = fixture.engine.gate("s1");

        let first = fixture.shard_result.clone();
        let first_run = tokio::spawn(async move { first.perform_search(&NeverCancel).await });
        while !fixture
            .engine
            .calls()
            .contains(&EngineCall::Search("s1".to_string()))
        {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        // The first search holds the lease inside the engine call.
        let second = ShardResult::new(fixture.shard_result.id(), fixture.context.clone());
        let second_run = tokio::spawn(async move { second.perform_search(&NeverCancel).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.add_permits(1);

        let first_outcome = first_run.await.expect("join").expect("search");
        let second_outcome = second_run.await.expect("join").expect("search");
        assert_eq!(first_outcome, SearchOutcome::Completed);
        assert_eq!(second_outcome, SearchOutcome::Skipped);
        assert_eq!(
            fixture.engine.calls(),
            vec![
                EngineCall::Search("s1".to_string()),
                EngineCall::Search("s2".to_string())
            ]
        );
        let record = record(&fixture).await;
        assert_eq!(record.num_results, 7);
        assert_eq!(
            count_records(&cache_text(&fixture).await).expect("count") as u64,
            record.num_results
        );
    }
}
