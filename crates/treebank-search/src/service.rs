//! Request-level facade: create, poll, cancel and count queries, and keep the
//! cache within budget.
//!
//! Searches run as background tasks. Every request re-reads state from the
//! repository, so a poll may be served while the search is still running.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::cache::{CacheManager, PurgeReport};
use crate::cancel::CancellationToken;
use crate::catalog::PartitionCatalog;
use crate::config::load_or_create_search_config;
use crate::context::SearchContext;
use crate::engine::QueryEngine;
use crate::error::{Result, SearchError};
use crate::filter::{Behaviour, FilterPipeline};
use crate::match_record::SearchMatch;
use crate::query::{count_partitions, Query};
use crate::storage::{CacheLayout, FileRepository};
use crate::types::{PartitionId, PartitionStats, QueryDraft, QueryId, Variable};

/// Directory under the service root holding the record store.
pub const STATE_DIR: &str = "state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateQueryRequest {
    pub query_string: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
    pub partitions: Vec<PartitionId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollRequest {
    pub query_id: Option<QueryId>,
    /// Ids of matches the caller already has.
    #[serde(default)]
    pub returned_ids: HashSet<String>,
    #[serde(default)]
    pub behaviour: Behaviour,
    /// Analysis clients get a larger page.
    #[serde(default)]
    pub analysis: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResponse {
    pub query_id: QueryId,
    pub percentage: u8,
    pub matches: Vec<SearchMatch>,
    pub stats: Vec<PartitionStats>,
    /// Shard faults, reported once the search has finished.
    pub errors: Option<String>,
    pub cancelled: bool,
}

struct RunningSearch {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SearchService {
    context: SearchContext,
    running: Mutex<HashMap<QueryId, RunningSearch>>,
}

impl SearchService {
    pub fn new(context: SearchContext) -> Self {
        Self {
            context,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a service rooted at `root`: config from `root/search.json`
    /// (created with defaults when absent) and records under `root/state`.
    /// A relative cache directory is resolved against `root`.
    pub async fn open(
        root: &Path,
        engine: Arc<dyn QueryEngine>,
        catalog: Arc<dyn PartitionCatalog>,
    ) -> Result<Self> {
        let mut config = load_or_create_search_config(root)?;
        if config.cache_dir.is_relative() {
            config.cache_dir = root.join(&config.cache_dir);
        }
        let layout = CacheLayout::new(config.cache_dir.clone());
        let repository = FileRepository::open(root.join(STATE_DIR), layout).await?;
        tracing::info!(
            "opened search service root={} cache_dir={}",
            root.display(),
            config.cache_dir.display()
        );
        Ok(Self::new(SearchContext::new(
            config,
            Arc::new(repository),
            engine,
            catalog,
        )))
    }

    pub fn context(&self) -> &SearchContext {
        &self.context
    }

    /// Creates and initializes a query, then starts searching it in the
    /// background.
    pub async fn create_query(&self, request: CreateQueryRequest) -> Result<QueryId> {
        if request.query_string.trim().is_empty() {
            return Err(SearchError::InvalidInput(
                "query string is empty".to_string(),
            ));
        }
        self.check_partitions(&request.partitions)?;

        let draft = QueryDraft {
            query_string: request.query_string,
            variables: request.variables,
            partitions: request.partitions.into_iter().collect(),
        };
        let query = Query::create(self.context.clone(), draft).await?;
        query.initialize().await?;
        let id = query.id();

        let token = CancellationToken::new();
        let search_token = token.clone();
        let handle = tokio::spawn(async move {
            if let Err(error) = query.perform_search(&search_token).await {
                tracing::error!("search failed query={id} error={error}");
            }
        });

        let mut running = self.running.lock();
        running.retain(|_, search| !search.handle.is_finished());
        running.insert(id, RunningSearch { token, handle });
        Ok(id)
    }

    /// Returns the matches the caller does not have yet, up to the page size,
    /// with progress. Errors are only reported once the search is complete.
    pub async fn poll_query(&self, request: PollRequest) -> Result<PollResponse> {
        let Some(id) = request.query_id else {
            return Err(SearchError::InvalidInput("query id is missing".to_string()));
        };
        let mut query = Query::load(self.context.clone(), id).await?;
        query.apply_behaviour(&request.behaviour)?;

        let page_size = if request.analysis {
            self.context.config.max_results_per_analysis_poll
        } else {
            self.context.config.max_results_per_poll
        };
        let limit = page_size.saturating_sub(request.returned_ids.len());
        let page = query
            .get_results_excluding(limit, &request.returned_ids)
            .await?;

        let errors = if page.percentage == 100 {
            Some(query.errors().await?)
        } else {
            None
        };
        let cancelled = query.is_cancelled().await?;
        tracing::debug!(
            "polled query={id} returned={} percentage={}",
            page.matches.len(),
            page.percentage
        );
        Ok(PollResponse {
            query_id: id,
            percentage: page.percentage,
            matches: page.matches,
            stats: page.stats,
            errors,
            cancelled,
        })
    }

    /// Marks the query cancelled and signals its background search.
    pub async fn cancel_query(&self, id: QueryId) -> Result<()> {
        Query::load(self.context.clone(), id).await?.cancel().await?;
        if let Some(search) = self.running.lock().get(&id) {
            search.token.cancel();
        }
        Ok(())
    }

    /// Waits for the background search of `id`, if one is running here.
    pub async fn wait_for(&self, id: QueryId) -> Result<()> {
        let search = self.running.lock().remove(&id);
        if let Some(search) = search {
            search
                .handle
                .await
                .map_err(|error| SearchError::Internal(format!("search task failed: {error}")))?;
        }
        Ok(())
    }

    /// Uncached per-partition counts.
    pub async fn count_query(
        &self,
        query_string: &str,
        partitions: &[PartitionId],
    ) -> Result<BTreeMap<PartitionId, u64>> {
        self.check_partitions(partitions)?;
        count_partitions(&self.context, query_string, partitions).await
    }

    /// Validates `behaviour` without running anything.
    pub fn check_behaviour(&self, behaviour: &Behaviour) -> Result<()> {
        let mut pipeline =
            FilterPipeline::new(self.context.expander.clone(), self.context.annotator.clone());
        for op in behaviour.filters() {
            pipeline.push(op)?;
        }
        Ok(())
    }

    pub async fn purge_cache(&self) -> Result<PurgeReport> {
        CacheManager::new(self.context.clone())
            .purge(self.context.config.max_cache_bytes())
            .await
    }

    pub async fn empty_cache(&self) -> Result<usize> {
        CacheManager::new(self.context.clone()).delete_all().await
    }

    /// Purges the cache every `purge_interval_secs` until `shutdown` is set.
    pub fn spawn_purge_worker(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = CacheManager::new(self.context.clone());
        let budget = self.context.config.max_cache_bytes();
        let interval = self.context.config.purge_interval();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        // A dropped sender counts as shutdown.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = sleep(interval) => {
                        if let Err(error) = manager.purge(budget).await {
                            tracing::warn!("cache purge failed error={error}");
                        }
                    }
                }
            }
            tracing::debug!("purge worker stopped");
        })
    }

    fn check_partitions(&self, partitions: &[PartitionId]) -> Result<()> {
        if partitions.is_empty() {
            return Err(SearchError::InvalidInput(
                "a query needs at least one partition".to_string(),
            ));
        }
        for partition in partitions {
            if !self.context.catalog.contains(partition) {
                return Err(SearchError::UnknownPartition(partition.clone()));
            }
        }
        Ok(())
    }
}
