//! Test doubles shared by the unit tests.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::cancel::CancellationToken;
use crate::catalog::StaticCatalog;
use crate::config::SearchConfig;
use crate::context::SearchContext;
use crate::engine::QueryEngine;
use crate::error::EngineError;
use crate::storage::{CacheLayout, MemoryRepository};
use crate::types::{PartitionId, QueryDraft, ShardId, Variable};

pub(crate) const SMAIN_QUERY: &str = r#"//node[@cat="smain"]"#;

pub(crate) const SMAIN_TREE: &str = r#"<node cat="smain" begin="0"><node rel="su" pt="vnw" word="Dit" lemma="dit" begin="0"/><node rel="hd" pt="ww" word="is" lemma="zijn" begin="1"/></node>"#;

pub(crate) const NP_TREE: &str = r#"<node cat="np" begin="0"><node rel="det" pt="lid" word="een" lemma="een" begin="0"/><node rel="hd" pt="n" word="zin" lemma="zin" begin="1"/></node>"#;

pub(crate) fn match_record(sentence_id: &str, tree: &str) -> String {
    format!("<match>{sentence_id}||Dit is||1||0||{tree}||<metadata/>||<vars/>||db</match>")
}

/// `count` records with ids `<shard>-1`, `<shard>-2`, ...
pub(crate) fn match_records(shard: &str, count: usize) -> String {
    (1..=count)
        .map(|index| match_record(&format!("{shard}-{index}"), SMAIN_TREE))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineCall {
    Search(String),
    Count(String),
}

#[derive(Default)]
struct ShardScript {
    response: String,
    failure: Option<EngineError>,
    cancel_on_search: Option<CancellationToken>,
}

/// An engine answering from per-shard scripts and recording every call.
#[derive(Default)]
pub(crate) struct FakeEngine {
    scripts: Mutex<HashMap<ShardId, ShardScript>>,
    gates: Mutex<HashMap<ShardId, Arc<Semaphore>>>,
    calls: Mutex<Vec<EngineCall>>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_matches(self, shard: &str, count: usize) -> Self {
        self.respond(shard, match_records(shard, count));
        self
    }

    pub(crate) fn respond(&self, shard: &str, response: impl Into<String>) {
        self.scripts
            .lock()
            .entry(ShardId::new(shard))
            .or_default()
            .response = response.into();
    }

    pub(crate) fn fail(&self, shard: &str, error: EngineError) {
        self.scripts
            .lock()
            .entry(ShardId::new(shard))
            .or_default()
            .failure = Some(error);
    }

    pub(crate) fn heal(&self, shard: &str) {
        if let Some(script) = self.scripts.lock().get_mut(&ShardId::new(shard)) {
            script.failure = None;
        }
    }

    /// Cancels `token` when `shard` is searched, before answering.
    pub(crate) fn cancel_on_search(&self, shard: &str, token: CancellationToken) {
        self.scripts
            .lock()
            .entry(ShardId::new(shard))
            .or_default()
            .cancel_on_search = Some(token);
    }

    /// Holds searches of `shard` until the returned gate gets a permit.
    pub(crate) fn gate(&self, shard: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().insert(ShardId::new(shard), gate.clone());
        gate
    }

    pub(crate) fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl QueryEngine for FakeEngine {
    async fn search(&self, shard: &ShardId, _query: &str) -> Result<String, EngineError> {
        self.calls
            .lock()
            .push(EngineCall::Search(shard.as_str().to_string()));
        let gate = self.gates.lock().get(shard).cloned();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|error| EngineError::Io(error.to_string()))?;
        }
        let scripts = self.scripts.lock();
        let Some(script) = scripts.get(shard) else {
            return Ok(String::new());
        };
        if let Some(token) = &script.cancel_on_search {
            token.cancel();
        }
        match &script.failure {
            Some(error) => Err(error.clone()),
            None => Ok(script.response.clone()),
        }
    }

    async fn count(&self, shard: &ShardId, _query: &str) -> Result<u64, EngineError> {
        self.calls
            .lock()
            .push(EngineCall::Count(shard.as_str().to_string()));
        let scripts = self.scripts.lock();
        let Some(script) = scripts.get(shard) else {
            return Ok(0);
        };
        match &script.failure {
            Some(error) => Err(error.clone()),
            None => Ok(script.response.matches("<match>").count() as u64),
        }
    }
}

/// Config writing caches under `dir`, checkpointing after every shard.
pub(crate) fn test_config(dir: &Path) -> SearchConfig {
    SearchConfig {
        checkpoint_interval_ms: 0,
        ..SearchConfig::with_cache_dir(dir.join("cache"))
    }
}

pub(crate) fn test_context(
    config: SearchConfig,
    engine: Arc<FakeEngine>,
    catalog: StaticCatalog,
) -> SearchContext {
    let repository = Arc::new(MemoryRepository::new(CacheLayout::new(config.cache_dir.clone())));
    SearchContext::new(config, repository, engine, Arc::new(catalog))
}

pub(crate) fn draft(query: &str, partitions: &[&str]) -> QueryDraft {
    draft_with_variables(query, Vec::new(), partitions)
}

pub(crate) fn draft_with_variables(
    query: &str,
    variables: Vec<Variable>,
    partitions: &[&str],
) -> QueryDraft {
    QueryDraft {
        query_string: query.to_string(),
        variables,
        partitions: partitions
            .iter()
            .map(|partition| PartitionId::new(*partition))
            .collect::<BTreeSet<_>>(),
    }
}
