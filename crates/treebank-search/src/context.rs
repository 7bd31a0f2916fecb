//! Shared collaborators of ShardResults, Queries and the cache manager.

use std::sync::Arc;

use crate::catalog::PartitionCatalog;
use crate::config::SearchConfig;
use crate::engine::QueryEngine;
use crate::filter::{HitAnnotator, HitAttributes, IndexNodeExpander, TreeExpander};
use crate::lease::LeaseTable;
use crate::storage::{CacheLayout, SharedRepository};

/// Everything a search needs, injected once and cloned cheaply.
#[derive(Clone)]
pub struct SearchContext {
    pub config: Arc<SearchConfig>,
    pub repository: SharedRepository,
    pub engine: Arc<dyn QueryEngine>,
    pub catalog: Arc<dyn PartitionCatalog>,
    pub leases: Arc<LeaseTable>,
    pub layout: CacheLayout,
    pub expander: Arc<dyn TreeExpander>,
    pub annotator: Arc<dyn HitAnnotator>,
}

impl SearchContext {
    pub fn new(
        config: SearchConfig,
        repository: SharedRepository,
        engine: Arc<dyn QueryEngine>,
        catalog: Arc<dyn PartitionCatalog>,
    ) -> Self {
        let layout = CacheLayout::new(config.cache_dir.clone());
        Self {
            config: Arc::new(config),
            repository,
            engine,
            catalog,
            leases: Arc::new(LeaseTable::new()),
            layout,
            expander: Arc::new(IndexNodeExpander),
            annotator: Arc::new(HitAttributes),
        }
    }

    pub fn with_expander(mut self, expander: Arc<dyn TreeExpander>) -> Self {
        self.expander = expander;
        self
    }

    pub fn with_annotator(mut self, annotator: Arc<dyn HitAnnotator>) -> Self {
        self.annotator = annotator;
        self
    }
}
