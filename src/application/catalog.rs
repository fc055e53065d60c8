//! Cache-backed read facade over the tree query engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::application::repos::NodeStore;
use crate::application::tree::{DepthStatistics, QueryError, TreeQueryEngine};
use crate::cache::{
    CacheLookup, CacheTrigger, CategoryCache, EntryTags, NodeMutation, ScheduleReport,
    TreeCacheKey,
};
use crate::domain::node::{Node, NodeId, TreeNode};

/// Outcome of a [`CategoryTreeService::warm_cache`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
    pub elapsed: Duration,
    pub dry_run: bool,
}

impl WarmReport {
    fn count(&mut self, lookup: CacheLookup) {
        self.entries += 1;
        match lookup {
            CacheLookup::Hit => self.hits += 1,
            CacheLookup::Miss | CacheLookup::Bypass => self.misses += 1,
        }
    }
}

#[derive(Clone)]
pub struct CategoryTreeService {
    engine: TreeQueryEngine,
    cache: Arc<CategoryCache>,
    cache_trigger: Option<Arc<CacheTrigger>>,
}

impl CategoryTreeService {
    pub fn new(engine: TreeQueryEngine, cache: Arc<CategoryCache>) -> Self {
        Self {
            engine,
            cache,
            cache_trigger: None,
        }
    }

    /// Set the cache trigger for this service (optional).
    pub fn with_cache_trigger_opt(mut self, trigger: Option<Arc<CacheTrigger>>) -> Self {
        self.cache_trigger = trigger;
        self
    }

    pub fn engine(&self) -> &TreeQueryEngine {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<CategoryCache> {
        &self.cache
    }

    pub async fn query_tree(&self, active_only: bool) -> Result<Vec<TreeNode>, QueryError> {
        self.tree_traced(active_only)
            .await
            .map(|(tree, _)| tree.unwrap_or_default())
    }

    pub async fn query_breadcrumbs(&self, id: NodeId) -> Result<Option<Vec<Node>>, QueryError> {
        self.breadcrumbs_traced(id).await.map(|(chain, _)| chain)
    }

    pub async fn query_ancestors(&self, id: NodeId) -> Result<Option<Vec<Node>>, QueryError> {
        self.cache
            .remember(TreeCacheKey::Ancestors(id), || self.load_ancestors(id))
            .await
    }

    pub async fn query_descendants(&self, id: NodeId) -> Result<Option<Vec<Node>>, QueryError> {
        self.cache
            .remember(TreeCacheKey::Descendants(id), || self.load_descendants(id))
            .await
    }

    pub async fn query_depth_statistics(&self) -> Result<DepthStatistics, QueryError> {
        self.depth_statistics_traced()
            .await
            .map(|(stats, _)| stats.unwrap_or_default())
    }

    /// Hand a committed mutation to the invalidation pipeline. Never fails.
    pub async fn notify_mutation(&self, mutation: NodeMutation) -> ScheduleReport {
        match &self.cache_trigger {
            Some(trigger) => trigger.trigger(mutation).await,
            None => ScheduleReport::default(),
        }
    }

    /// Populate the tree, depth statistics and every node's breadcrumbs.
    ///
    /// A dry run only probes the store and reports what is already cached.
    #[instrument(skip(self))]
    pub async fn warm_cache(&self, active_only: bool, dry_run: bool) -> Result<WarmReport, QueryError> {
        let started = Instant::now();
        let mut report = WarmReport {
            dry_run,
            ..Default::default()
        };

        let node_ids = if dry_run {
            let forest = self.engine.build_tree(active_only).await?;
            report.count(self.probe(TreeCacheKey::Tree { active_only }).await);
            report.count(self.probe(TreeCacheKey::DepthStats).await);
            let ids = forest_ids(&forest);
            for id in &ids {
                report.count(self.probe(TreeCacheKey::Breadcrumbs(*id)).await);
            }
            ids
        } else {
            let (forest, lookup) = self.tree_traced(active_only).await?;
            report.count(lookup);
            let (_, lookup) = self.depth_statistics_traced().await?;
            report.count(lookup);
            let ids = forest_ids(&forest.unwrap_or_default());
            for id in &ids {
                let (_, lookup) = self.breadcrumbs_traced(*id).await?;
                report.count(lookup);
            }
            ids
        };

        report.elapsed = started.elapsed();
        info!(
            target = "application::catalog",
            nodes = node_ids.len(),
            entries = report.entries,
            hits = report.hits,
            misses = report.misses,
            dry_run,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Category cache warmed"
        );
        Ok(report)
    }

    async fn tree_traced(
        &self,
        active_only: bool,
    ) -> Result<(Option<Vec<TreeNode>>, CacheLookup), QueryError> {
        self.cache
            .remember_traced(TreeCacheKey::Tree { active_only }, || {
                self.load_tree(active_only)
            })
            .await
    }

    async fn breadcrumbs_traced(
        &self,
        id: NodeId,
    ) -> Result<(Option<Vec<Node>>, CacheLookup), QueryError> {
        self.cache
            .remember_traced(TreeCacheKey::Breadcrumbs(id), || self.load_breadcrumbs(id))
            .await
    }

    async fn depth_statistics_traced(
        &self,
    ) -> Result<(Option<DepthStatistics>, CacheLookup), QueryError> {
        self.cache
            .remember_traced(TreeCacheKey::DepthStats, || self.load_depth_statistics())
            .await
    }

    async fn load_tree(
        &self,
        active_only: bool,
    ) -> Result<Option<(Vec<TreeNode>, EntryTags)>, QueryError> {
        let forest = self.engine.build_tree(active_only).await?;
        let tags = EntryTags::roots(forest.iter().map(TreeNode::id)).with_forest();
        Ok(Some((forest, tags)))
    }

    async fn load_breadcrumbs(
        &self,
        id: NodeId,
    ) -> Result<Option<(Vec<Node>, EntryTags)>, QueryError> {
        let Some(chain) = self.engine.breadcrumbs(id).await? else {
            return Ok(None);
        };
        let root = chain.first().map_or(id, |root| root.id);
        Ok(Some((chain, EntryTags::roots([root]))))
    }

    async fn load_ancestors(
        &self,
        id: NodeId,
    ) -> Result<Option<(Vec<Node>, EntryTags)>, QueryError> {
        let Some(chain) = self.engine.ancestors(id).await? else {
            return Ok(None);
        };
        // An empty chain means `id` is itself a root.
        let root = chain.first().map_or(id, |root| root.id);
        Ok(Some((chain, EntryTags::roots([root]))))
    }

    async fn load_descendants(
        &self,
        id: NodeId,
    ) -> Result<Option<(Vec<Node>, EntryTags)>, QueryError> {
        let Some(node) = self.engine.store().get_by_id(id).await? else {
            return Ok(None);
        };
        let root = node.root_ancestor_id().unwrap_or(id);
        let nodes = self.engine.descendants_of(&node).await?;
        Ok(Some((nodes, EntryTags::roots([root]))))
    }

    async fn load_depth_statistics(
        &self,
    ) -> Result<Option<(DepthStatistics, EntryTags)>, QueryError> {
        let stats = self.engine.depth_statistics().await?;
        Ok(Some((stats, EntryTags::forest())))
    }

    async fn probe(&self, key: TreeCacheKey) -> CacheLookup {
        let storage_key = self.cache.storage_key(&key);
        match self.cache.store().get(&storage_key).await {
            Ok(Some(_)) => CacheLookup::Hit,
            Ok(None) => CacheLookup::Miss,
            Err(err) => {
                warn!(
                    target = "application::catalog",
                    key = %storage_key,
                    error = %err,
                    "Cache probe failed"
                );
                CacheLookup::Bypass
            }
        }
    }
}

fn forest_ids(forest: &[TreeNode]) -> Vec<NodeId> {
    let mut ids = Vec::new();
    for tree in forest {
        tree.walk(&mut |node| ids.push(node.id()));
    }
    ids
}
