//! End-to-end behavior of the category write path, the invalidation pipeline
//! and the cache-backed read facade, all wired over in-process stores.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use canopy::application::catalog::CategoryTreeService;
use canopy::application::categories::{
    CategoryAdminError, CategoryAdminService, CreateCategoryCommand, UpdateCategoryCommand,
};
use canopy::application::jobs::{
    FlushJob, FlushJobState, JobError, JobId, JobRunner, TokioJobRunner,
};
use canopy::application::repos::{NewNodeRecord, NodeStore, NodeWriteRepo, RepoError};
use canopy::application::tree::TreeQueryEngine;
use canopy::cache::{
    CacheConfig, CacheTrigger, CategoryCache, ChangeNotifier, DebounceScheduler, MemoryStore,
    ScopeMode,
};
use canopy::domain::error::TreeError;
use canopy::domain::node::{Node, NodeId, TreeNode};
use canopy::infra::memory::MemoryNodeStore;

const WINDOW: Duration = Duration::from_millis(2000);

#[derive(Default)]
struct RecordingRunner {
    jobs: Mutex<Vec<FlushJob>>,
}

impl RecordingRunner {
    fn take(&self) -> Vec<FlushJob> {
        std::mem::take(&mut *self.jobs.lock().expect("jobs lock"))
    }
}

impl JobRunner for RecordingRunner {
    fn enqueue(&self, job: FlushJob, delay: Duration) -> Result<JobId, JobError> {
        assert_eq!(delay, WINDOW);
        let id = job.id;
        self.jobs.lock().expect("jobs lock").push(job);
        Ok(id)
    }
}

/// Delegates to the in-memory store; once armed, the next `save_nodes` fails.
struct FlakyWriter {
    inner: Arc<MemoryNodeStore>,
    fail_next_save: AtomicBool,
}

impl FlakyWriter {
    fn new(inner: Arc<MemoryNodeStore>) -> Self {
        Self {
            inner,
            fail_next_save: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeWriteRepo for FlakyWriter {
    async fn insert_node(&self, record: NewNodeRecord) -> Result<Node, RepoError> {
        self.inner.insert_node(record).await
    }

    async fn update_node(&self, node: Node) -> Result<Node, RepoError> {
        self.inner.update_node(node).await
    }

    async fn save_nodes(&self, nodes: Vec<Node>) -> Result<(), RepoError> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(RepoError::Timeout);
        }
        self.inner.save_nodes(nodes).await
    }

    async fn soft_delete(&self, id: NodeId) -> Result<Node, RepoError> {
        self.inner.soft_delete(id).await
    }

    async fn restore(&self, id: NodeId) -> Result<Node, RepoError> {
        self.inner.restore(id).await
    }

    async fn force_delete(&self, id: NodeId) -> Result<Node, RepoError> {
        self.inner.force_delete(id).await
    }
}

struct Harness {
    nodes: Arc<MemoryNodeStore>,
    trigger: Arc<CacheTrigger>,
    admin: CategoryAdminService,
    catalog: CategoryTreeService,
}

fn config(tagged_store: bool) -> CacheConfig {
    CacheConfig {
        debounce_window_ms: WINDOW.as_millis() as u64,
        tagged_store,
        ..Default::default()
    }
}

fn wire(
    config: CacheConfig,
    runner: Arc<dyn JobRunner>,
    nodes: Arc<MemoryNodeStore>,
    store: Arc<MemoryStore>,
    cache: Arc<CategoryCache>,
) -> Harness {
    let scheduler = DebounceScheduler::new(
        store,
        runner,
        config.namespace.clone(),
        config.debounce_window(),
    );
    let trigger = Arc::new(CacheTrigger::new(
        config,
        ChangeNotifier::new(nodes.clone()),
        scheduler,
    ));

    Harness {
        nodes: nodes.clone(),
        trigger: trigger.clone(),
        admin: CategoryAdminService::new(nodes.clone(), nodes.clone())
            .with_cache_trigger(trigger.clone()),
        catalog: CategoryTreeService::new(TreeQueryEngine::new(nodes), cache)
            .with_cache_trigger_opt(Some(trigger)),
    }
}

fn recording_harness() -> (Harness, Arc<RecordingRunner>) {
    let config = config(true);
    let nodes = Arc::new(MemoryNodeStore::new());
    let store = Arc::new(MemoryStore::new(&config));
    let cache = Arc::new(CategoryCache::new(config.clone(), store.clone()));
    let runner = Arc::new(RecordingRunner::default());
    let harness = wire(config, runner.clone(), nodes, store, cache);
    (harness, runner)
}

fn tokio_harness(tagged_store: bool) -> (Harness, Arc<TokioJobRunner>) {
    let config = config(tagged_store);
    let nodes = Arc::new(MemoryNodeStore::new());
    let store = Arc::new(MemoryStore::new(&config));
    let cache = Arc::new(CategoryCache::new(config.clone(), store.clone()));
    let runner = Arc::new(TokioJobRunner::new(cache.clone()));
    let harness = wire(config, runner.clone(), nodes, store, cache);
    (harness, runner)
}

fn create(id: NodeId, parent_id: Option<NodeId>, name: &str) -> CreateCategoryCommand {
    CreateCategoryCommand {
        id: Some(id),
        parent_id,
        name: name.to_string(),
        active: true,
        position: None,
    }
}

fn rename(id: NodeId, name: &str) -> UpdateCategoryCommand {
    UpdateCategoryCommand {
        id,
        name: name.to_string(),
        active: true,
    }
}

fn shape(forest: &[TreeNode]) -> Vec<(NodeId, Vec<NodeId>)> {
    forest
        .iter()
        .map(|tree| (tree.id(), tree.children.iter().map(TreeNode::id).collect()))
        .collect()
}

fn flushed_roots(jobs: &[FlushJob]) -> Vec<BTreeSet<NodeId>> {
    let mut roots: Vec<_> = jobs
        .iter()
        .map(|job| job.scope.affected_root_ids.clone())
        .collect();
    roots.sort();
    roots
}

#[tokio::test(start_paused = true)]
async fn move_and_rename_within_window_flush_each_root_once() {
    let (harness, runner) = recording_harness();
    harness
        .admin
        .create(create(1, None, "Electronics"))
        .await
        .expect("root");
    harness
        .admin
        .create(create(2, Some(1), "Phones"))
        .await
        .expect("child");

    let forest = harness.catalog.query_tree(false).await.expect("tree");
    assert_eq!(shape(&forest), vec![(1, vec![2])]);

    tokio::time::advance(WINDOW * 2).await;
    runner.take();

    harness
        .admin
        .create(create(3, None, "Books"))
        .await
        .expect("root 3");
    harness
        .admin
        .move_node(2, Some(3), None)
        .await
        .expect("move");
    harness
        .admin
        .update(rename(1, "Consumer Electronics"))
        .await
        .expect("rename");

    let jobs = runner.take();
    assert!(jobs.iter().all(|job| job.scope.mode == ScopeMode::RootShard));
    assert_eq!(
        flushed_roots(&jobs),
        vec![BTreeSet::from([1]), BTreeSet::from([3])]
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_delete_changes_nothing_and_schedules_nothing() {
    let (harness, runner) = recording_harness();
    harness
        .admin
        .create(create(1, None, "Electronics"))
        .await
        .expect("root");
    harness
        .admin
        .create(create(2, Some(1), "Phones"))
        .await
        .expect("child");
    tokio::time::advance(WINDOW * 2).await;
    runner.take();

    let before = harness.catalog.engine().build_tree(false).await.expect("tree");
    let err = harness.admin.soft_delete(1).await.expect_err("has children");
    let after = harness.catalog.engine().build_tree(false).await.expect("tree");

    assert!(matches!(
        err,
        CategoryAdminError::Tree(TreeError::HasChildren { id: 1, .. })
    ));
    assert_eq!(before, after);
    assert!(runner.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn burst_of_updates_collapses_into_one_flush() {
    let (harness, runner) = recording_harness();
    harness
        .admin
        .create(create(1, None, "Electronics"))
        .await
        .expect("root");
    harness
        .admin
        .create(create(2, Some(1), "Phones"))
        .await
        .expect("child");
    tokio::time::advance(WINDOW * 2).await;
    runner.take();

    for round in 0..5 {
        harness
            .admin
            .update(rename(2, &format!("Phones {round}")))
            .await
            .expect("rename");
        tokio::time::advance(WINDOW / 10).await;
    }

    assert_eq!(runner.take().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn spaced_updates_each_get_a_flush() {
    let (harness, runner) = recording_harness();
    harness
        .admin
        .create(create(1, None, "Electronics"))
        .await
        .expect("root");
    tokio::time::advance(WINDOW * 2).await;
    runner.take();

    for round in 0..5 {
        harness
            .admin
            .update(rename(1, &format!("Electronics {round}")))
            .await
            .expect("rename");
        tokio::time::advance(WINDOW * 10).await;
    }

    let jobs = runner.take();
    assert_eq!(jobs.len(), 5);
    assert!(
        jobs.iter()
            .all(|job| job.scope.affected_root_ids == BTreeSet::from([1]))
    );
}

async fn seed_two_roots(harness: &Harness) {
    for command in [
        create(1, None, "Electronics"),
        create(2, Some(1), "Phones"),
        create(3, None, "Books"),
        create(7, Some(3), "Novels"),
    ] {
        harness.admin.create(command).await.expect("seed");
    }
}

async fn assert_shard_isolation(tagged_store: bool) {
    let (harness, runner) = tokio_harness(tagged_store);
    seed_two_roots(&harness).await;
    runner.wait_idle().await;

    let books_before = harness.catalog.query_breadcrumbs(7).await.expect("query");
    harness.catalog.query_breadcrumbs(2).await.expect("query");

    // An edit under root 3 that bypasses the pipeline stays invisible as long
    // as only root 1 is flushed.
    let mut novels = harness.nodes.get_by_id(7).await.expect("lookup").expect("novels");
    novels.name = "Fiction".to_string();
    harness.nodes.put(novels);

    harness
        .admin
        .update(rename(2, "Mobiles"))
        .await
        .expect("rename phones");
    runner.wait_idle().await;

    let phones = harness
        .catalog
        .query_breadcrumbs(2)
        .await
        .expect("query")
        .expect("chain");
    assert_eq!(phones[1].name, "Mobiles");

    let books_after = harness.catalog.query_breadcrumbs(7).await.expect("query");
    assert_eq!(books_before, books_after);
    assert_eq!(books_after.expect("chain")[1].name, "Novels");
}

#[tokio::test(start_paused = true)]
async fn flushing_one_root_keeps_other_shards_with_tag_index() {
    assert_shard_isolation(true).await;
}

#[tokio::test(start_paused = true)]
async fn flushing_one_root_keeps_other_shards_with_registry() {
    assert_shard_isolation(false).await;
}

#[tokio::test(start_paused = true)]
async fn reads_after_flush_see_committed_moves() {
    let (harness, runner) = tokio_harness(true);
    seed_two_roots(&harness).await;
    runner.wait_idle().await;

    let forest = harness.catalog.query_tree(false).await.expect("tree");
    assert_eq!(shape(&forest), vec![(1, vec![2]), (3, vec![7])]);
    let descendants = harness.catalog.query_descendants(3).await.expect("query");
    assert_eq!(descendants.map(|nodes| nodes.len()), Some(1));

    harness
        .admin
        .move_node(2, Some(3), None)
        .await
        .expect("move");
    runner.wait_idle().await;

    let forest = harness.catalog.query_tree(false).await.expect("tree");
    assert_eq!(shape(&forest), vec![(1, vec![]), (3, vec![7, 2])]);
    let chain = harness
        .catalog
        .query_breadcrumbs(2)
        .await
        .expect("query")
        .expect("chain");
    assert_eq!(
        chain.iter().map(|node| node.id).collect::<Vec<_>>(),
        vec![3, 2]
    );
    let descendants = harness
        .catalog
        .query_descendants(3)
        .await
        .expect("query")
        .expect("found");
    assert_eq!(descendants.len(), 2);
    let stats = harness
        .catalog
        .query_depth_statistics()
        .await
        .expect("stats");
    assert_eq!(stats.total_nodes, 4);

    let tracker = runner.tracker();
    assert!(tracker.job_ids().iter().all(|id| matches!(
        tracker.state(*id),
        Some(FlushJobState::Completed { .. })
    )));
}

#[tokio::test(start_paused = true)]
async fn warm_cache_is_idempotent() {
    let (harness, runner) = tokio_harness(true);
    seed_two_roots(&harness).await;
    runner.wait_idle().await;

    let first = harness.catalog.warm_cache(false, false).await.expect("warm");
    let second = harness.catalog.warm_cache(false, false).await.expect("warm");

    assert_eq!(first.entries, second.entries);
    assert_eq!(second.hits, second.entries);
    assert_eq!(second.misses, 0);
}

fn flaky_admin(harness: &Harness) -> (CategoryAdminService, Arc<FlakyWriter>) {
    let writer = Arc::new(FlakyWriter::new(harness.nodes.clone()));
    let admin = CategoryAdminService::new(harness.nodes.clone(), writer.clone())
        .with_cache_trigger(harness.trigger.clone());
    (admin, writer)
}

#[tokio::test(start_paused = true)]
async fn create_failing_after_insert_still_schedules_a_flush() {
    let (harness, runner) = recording_harness();
    harness
        .admin
        .create(create(1, None, "Electronics"))
        .await
        .expect("root");
    harness
        .admin
        .create(create(2, Some(1), "Phones"))
        .await
        .expect("child");
    tokio::time::advance(WINDOW * 2).await;
    runner.take();

    let (admin, writer) = flaky_admin(&harness);
    writer.arm();
    let result = admin
        .create(CreateCategoryCommand {
            position: Some(1),
            ..create(3, Some(1), "Laptops")
        })
        .await;

    assert!(matches!(
        result,
        Err(CategoryAdminError::Repo(RepoError::Timeout))
    ));
    assert!(harness.nodes.get_by_id(3).await.expect("lookup").is_some());
    assert_eq!(flushed_roots(&runner.take()), vec![BTreeSet::from([1])]);
}

#[tokio::test(start_paused = true)]
async fn soft_delete_failing_to_close_gap_still_schedules_a_flush() {
    let (harness, runner) = recording_harness();
    for command in [
        create(1, None, "Electronics"),
        create(2, Some(1), "Phones"),
        create(4, Some(1), "Laptops"),
    ] {
        harness.admin.create(command).await.expect("seed");
    }
    tokio::time::advance(WINDOW * 2).await;
    runner.take();

    let (admin, writer) = flaky_admin(&harness);
    writer.arm();
    assert!(admin.soft_delete(2).await.is_err());

    let phones = harness.nodes.get_by_id(2).await.expect("lookup").expect("phones");
    assert!(phones.is_deleted());
    assert_eq!(flushed_roots(&runner.take()), vec![BTreeSet::from([1])]);
}

#[tokio::test(start_paused = true)]
async fn failed_move_changes_nothing_and_schedules_nothing() {
    let (harness, runner) = recording_harness();
    seed_two_roots(&harness).await;
    tokio::time::advance(WINDOW * 2).await;
    runner.take();

    let before = harness.catalog.engine().build_tree(false).await.expect("tree");
    let (admin, writer) = flaky_admin(&harness);
    writer.arm();
    assert!(admin.move_node(2, Some(3), Some(1)).await.is_err());
    let after = harness.catalog.engine().build_tree(false).await.expect("tree");

    assert_eq!(before, after);
    assert!(runner.take().is_empty());
}
