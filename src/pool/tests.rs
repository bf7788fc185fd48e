//! Pool tests against the in-memory store and real local repositories.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::{TempDir, tempdir};

use super::*;
use crate::git::testing::origin_with;
use crate::handler::{ErrorHandler, HandlerError, PrintHandler};
use crate::metrics::testing::{counter, debugging};
use crate::store::{Catalog, FileTaskStore, MemoryTaskStore, Pipeline};
use crate::types::Task;

// ─── Test doubles ───

/// Counts calls and fails for one repository.
#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
    fail_repo: Option<String>,
}

#[async_trait]
impl Handler for CountingHandler {
    async fn handle(
        &self,
        _token: &CancellationToken,
        workdir: &Path,
        group: &TaskGroup,
        _hooks: &dyn HookRunner,
    ) -> HandlerReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(workdir.join(".git").exists());
        if self.fail_repo.as_deref() == Some(group.repo_uri.repo.as_str()) {
            return HandlerReport::failed(vec!["partial".to_string()], HandlerError::Thrown);
        }
        HandlerReport::ok(vec!["looked".to_string()])
    }
}

/// Claims every group it lists before handing them out, as a competing pool
/// winning the race would.
struct RacingStore {
    inner: MemoryTaskStore,
}

#[async_trait]
impl TaskStore for RacingStore {
    async fn channel_decoder_get(&self, channel: &str) -> crate::store::Result<Option<String>> {
        self.inner.channel_decoder_get(channel).await
    }

    async fn tasks_append(
        &self,
        messages: &[String],
        channel: &str,
    ) -> crate::store::Result<Vec<TaskId>> {
        self.inner.tasks_append(messages, channel).await
    }

    async fn task_groups_list_pending(&self) -> crate::store::Result<Vec<TaskGroup>> {
        let groups = self.inner.task_groups_list_pending().await?;
        for group in &groups {
            self.inner
                .task_groups_status_comp_swap(&CompSwap::claim(group))
                .await?;
        }
        Ok(groups)
    }

    async fn task_groups_status_comp_swap(
        &self,
        swap: &CompSwap,
    ) -> crate::store::Result<Vec<TaskId>> {
        self.inner.task_groups_status_comp_swap(swap).await
    }

    async fn tasks_list(&self) -> crate::store::Result<Vec<Task>> {
        self.inner.tasks_list().await
    }
}

/// Fails every listing.
struct BrokenStore;

#[async_trait]
impl TaskStore for BrokenStore {
    async fn channel_decoder_get(&self, _channel: &str) -> crate::store::Result<Option<String>> {
        Ok(None)
    }

    async fn tasks_append(
        &self,
        _messages: &[String],
        _channel: &str,
    ) -> crate::store::Result<Vec<TaskId>> {
        Err(StoreError::Poisoned)
    }

    async fn task_groups_list_pending(&self) -> crate::store::Result<Vec<TaskGroup>> {
        Err(StoreError::Poisoned)
    }

    async fn task_groups_status_comp_swap(
        &self,
        _swap: &CompSwap,
    ) -> crate::store::Result<Vec<TaskId>> {
        Err(StoreError::Poisoned)
    }

    async fn tasks_list(&self) -> crate::store::Result<Vec<Task>> {
        Ok(vec![])
    }
}

// ─── Fixtures ───

struct Fixture {
    dir: TempDir,
    store: MemoryTaskStore,
    cache: Arc<RepoCache>,
    urls: Vec<String>,
}

fn pipeline(name: &str, url: &str, channels: &[&str]) -> Pipeline {
    Pipeline {
        name: name.to_string(),
        repo_uri: PackageUri::new(url, "main", ""),
        dest_branch: Some("kobold".to_string()),
        post_hook: None,
        channels: channels.iter().map(|c| c.to_string()).collect(),
    }
}

/// Two local origins, `a` on channel `hub` and `b` on `hub` and `quay`.
async fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let a = origin_with(&dir.path().join("a"), &[("deploy.yaml", "image: nginx\n")]).await;
    let b = origin_with(&dir.path().join("b"), &[("deploy.yaml", "image: redis\n")]).await;

    let catalog = Catalog::default()
        .with_channel("hub")
        .with_channel("quay")
        .with_decoded_channel("json", "tr ',' '\\n'")
        .with_decoded_channel("broken", "exit 1")
        .with_pipeline(pipeline("a", &a, &["hub", "json", "broken"]))
        .with_pipeline(pipeline("b", &b, &["hub", "quay"]));

    Fixture {
        store: MemoryTaskStore::new(catalog).unwrap(),
        cache: Arc::new(RepoCache::new(dir.path().join("cache"), Metrics::noop())),
        urls: vec![a, b],
        dir,
    }
}

fn pool(fx: &Fixture, handler: Arc<dyn Handler>, config: PoolConfig) -> Pool {
    Pool::new(
        &CancellationToken::new(),
        Arc::new(fx.store.clone()),
        Arc::clone(&fx.cache),
        handler,
        config,
    )
}

async fn tasks(fx: &Fixture) -> Vec<Task> {
    fx.store.tasks_list().await.unwrap()
}

fn namespaces_empty(fx: &Fixture) -> bool {
    let dir = fx.dir.path().join("cache").join("namespaces");
    std::fs::read_dir(&dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

// ─── Queue ───

#[tokio::test]
async fn queue_splits_lines_without_decoder() {
    let fx = fixture().await;
    let pool = pool(&fx, Arc::new(PrintHandler), PoolConfig::new(2));

    let ids = pool.queue("quay", b"  redis:7.2\n\n\tpostgres:16 \n").await.unwrap();
    assert_eq!(ids.len(), 1);

    let task = &tasks(&fx).await[0];
    assert_eq!(task.messages, vec!["redis:7.2", "postgres:16"]);
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn queue_runs_channel_decoder() {
    let fx = fixture().await;
    let pool = pool(&fx, Arc::new(PrintHandler), PoolConfig::new(2));

    pool.queue("json", b"nginx:1.27,busybox:1.36").await.unwrap();
    assert_eq!(tasks(&fx).await[0].messages, vec!["nginx:1.27", "busybox:1.36"]);
}

#[tokio::test]
async fn queue_rejections_are_per_event() {
    let fx = fixture().await;
    let (metrics, snapshotter) = debugging();
    let pool = pool(
        &fx,
        Arc::new(PrintHandler),
        PoolConfig::new(2).with_metrics(metrics),
    );

    let err = pool.queue("nope", b"nginx:1").await.unwrap_err();
    assert!(matches!(err, QueueError::ChannelNotFound(ref c) if c == "nope"));
    assert!(err.is_per_event());

    let err = pool.queue("broken", b"{}").await.unwrap_err();
    assert!(matches!(err, QueueError::NotDecodable(DecodeError::Plugin(_))));

    let err = pool.queue("hub", b"\n  \n").await.unwrap_err();
    assert!(matches!(err, QueueError::NotDecodable(DecodeError::Empty)));
    assert!(err.is_per_event());

    pool.queue("hub", b"nginx:1.27").await.unwrap();

    assert!(tasks(&fx).await.iter().all(|t| t.messages == vec!["nginx:1.27"]));
    assert_eq!(
        counter(&snapshotter, "kobold_recv_total", &[("rejected", "true")]),
        3
    );
    assert_eq!(
        counter(&snapshotter, "kobold_recv_total", &[("rejected", "false")]),
        1
    );
    assert_eq!(
        counter(&snapshotter, "kobold_image_seen_total", &[("ref", "nginx:1.27")]),
        1
    );
}

#[tokio::test]
async fn store_failure_while_queueing_is_not_per_event() {
    let dir = tempdir().unwrap();
    let pool = Pool::new(
        &CancellationToken::new(),
        Arc::new(BrokenStore),
        Arc::new(RepoCache::new(dir.path(), Metrics::noop())),
        Arc::new(PrintHandler),
        PoolConfig::new(1),
    );

    let err = pool.queue("hub", b"nginx:1").await.unwrap_err();
    assert!(matches!(err, QueueError::Store(StoreError::Poisoned)));
    assert!(!err.is_per_event());
}

#[tokio::test]
async fn queue_lines_queues_each_line() {
    let fx = fixture().await;
    let pool = pool(&fx, Arc::new(PrintHandler), PoolConfig::new(1));

    let input: &[u8] = b"nginx:1.27\n\n  \nredis:7\nbusybox:1.36";
    let ids = pool.queue_lines("quay", input).await.unwrap();
    assert_eq!(ids.len(), 3);

    let mut messages: Vec<_> = tasks(&fx).await.into_iter().flat_map(|t| t.messages).collect();
    messages.sort();
    assert_eq!(messages, vec!["busybox:1.36", "nginx:1.27", "redis:7"]);
}

#[tokio::test]
async fn queue_lines_stops_at_first_rejection() {
    let fx = fixture().await;
    let pool = pool(&fx, Arc::new(PrintHandler), PoolConfig::new(1));

    let input: &[u8] = b"nginx:1.27\n";
    let err = pool.queue_lines("nope", input).await.unwrap_err();
    assert!(matches!(err, QueueError::ChannelNotFound(_)));
    assert!(tasks(&fx).await.is_empty());
}

#[tokio::test]
async fn cancelled_pool_does_not_run_decoders() {
    let fx = fixture().await;
    let pool = pool(&fx, Arc::new(PrintHandler), PoolConfig::new(1));
    pool.cancel();

    let err = pool.queue("json", b"nginx:1.27").await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::NotDecodable(DecodeError::Plugin(PluginError::Cancelled))
    ));
    assert!(tasks(&fx).await.is_empty());
}

// ─── Dispatch ───

#[tokio::test]
async fn dispatch_runs_every_group_to_success() {
    let fx = fixture().await;
    let (metrics, snapshotter) = debugging();
    let handler = Arc::new(CountingHandler::default());
    let pool = pool(&fx, handler.clone(), PoolConfig::new(2).with_metrics(metrics));

    pool.queue("hub", b"nginx:1.27").await.unwrap();
    pool.queue("quay", b"redis:7").await.unwrap();
    pool.queue("hub", b"busybox:1.36").await.unwrap();

    pool.dispatch().await.unwrap();
    pool.wait().await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    let tasks = tasks(&fx).await;
    assert_eq!(tasks.len(), 5);
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.warnings, vec!["looked"]);
        assert!(task.failure_reason.is_none());
        assert!(task.task_group_fingerprint.is_some());
    }

    // Tasks of one group share the fingerprint of their sorted ids.
    let b_tasks: Vec<&Task> = tasks.iter().filter(|t| t.repo_uri.repo == fx.urls[1]).collect();
    assert_eq!(b_tasks.len(), 3);
    let mut ids: Vec<TaskId> = b_tasks.iter().map(|t| t.id.clone()).collect();
    ids.sort();
    let fingerprint = crate::types::Fingerprint::of_ids(&ids);
    assert!(b_tasks.iter().all(|t| t.task_group_fingerprint.as_ref() == Some(&fingerprint)));

    assert_eq!(
        counter(&snapshotter, "kobold_run_total", &[("status", "success")]),
        2
    );
    assert!(namespaces_empty(&fx));

    // Nothing is left for a second cycle.
    pool.dispatch().await.unwrap();
    pool.wait().await.unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failing_group_does_not_stop_the_others() {
    let fx = fixture().await;
    let handler = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
        fail_repo: Some(fx.urls[0].clone()),
    });
    let pool = pool(&fx, handler.clone(), PoolConfig::new(1));

    pool.queue("hub", b"nginx:1.27").await.unwrap();
    pool.dispatch().await.unwrap();
    pool.wait().await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    for task in tasks(&fx).await {
        if task.repo_uri.repo == fx.urls[0] {
            assert_eq!(task.status, TaskStatus::Failure);
            assert_eq!(task.failure_reason.as_deref(), Some("task handler error"));
            assert_eq!(task.warnings, vec!["partial"]);
        } else {
            assert_eq!(task.status, TaskStatus::Success);
        }
    }
}

#[tokio::test]
async fn error_handler_fails_everything() {
    let fx = fixture().await;
    let pool = pool(&fx, Arc::new(ErrorHandler), PoolConfig::new(4));

    pool.queue("hub", b"nginx:1.27").await.unwrap();
    pool.dispatch().await.unwrap();
    pool.wait().await.unwrap();

    assert!(tasks(&fx).await.iter().all(|t| t.status == TaskStatus::Failure));
}

#[tokio::test]
async fn unreachable_repository_fails_only_its_group() {
    let fx = fixture().await;
    let missing = format!("file://{}", fx.dir.path().join("missing").display());

    let catalog = Catalog::default()
        .with_channel("hub")
        .with_pipeline(pipeline("gone", &missing, &["hub"]))
        .with_pipeline(pipeline("a", &fx.urls[0], &["hub"]));
    let store = MemoryTaskStore::new(catalog).unwrap();
    let handler = Arc::new(CountingHandler::default());
    let pool = Pool::new(
        &CancellationToken::new(),
        Arc::new(store.clone()),
        Arc::clone(&fx.cache),
        handler.clone(),
        PoolConfig::new(2),
    );

    pool.queue("hub", b"nginx:1.27").await.unwrap();
    pool.dispatch().await.unwrap();
    pool.wait().await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    for task in store.tasks_list().await.unwrap() {
        if task.repo_uri.repo == missing {
            assert_eq!(task.status, TaskStatus::Failure);
            let reason = task.failure_reason.unwrap();
            assert!(reason.contains("not cached"), "{reason}");
        } else {
            assert_eq!(task.status, TaskStatus::Success);
        }
    }
}

#[tokio::test]
async fn lost_claim_is_fatal() {
    let fx = fixture().await;
    let handler = Arc::new(CountingHandler::default());
    let pool = Pool::new(
        &CancellationToken::new(),
        Arc::new(RacingStore {
            inner: fx.store.clone(),
        }),
        Arc::clone(&fx.cache),
        handler.clone(),
        PoolConfig::new(2),
    );

    pool.queue("quay", b"redis:7").await.unwrap();
    pool.dispatch().await.unwrap();

    let err = pool.wait().await.unwrap_err();
    match err {
        PoolError::ClaimMismatch {
            required,
            status,
            swapped,
            expected,
        } => {
            assert_eq!(required, TaskStatus::Pending);
            assert_eq!(status, TaskStatus::Running);
            assert!(swapped.is_empty());
            assert_eq!(expected.len(), 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert!(pool.token().is_cancelled());
    assert!(matches!(pool.dispatch().await, Err(PoolError::Cancelled)));
}

#[tokio::test]
async fn listing_failure_is_fatal() {
    let dir = tempdir().unwrap();
    let pool = Pool::new(
        &CancellationToken::new(),
        Arc::new(BrokenStore),
        Arc::new(RepoCache::new(dir.path(), Metrics::noop())),
        Arc::new(PrintHandler),
        PoolConfig::new(1),
    );

    assert!(matches!(
        pool.dispatch().await,
        Err(PoolError::Store(StoreError::Poisoned))
    ));
    assert!(matches!(
        pool.wait().await,
        Err(PoolError::Store(StoreError::Poisoned))
    ));
    assert!(pool.dispatch().await.is_err());
}

#[tokio::test]
async fn cancelled_pool_refuses_dispatch_and_leaves_tasks_pending() {
    let fx = fixture().await;
    let pool = pool(&fx, Arc::new(PrintHandler), PoolConfig::new(1));

    pool.queue("hub", b"nginx:1.27").await.unwrap();
    pool.cancel();

    assert!(matches!(pool.dispatch().await, Err(PoolError::Cancelled)));
    pool.wait().await.unwrap();
    assert!(tasks(&fx).await.iter().all(|t| t.status == TaskStatus::Pending));
}

// ─── Claims under contention ───

const CLAIMANTS: usize = 16;

fn claim_catalog() -> Catalog {
    Catalog::default().with_channel("hub").with_pipeline(pipeline(
        "infra",
        "https://example.com/infra",
        &["hub"],
    ))
}

/// Races `CLAIMANTS` claims for one group on worker threads and returns
/// what each claimant swapped.
async fn race_claims(store: Arc<dyn TaskStore>) -> (TaskGroup, Vec<Vec<TaskId>>) {
    for image in ["nginx:1.27", "redis:7", "busybox:1.36"] {
        store.tasks_append(&[image.to_string()], "hub").await.unwrap();
    }
    let groups = store.task_groups_list_pending().await.unwrap();
    assert_eq!(groups.len(), 1);
    let group = groups.into_iter().next().unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(CLAIMANTS));
    let mut claimants = Vec::new();
    for _ in 0..CLAIMANTS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        let swap = CompSwap::claim(&group);
        claimants.push(tokio::spawn(async move {
            barrier.wait().await;
            store.task_groups_status_comp_swap(&swap).await.unwrap()
        }));
    }

    let mut results = Vec::new();
    for claimant in claimants {
        results.push(claimant.await.unwrap());
    }
    (group, results)
}

fn assert_single_winner(group: &TaskGroup, results: &[Vec<TaskId>]) {
    let winners: Vec<_> = results.iter().filter(|r| !r.is_empty()).collect();
    assert_eq!(winners.len(), 1, "claims: {results:?}");
    assert_eq!(winners[0], &group.task_ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_grants_one_claim() {
    let store = MemoryTaskStore::new(claim_catalog()).unwrap();
    let (group, results) = race_claims(Arc::new(store.clone())).await;

    assert_single_winner(&group, &results);
    let tasks = store.tasks_list().await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Running));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_store_grants_one_claim() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");
    let store = FileTaskStore::open(&path, claim_catalog()).unwrap();
    let (group, results) = race_claims(Arc::new(store)).await;

    assert_single_winner(&group, &results);

    // The journal agrees after a restart.
    let reopened = FileTaskStore::open(&path, claim_catalog()).unwrap();
    let tasks = reopened.tasks_list().await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Running));
    assert!(reopened.task_groups_list_pending().await.unwrap().is_empty());
}
