// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! End-to-end crawl scenarios, each driving a real `CrawlerRuntime` over the in-memory backends
//! with a scripted navigation strategy standing in for the network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crawler::{
    CrawlerConfig, CrawlerError, CrawlerRuntime, CrawlingContext, DefaultContextBuilder,
    DefaultUniqueKeyFn, Hooks, NavigationStrategy, Request, Response, Router, UniqueKeyFn,
};
use crawler_stats::Statistics;
use kvstore::{KvStore, MemoryDatasetSink, MemoryKvStore, MemoryQueueBackend};
use parking_lot::Mutex;
use request_queue::RequestQueue;
use task_executor::Executor;
use url::Url;

type Ctx = CrawlingContext<MemoryQueueBackend, MemoryDatasetSink, Response>;
type Runtime = CrawlerRuntime<ScriptedNavigation, DefaultContextBuilder, MemoryQueueBackend, MemoryDatasetSink>;

#[derive(Clone, Copy, Debug)]
enum NavOutcome {
    Ok(u16),
    Err,
}

/// Stands in for a real transport: returns scripted outcomes per request `unique_key`, falling
/// back to a configurable default, and logs what it observed for assertions.
struct ScriptedNavigation {
    scripts: Mutex<HashMap<String, VecDeque<NavOutcome>>>,
    default_outcome: Mutex<NavOutcome>,
    calls: AtomicUsize,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    simulate_work: bool,
    path_log: Mutex<Vec<String>>,
    session_log: Mutex<Vec<String>>,
}

impl ScriptedNavigation {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_outcome: Mutex::new(NavOutcome::Ok(200)),
            calls: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            simulate_work: false,
            path_log: Mutex::new(Vec::new()),
            session_log: Mutex::new(Vec::new()),
        }
    }

    fn with_simulated_work() -> Self {
        Self {
            simulate_work: true,
            ..Self::new()
        }
    }

    fn script(&self, unique_key: &str, outcomes: Vec<NavOutcome>) {
        self.scripts
            .lock()
            .insert(unique_key.to_string(), outcomes.into_iter().collect());
    }

    fn set_default(&self, outcome: NavOutcome) {
        *self.default_outcome.lock() = outcome;
    }
}

#[async_trait]
impl NavigationStrategy<MemoryQueueBackend, MemoryDatasetSink, Response> for ScriptedNavigation {
    async fn navigate(&self, ctx: &Ctx, _timeout: Duration) -> Result<Response, CrawlerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.path_log.lock().push(ctx.request().url.path().to_string());
        if let Some(session) = ctx.session() {
            self.session_log.lock().push(session.id().to_string());
        }

        if self.simulate_work {
            let current = self.current.fetch_add(1, Ordering::Relaxed) + 1;
            self.max_concurrent.fetch_max(current, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::Relaxed);
        }

        let outcome = {
            let mut scripts = self.scripts.lock();
            scripts
                .get_mut(&ctx.request().unique_key)
                .and_then(VecDeque::pop_front)
                .unwrap_or(*self.default_outcome.lock())
        };

        match outcome {
            NavOutcome::Ok(status) => Ok(Response {
                status,
                headers: Default::default(),
                final_url: ctx.request().url.clone(),
                body: Bytes::new(),
            }),
            NavOutcome::Err => Err(CrawlerError::Navigation("scripted navigation failure".to_string())),
        }
    }
}

fn no_op_router() -> Router<Ctx> {
    let mut router = Router::new();
    router.set_default_handler(|_ctx: &Ctx| async { Ok(()) });
    router
}

fn serial_config() -> CrawlerConfig {
    CrawlerConfig {
        min_concurrency: 1,
        max_concurrency: 1,
        persistence_interval: Duration::from_secs(3600),
        autoscaled_pool_options: autoscaled_pool::AutoscaledPoolOptions {
            desired_concurrency: 1,
            scaling_interval: Duration::from_secs(3600),
            ..CrawlerConfig::default().autoscaled_pool_options
        },
        ..CrawlerConfig::default()
    }
}

fn build_runtime(
    nav: Arc<ScriptedNavigation>,
    router: Router<Ctx>,
    hooks: Hooks<Ctx>,
    config: CrawlerConfig,
) -> (Arc<Runtime>, Arc<RequestQueue<MemoryQueueBackend>>, Arc<MemoryDatasetSink>) {
    let queue = Arc::new(RequestQueue::new(MemoryQueueBackend::new()));
    let sink = Arc::new(MemoryDatasetSink::new());
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let stats = Arc::new(Statistics::new());

    let runtime = Runtime::new(
        config,
        queue.clone(),
        None,
        sink.clone(),
        kv,
        stats,
        nav,
        Arc::new(DefaultContextBuilder),
        hooks,
        router,
        None,
    )
    .expect("test configuration is valid");

    (Arc::new(runtime), queue, sink)
}

async fn enqueue(queue: &RequestQueue<MemoryQueueBackend>, request: &Request, forefront: bool) {
    let payload = serde_json::to_vec(request).unwrap();
    queue
        .add(&request.unique_key, Bytes::from(payload), forefront)
        .await
        .unwrap();
}

#[tokio::test]
async fn s1_duplicate_urls_are_deduplicated_across_a_crawl() {
    let a = Request::get(Url::parse("https://Example.com/path").unwrap());
    let b = Request::get(Url::parse("https://example.com/path").unwrap());
    assert_eq!(a.unique_key, b.unique_key, "equivalent URLs must share a dedup key");

    let nav = Arc::new(ScriptedNavigation::new());
    let (runtime, queue, sink) = build_runtime(nav.clone(), no_op_router(), Hooks::default(), serial_config());

    enqueue(&queue, &a, false).await;
    enqueue(&queue, &b, false).await;

    let executor = Executor::new();
    runtime.run(&executor).await.unwrap();

    assert_eq!(nav.calls.load(Ordering::Relaxed), 1, "the duplicate insert must not be a second entry");
    assert_eq!(runtime.stats().snapshot().requests_finished, 1);
    assert_eq!(sink.snapshot().len(), 0);
}

#[tokio::test]
async fn s2_forefront_enqueue_overtakes_pending_tail_requests() {
    let nav = Arc::new(ScriptedNavigation::new());

    let mut router = Router::new();
    router.add_handler("seed", |ctx: &Ctx| async move {
        let follow_up = Request::get(Url::parse("https://example.com/c").unwrap());
        ctx.add_requests(vec![follow_up], true)
            .await
            .map_err(|e| CrawlerError::RequestHandler(e.to_string()))
    });
    router.set_default_handler(|_ctx: &Ctx| async { Ok(()) });

    let (runtime, queue, _sink) = build_runtime(nav.clone(), router, Hooks::default(), serial_config());

    let mut a = Request::get(Url::parse("https://example.com/a").unwrap());
    a.label = Some("seed".to_string());
    let b = Request::get(Url::parse("https://example.com/b").unwrap());
    enqueue(&queue, &a, false).await;
    enqueue(&queue, &b, false).await;

    let executor = Executor::new();
    runtime.run(&executor).await.unwrap();

    assert_eq!(
        *nav.path_log.lock(),
        vec!["/a".to_string(), "/c".to_string(), "/b".to_string()],
        "the forefront-enqueued /c must be served before the already-pending tail /b"
    );
}

#[tokio::test]
async fn s3_an_abandoned_lock_is_reclaimable_once_it_expires() {
    let queue = RequestQueue::with_lock_secs(MemoryQueueBackend::new(), 0);
    let outcome = queue.add("https://example.com/a", Bytes::new(), false).await.unwrap();

    let first = queue.fetch_next(10).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, outcome.id);

    // Nothing reclaimed or marked handled; with lock_secs = 0 the lock is already expired by the
    // time of the next read, so the entry must be refetchable without an explicit reclaim call.
    let second = queue.fetch_next(10).await.unwrap();
    assert_eq!(second.len(), 1, "an abandoned lock must not hide the entry forever");
    assert_eq!(second[0].id, outcome.id);
}

#[tokio::test]
async fn s4_final_failure_is_preceded_by_the_configured_number_of_retries() {
    let nav = Arc::new(ScriptedNavigation::new());
    nav.set_default(NavOutcome::Err);

    let failed_calls = Arc::new(AtomicUsize::new(0));
    let failed_calls_clone = failed_calls.clone();
    let mut hooks: Hooks<Ctx> = Hooks::default();
    hooks.failed_request_handler = Some(Box::new(move |_ctx: &Ctx, _err: &CrawlerError| {
        let failed_calls = failed_calls_clone.clone();
        async move {
            failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }));

    let config = CrawlerConfig {
        max_request_retries: 2,
        ..serial_config()
    };
    let (runtime, queue, _sink) = build_runtime(nav.clone(), no_op_router(), hooks, config);

    let request = Request::get(Url::parse("https://example.com/always-fails").unwrap());
    enqueue(&queue, &request, false).await;

    let executor = Executor::new();
    runtime.run(&executor).await.unwrap();

    assert_eq!(nav.calls.load(Ordering::Relaxed), 3, "2 retries means 3 total handler invocations");
    assert_eq!(failed_calls.load(Ordering::Relaxed), 1);

    let snapshot = runtime.stats().snapshot();
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.requests_retried, 2);
    assert_eq!(snapshot.retry_histogram.get(&3), Some(&1), "bucketed by total runs, not retries remaining");
}

#[tokio::test]
async fn s5_a_blocked_status_code_retires_the_session_and_reclaims_to_the_forefront() {
    let nav = Arc::new(ScriptedNavigation::new());
    let request = Request::get(Url::parse("https://example.com/protected").unwrap());
    nav.script(&request.unique_key, vec![NavOutcome::Ok(429), NavOutcome::Ok(200)]);

    let (runtime, queue, _sink) = build_runtime(nav.clone(), no_op_router(), Hooks::default(), serial_config());
    enqueue(&queue, &request, false).await;

    let executor = Executor::new();
    runtime.run(&executor).await.unwrap();

    assert_eq!(nav.calls.load(Ordering::Relaxed), 2, "429 then success: exactly two attempts");
    let sessions = nav.session_log.lock().clone();
    assert_eq!(sessions.len(), 2);
    assert_ne!(sessions[0], sessions[1], "a blocked session must not be reused on retry");

    let snapshot = runtime.stats().snapshot();
    assert_eq!(snapshot.requests_finished, 1);
    assert_eq!(snapshot.requests_failed, 0);
    assert_eq!(snapshot.requests_retried, 1);
}

#[tokio::test]
async fn s6_the_autoscaled_pool_never_exceeds_its_configured_concurrency_ceiling() {
    let nav = Arc::new(ScriptedNavigation::with_simulated_work());

    let config = CrawlerConfig {
        min_concurrency: 2,
        max_concurrency: 2,
        autoscaled_pool_options: autoscaled_pool::AutoscaledPoolOptions {
            min_concurrency: 2,
            max_concurrency: 2,
            desired_concurrency: 2,
            scaling_interval: Duration::from_secs(3600),
            ..CrawlerConfig::default().autoscaled_pool_options
        },
        ..CrawlerConfig::default()
    };
    let (runtime, queue, _sink) = build_runtime(nav.clone(), no_op_router(), Hooks::default(), config);

    for i in 0..8 {
        let request = Request::get(Url::parse(&format!("https://example.com/{i}")).unwrap());
        enqueue(&queue, &request, false).await;
    }

    let executor = Executor::new();
    runtime.run(&executor).await.unwrap();

    assert_eq!(nav.calls.load(Ordering::Relaxed), 8);
    assert!(
        nav.max_concurrent.load(Ordering::Relaxed) <= 2,
        "the pool must never run more than max_concurrency tasks at once"
    );
}

// `DefaultUniqueKeyFn` is exercised indirectly above via `Request::get`; this confirms the type is
// part of the crate's public surface for callers wiring up a bespoke `ContextBuilder`.
#[test]
fn default_unique_key_fn_is_exported() {
    let _: Box<dyn UniqueKeyFn> = Box::new(DefaultUniqueKeyFn);
}
