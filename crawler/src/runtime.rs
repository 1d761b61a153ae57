// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Ties the request queue, request list, session pool, autoscaled pool, and statistics into one
//! end-to-end crawl.
//!
//! The deep `Basic -> Http -> Browser -> Cheerio -> Puppeteer -> Playwright` crawler inheritance
//! chain collapses here to one generic `CrawlerRuntime` over two small traits: `NavigationStrategy`
//! (how to actually fetch/render a request) and `ContextBuilder` (how to assemble the handle
//! handed to hooks and the handler). A concrete crawler flavor is just a pair of implementations
//! of those two traits, mirroring the `Node`/`NodeContext` trait pair the dependency graph engine
//! uses to stay generic over what kind of work a node performs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use autoscaled_pool::{AutoscaledPool, PoolTasks};
use bytes::Bytes;
use crawler_stats::Statistics;
use kvstore::{DatasetSink, KvStore, QueueBackend};
use parking_lot::Mutex;
use request_list::RequestList;
use request_queue::RequestQueue;
use session_pool::SessionPool;
use task_executor::Executor;

use crate::config::CrawlerConfig;
use crate::context::CrawlingContext;
use crate::error::CrawlerError;
use crate::hooks::Hooks;
use crate::proxy::TieredProxyProvider;
use crate::request::{Request, UniqueKeyFn};
use crate::router::Router;

/// Produces whatever a handler needs to see from a fetch/render step (an HTTP response, a browser
/// page). `Output` is shared with `ContextBuilder`'s `CrawlingContext<B, S, Output>`.
#[async_trait]
pub trait NavigationStrategy<B: QueueBackend, S: DatasetSink, Output: Send + 'static>:
    Send + Sync + 'static
{
    async fn navigate(
        &self,
        ctx: &CrawlingContext<B, S, Output>,
        timeout: Duration,
    ) -> Result<Output, CrawlerError>;
}

/// Builds the context handed to hooks and the handler for one request. Implementations are
/// expected to be stateless factories; per-request state lives entirely on the context they build.
pub trait ContextBuilder<B: QueueBackend, S: DatasetSink>: Send + Sync + 'static {
    type Output: Send + 'static;

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        queue: Arc<RequestQueue<B>>,
        sink: Arc<S>,
        unique_key_fn: Arc<dyn UniqueKeyFn>,
        request: Request,
        session: Option<Arc<session_pool::Session>>,
    ) -> CrawlingContext<B, S, Self::Output>;
}

/// The stock context builder: just `CrawlingContext` with no wrapping, for navigation strategies
/// whose `Output` (e.g. a plain HTTP response) needs no further decoration.
pub struct DefaultContextBuilder;

impl<B: QueueBackend, S: DatasetSink> ContextBuilder<B, S> for DefaultContextBuilder {
    type Output = crate::transport::Response;

    fn build(
        &self,
        queue: Arc<RequestQueue<B>>,
        sink: Arc<S>,
        unique_key_fn: Arc<dyn UniqueKeyFn>,
        request: Request,
        session: Option<Arc<session_pool::Session>>,
    ) -> CrawlingContext<B, S, Self::Output> {
        CrawlingContext::new(queue, sink, unique_key_fn, request, session)
    }
}

/// The crawl's coarse lifecycle state, mirroring `Idle -> Running -> (Stopping | Aborted) ->
/// Stopped`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeState {
    Idle,
    Running,
    Stopping,
    Aborted,
    Stopped,
}

/// Drives one crawl end to end: seeds the queue from the request list, then repeatedly fetches,
/// navigates, dispatches, and classifies outcomes for requests under the autoscaled pool's
/// concurrency control until the queue and list are both finished (or `max_requests_per_crawl`,
/// or an external abort, cuts it short first).
pub struct CrawlerRuntime<N, C, B, S>
where
    B: QueueBackend,
    S: DatasetSink,
    C: ContextBuilder<B, S>,
    C::Output: crate::transport::StatusCodeHint,
    N: NavigationStrategy<B, S, C::Output>,
{
    config: CrawlerConfig,
    queue: Arc<RequestQueue<B>>,
    list: Option<Arc<RequestList<Request>>>,
    session_pool: Option<Arc<SessionPool>>,
    sink: Arc<S>,
    kv: Arc<dyn KvStore>,
    stats: Arc<Statistics>,
    hooks: Hooks<CrawlingContext<B, S, C::Output>>,
    router: Router<CrawlingContext<B, S, C::Output>>,
    navigation: Arc<N>,
    context_builder: Arc<C>,
    proxy: Option<Arc<TieredProxyProvider>>,
    unique_key_fn: Arc<dyn UniqueKeyFn>,
    state: Mutex<RuntimeState>,
    abort: Arc<AtomicBool>,
    handled_count: AtomicU64,
    run_id: String,
    /// Rolling window of recently completed tasks, `true` where the outcome was a runtime-
    /// classified overload error (currently: a navigation or handler timeout).
    client_error_samples: Mutex<VecDeque<bool>>,
}

/// How many recent task outcomes `client_error_ratio` considers.
const CLIENT_ERROR_WINDOW: usize = 20;

impl<N, C, B, S> CrawlerRuntime<N, C, B, S>
where
    B: QueueBackend,
    S: DatasetSink,
    C: ContextBuilder<B, S>,
    C::Output: crate::transport::StatusCodeHint,
    N: NavigationStrategy<B, S, C::Output>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CrawlerConfig,
        queue: Arc<RequestQueue<B>>,
        list: Option<Arc<RequestList<Request>>>,
        sink: Arc<S>,
        kv: Arc<dyn KvStore>,
        stats: Arc<Statistics>,
        navigation: Arc<N>,
        context_builder: Arc<C>,
        hooks: Hooks<CrawlingContext<B, S, C::Output>>,
        router: Router<CrawlingContext<B, S, C::Output>>,
        proxy: Option<Arc<TieredProxyProvider>>,
    ) -> Result<Self, CrawlerError> {
        config.validate()?;
        let session_pool = config
            .use_session_pool
            .then(|| Arc::new(SessionPool::new(config.session_pool_options)));
        Ok(Self {
            config,
            queue,
            list,
            session_pool,
            sink,
            kv,
            stats,
            hooks,
            router,
            navigation,
            context_builder,
            proxy,
            unique_key_fn: Arc::new(crate::request::DefaultUniqueKeyFn),
            state: Mutex::new(RuntimeState::Idle),
            abort: Arc::new(AtomicBool::new(false)),
            handled_count: AtomicU64::new(0),
            run_id: uuid::Uuid::new_v4().to_string(),
            client_error_samples: Mutex::new(VecDeque::with_capacity(CLIENT_ERROR_WINDOW)),
        })
    }

    /// Records one completed task's outcome into the rolling client-error window.
    fn record_client_error_sample(&self, overloaded: bool) {
        let mut samples = self.client_error_samples.lock();
        samples.push_back(overloaded);
        if samples.len() > CLIENT_ERROR_WINDOW {
            samples.pop_front();
        }
    }

    fn client_error_ratio_snapshot(&self) -> f64 {
        let samples = self.client_error_samples.lock();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().filter(|s| **s).count() as f64 / samples.len() as f64
    }

    /// Checkpoints statistics, the session pool, and the request list under their stable keys.
    async fn persist_state(&self) {
        if let Err(e) = self.stats.persist(self.kv.as_ref(), &self.run_id).await {
            log::warn!("failed to persist statistics: {e}");
        }
        if let Some(pool) = &self.session_pool {
            if let Err(e) = pool.persist(self.kv.as_ref()).await {
                log::warn!("failed to persist session pool: {e}");
            }
        }
        if let Some(list) = &self.list {
            if let Err(e) = list.persist(self.kv.as_ref()).await {
                log::warn!("failed to persist request list: {e}");
            }
        }
    }

    fn spawn_persistence_loop(self: &Arc<Self>, executor: &Executor) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = self.config.persistence_interval;
        executor.native_spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.persist_state().await;
                if this.abort.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.lock()
    }

    /// Requests a graceful stop: no new requests are dispatched, but in-flight ones finish.
    pub fn abort(&self) {
        *self.state.lock() = RuntimeState::Aborted;
        self.abort.store(true, Ordering::Relaxed);
    }

    fn max_requests_reached(&self) -> bool {
        match self.config.max_requests_per_crawl {
            Some(cap) => self.handled_count.load(Ordering::Relaxed) >= cap,
            None => false,
        }
    }

    /// Drains every seed in the request list into the queue, marking each list entry handled as
    /// soon as it is durably enqueued. The list's own notion of "finished" is therefore about
    /// seeding, not about the seeds having been crawled — crawl completion is tracked by the
    /// queue alone from this point on.
    async fn seed_queue_from_list(&self) -> Result<(), CrawlerError> {
        let Some(list) = &self.list else {
            return Ok(());
        };
        while let Some((index, request)) = list.fetch_next() {
            let unique_key = self.unique_key_fn.unique_key(&request);
            let payload = serde_json::to_vec(&request)
                .map_err(|e| CrawlerError::Configuration(format!("seed request not serializable: {e}")))?;
            self.queue.add(&unique_key, Bytes::from(payload), false).await?;
            list.mark_handled(index);
        }
        Ok(())
    }

    fn host_of(request: &Request) -> String {
        request.url.host_str().unwrap_or("").to_string()
    }

    async fn run_one(&self, id: kvstore::RequestId, payload: Bytes) {
        let start = Instant::now();
        let mut request: Request = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => {
                log::error!("dropping unparseable queue entry {id}: {e}");
                let _ = self.queue.delete(id).await;
                return;
            }
        };
        request.id = Some(id);

        let session = self.session_pool.as_ref().map(|pool| pool.get_session());
        let host = Self::host_of(&request);
        let proxy_url = self.proxy.as_ref().and_then(|p| p.select(&host).map(str::to_string));

        let ctx = self.context_builder.build(
            self.queue.clone(),
            self.sink.clone(),
            self.unique_key_fn.clone(),
            request.clone(),
            session.clone(),
        );

        let outcome = self.drive_one(&ctx, proxy_url.as_deref()).await;

        match outcome {
            Ok(()) => {
                self.record_client_error_sample(false);
                self.stats.record_finished(start.elapsed());
                if let Some(session) = &session {
                    session.mark_good();
                }
                if let Some(proxy) = &self.proxy {
                    proxy.record_success(&host);
                }
                if let Err(e) = self.queue.mark_handled(id).await {
                    log::warn!("failed to mark request {id} handled: {e}");
                }
                self.handled_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.record_client_error_sample(matches!(error, CrawlerError::Timeout(_)));
                self.handle_failure(&ctx, id, request, start, error, session.as_ref(), &host)
                    .await;
            }
        }
    }

    async fn drive_one(
        &self,
        ctx: &CrawlingContext<B, S, C::Output>,
        proxy_url: Option<&str>,
    ) -> Result<(), CrawlerError> {
        self.hooks.run_pre_navigation(ctx).await?;

        let nav_timeout = Duration::from_secs(self.config.navigation_timeout_secs);
        let output = tokio::time::timeout(nav_timeout, self.navigation.navigate(ctx, nav_timeout))
            .await
            .map_err(|_| CrawlerError::Timeout("navigation deadline exceeded".to_string()))?;
        let output = output?;
        let _ = proxy_url;
        if let Some(code) = crate::transport::StatusCodeHint::status_code_hint(&output) {
            self.stats.record_status_code(code);
            if self.config.blocked_status_codes.contains(&code) {
                return Err(CrawlerError::Blocked(format!("response status {code}")));
            }
        }
        ctx.set_response(output);

        self.hooks.run_post_navigation(ctx).await?;

        let handler_timeout = Duration::from_secs(self.config.request_handler_timeout_secs);
        tokio::time::timeout(handler_timeout, self.router.dispatch(ctx.request().label.as_deref(), ctx))
            .await
            .map_err(|_| CrawlerError::Timeout("request handler deadline exceeded".to_string()))?
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        ctx: &CrawlingContext<B, S, C::Output>,
        id: kvstore::RequestId,
        mut request: Request,
        start: Instant,
        error: CrawlerError,
        session: Option<&Arc<session_pool::Session>>,
        host: &str,
    ) {
        if let Some(hook) = &self.hooks.error_handler {
            hook.call(ctx, &error).await;
        }

        if let Some(session) = session {
            if matches!(error, CrawlerError::Blocked(_)) {
                session.retire();
            } else {
                session.mark_bad(1.0);
            }
        }
        if let Some(proxy) = &self.proxy {
            if matches!(error, CrawlerError::Navigation(_) | CrawlerError::Timeout(_)) {
                proxy.record_error(host);
            }
        }

        // Count this attempt before judging finality, so a request that has now failed
        // `max_request_retries + 1` times (the original attempt plus every retry) is the one that
        // trips the cap, and the recorded histogram bucket reflects the total number of runs.
        request.retry_count += 1;
        let is_final = request.no_retry
            || request.retry_count > self.config.max_request_retries
            || !error.is_retriable();

        if is_final {
            self.stats
                .record_final_failure(start.elapsed(), request.retry_count, error.kind(), &error.to_string());
            if let Some(hook) = &self.hooks.failed_request_handler {
                hook.call(ctx, &error).await;
            }
            if let Err(e) = self.queue.mark_handled(id).await {
                log::warn!("failed to mark failed request {id} handled: {e}");
            }
            self.handled_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.record_retry(error.kind(), &error.to_string());
        request.error_messages.push(error.to_string());

        // Session/proxy-flavored errors get another shot soon, with a fresh identity next time;
        // ordinary handler errors go to the tail so healthier requests aren't starved behind them.
        let forefront = matches!(error, CrawlerError::Blocked(_) | CrawlerError::Navigation(_));
        if let Err(e) = self.queue.reclaim(id, forefront).await {
            log::warn!("failed to reclaim request {id}: {e}");
        }
    }

    /// Runs the crawl to completion under an autoscaled pool, seeding the queue from the request
    /// list first.
    pub async fn run(self: Arc<Self>, executor: &Executor) -> Result<(), CrawlerError> {
        *self.state.lock() = RuntimeState::Running;
        self.stats.start();
        self.seed_queue_from_list().await?;

        let persistence = self.spawn_persistence_loop(executor);

        let pool_options = self.config.clone().into_autoscaled_pool_options();
        let pool = Arc::new(AutoscaledPool::new(self.clone(), pool_options));
        pool.run(executor).await;

        persistence.abort();
        // Draining is already complete by the time `pool.run` returns (it blocks on its own
        // shutdown drain), but we still pass through `Stopping` so a concurrent `abort()` caller
        // cannot observe a state transition straight from `Running` to a terminal state.
        *self.state.lock() = RuntimeState::Stopping;
        let final_state = if self.abort.load(Ordering::Relaxed) {
            RuntimeState::Aborted
        } else {
            RuntimeState::Stopped
        };
        *self.state.lock() = final_state;
        self.stats.finish();
        self.persist_state().await;
        Ok(())
    }
}

#[async_trait]
impl<N, C, B, S> PoolTasks for CrawlerRuntime<N, C, B, S>
where
    B: QueueBackend,
    S: DatasetSink,
    C: ContextBuilder<B, S>,
    C::Output: crate::transport::StatusCodeHint,
    N: NavigationStrategy<B, S, C::Output>,
{
    async fn is_task_ready(&self) -> bool {
        if self.abort.load(Ordering::Relaxed) || self.max_requests_reached() {
            return false;
        }
        !matches!(self.queue.is_empty().await, Ok(true) | Err(_))
    }

    async fn run_task(&self) {
        let fetched = match self.queue.fetch_next(1).await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("failed to fetch next request: {e}");
                return;
            }
        };
        let Some(record) = fetched.into_iter().next() else {
            return;
        };
        self.run_one(record.id, record.payload).await;
    }

    async fn is_finished(&self) -> bool {
        if self.abort.load(Ordering::Relaxed) || self.max_requests_reached() {
            return true;
        }
        if self.config.keep_alive {
            return false;
        }
        let list_finished = self.list.as_ref().map_or(true, |l| l.is_finished());
        list_finished && self.queue.is_finished().await.unwrap_or(false)
    }

    async fn client_error_ratio(&self) -> f64 {
        self.client_error_ratio_snapshot()
    }
}
