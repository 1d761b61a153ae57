// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Pre/post-navigation hooks and the error handler, run in declared order around every request.

use async_trait::async_trait;

use crate::error::CrawlerError;

/// One step of a `preNavigationHooks`/`postNavigationHooks` chain. A hook failure is treated
/// exactly like a request-handler failure: it goes through the same retry classification.
#[async_trait]
pub trait Hook<Ctx>: Send + Sync {
    async fn call(&self, ctx: &Ctx) -> Result<(), CrawlerError>;
}

#[async_trait]
impl<Ctx, F, Fut> Hook<Ctx> for F
where
    Ctx: Sync,
    F: Fn(&Ctx) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), CrawlerError>> + Send,
{
    async fn call(&self, ctx: &Ctx) -> Result<(), CrawlerError> {
        (self)(ctx).await
    }
}

/// Invoked on every non-final error, before the retry/reclaim decision is made.
#[async_trait]
pub trait ErrorHandler<Ctx>: Send + Sync {
    async fn call(&self, ctx: &Ctx, error: &CrawlerError);
}

#[async_trait]
impl<Ctx, F, Fut> ErrorHandler<Ctx> for F
where
    Ctx: Sync,
    F: Fn(&Ctx, &CrawlerError) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn call(&self, ctx: &Ctx, error: &CrawlerError) {
        (self)(ctx, error).await
    }
}

/// The ordered hook chains and error/failure handlers a runtime invokes around each request.
pub struct Hooks<Ctx> {
    pub pre_navigation: Vec<Box<dyn Hook<Ctx>>>,
    pub post_navigation: Vec<Box<dyn Hook<Ctx>>>,
    pub error_handler: Option<Box<dyn ErrorHandler<Ctx>>>,
    pub failed_request_handler: Option<Box<dyn ErrorHandler<Ctx>>>,
}

impl<Ctx> Default for Hooks<Ctx> {
    fn default() -> Self {
        Self {
            pre_navigation: Vec::new(),
            post_navigation: Vec::new(),
            error_handler: None,
            failed_request_handler: None,
        }
    }
}

impl<Ctx: Sync> Hooks<Ctx> {
    /// Runs all pre-navigation hooks in order, stopping at the first failure.
    pub async fn run_pre_navigation(&self, ctx: &Ctx) -> Result<(), CrawlerError> {
        for hook in &self.pre_navigation {
            hook.call(ctx).await?;
        }
        Ok(())
    }

    pub async fn run_post_navigation(&self, ctx: &Ctx) -> Result<(), CrawlerError> {
        for hook in &self.post_navigation {
            hook.call(ctx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn pre_navigation_hooks_run_in_order_and_stop_on_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_a = calls.clone();
        let calls_b = calls.clone();
        let mut hooks: Hooks<()> = Hooks::default();
        hooks.pre_navigation.push(Box::new(move |_ctx: &()| {
            let calls = calls_a.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(CrawlerError::RequestHandler("boom".to_string()))
            }
        }));
        hooks.pre_navigation.push(Box::new(move |_ctx: &()| {
            let calls = calls_b.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }));

        let result = hooks.run_pre_navigation(&()).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
