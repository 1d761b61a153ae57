// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Label-based request dispatch: a map from `Request::label` to handler, with a typed default.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CrawlerError;

/// A request handler: the user code invoked once navigation has produced a context.
#[async_trait]
pub trait Handler<Ctx>: Send + Sync {
    async fn handle(&self, ctx: &Ctx) -> Result<(), CrawlerError>;
}

#[async_trait]
impl<Ctx, F, Fut> Handler<Ctx> for F
where
    Ctx: Sync,
    F: Fn(&Ctx) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), CrawlerError>> + Send,
{
    async fn handle(&self, ctx: &Ctx) -> Result<(), CrawlerError> {
        (self)(ctx).await
    }
}

/// Dispatches to a handler chosen by `Request::label`, falling back to a default handler when the
/// label is absent or unregistered.
pub struct Router<Ctx> {
    routes: HashMap<String, Box<dyn Handler<Ctx>>>,
    default: Option<Box<dyn Handler<Ctx>>>,
}

impl<Ctx> Default for Router<Ctx> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            default: None,
        }
    }
}

impl<Ctx: Sync> Router<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&mut self, label: impl Into<String>, handler: impl Handler<Ctx> + 'static) {
        self.routes.insert(label.into(), Box::new(handler));
    }

    pub fn set_default_handler(&mut self, handler: impl Handler<Ctx> + 'static) {
        self.default = Some(Box::new(handler));
    }

    pub async fn dispatch(&self, label: Option<&str>, ctx: &Ctx) -> Result<(), CrawlerError> {
        if let Some(label) = label {
            if let Some(handler) = self.routes.get(label) {
                return handler.handle(ctx).await;
            }
        }
        match &self.default {
            Some(handler) => handler.handle(ctx).await,
            None => Err(CrawlerError::Configuration(format!(
                "no handler registered for label {label:?} and no default handler set"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn dispatches_by_label_and_falls_back_to_default() {
        let labeled_calls = Arc::new(AtomicUsize::new(0));
        let default_calls = Arc::new(AtomicUsize::new(0));
        let mut router: Router<()> = Router::new();

        let labeled = labeled_calls.clone();
        router.add_handler("detail", move |_ctx: &()| {
            let labeled = labeled.clone();
            async move {
                labeled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });

        let default = default_calls.clone();
        router.set_default_handler(move |_ctx: &()| {
            let default = default.clone();
            async move {
                default.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });

        router.dispatch(Some("detail"), &()).await.unwrap();
        router.dispatch(Some("unknown"), &()).await.unwrap();
        router.dispatch(None, &()).await.unwrap();

        assert_eq!(labeled_calls.load(Ordering::Relaxed), 1);
        assert_eq!(default_calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn missing_default_is_a_configuration_error() {
        let router: Router<()> = Router::new();
        let result = router.dispatch(None, &()).await;
        assert!(matches!(result, Err(CrawlerError::Configuration(_))));
    }
}
