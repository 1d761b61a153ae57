// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Ties the request queue, request list, session pool, autoscaled pool, and statistics into one
//! end-to-end crawl runtime, generic over a navigation strategy and a context builder.

mod config;
mod context;
mod error;
mod hooks;
mod proxy;
mod request;
mod router;
mod runtime;
mod transport;

pub use config::CrawlerConfig;
pub use context::CrawlingContext;
pub use error::CrawlerError;
pub use hooks::{ErrorHandler, Hook, Hooks};
pub use proxy::{ProxyTierOptions, TieredProxyProvider};
pub use request::{DefaultUniqueKeyFn, PayloadSensitiveUniqueKeyFn, Request, UniqueKeyFn};
pub use router::{Handler, Router};
pub use runtime::{ContextBuilder, CrawlerRuntime, DefaultContextBuilder, NavigationStrategy, RuntimeState};
pub use transport::{BrowserController, BrowserCookie, Page, Response, SendOptions, StatusCodeHint, Transport};
