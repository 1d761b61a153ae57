// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

///
/// Logs a message directly to stderr, bypassing the `log` facade entirely. Useful from code
/// paths that must not assume a logger has been installed yet (panics during `init`, signal
/// handlers).
///
#[macro_export]
macro_rules! fatal_log {
    ($($arg:tt)+) => {
        eprintln!($($arg)+)
    };
}

pub mod logger;

use std::sync::Once;

static INIT: Once = Once::new();

///
/// Installs a process-wide `env_logger`-based logger at the given default level. Safe to call
/// more than once; only the first call takes effect.
///
/// The crawl engine itself never reaches for a global logger implicitly: this initializer exists
/// for binaries and tests, and library code always logs through the ambient `log` facade without
/// assuming any particular logger is installed.
///
pub fn init(level: log::LevelFilter) {
    INIT.call_once(|| {
        logger::install(level);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(log::LevelFilter::Info);
        init(log::LevelFilter::Debug);
    }
}
