// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

///
/// Installs a process-wide `env_logger` instance with a deterministic, timestamped format, at
/// the given default level. `RUST_LOG` still overrides the level of individual targets, matching
/// `env_logger`'s usual behavior.
///
pub fn install(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init()
        .ok();
}
