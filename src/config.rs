// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Cross-request defaults consulted by the parser and the garbage collector.
///
/// Mirrors the handful of globals the original engine reads from its compiled-in config module;
/// here they're just fields on a struct constructed once and threaded through by reference.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Default and ceiling for `WITHCURSOR MAXIDLE`, when the request doesn't override it.
    pub cursor_max_idle: Duration,

    /// Largest `offset + limit` a simple-mode request may ask for.
    pub search_max_results: u64,

    /// Largest number of fields a single `SORTBY` may name.
    pub sort_max_fields: usize,

    /// How long the fork GC sleeps between collection cycles.
    pub fork_gc_retry_interval: Duration,

    /// Minimum fraction of garbage in a block before the GC bothers repairing it.
    pub fork_gc_clean_threshold: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cursor_max_idle: Duration::from_secs(300),
            search_max_results: 1_000_000,
            sort_max_fields: 64,
            fork_gc_retry_interval: Duration::from_secs(30),
            fork_gc_clean_threshold: 0.1,
        }
    }
}
