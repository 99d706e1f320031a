// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Database configuration

use std::path::PathBuf;

/// Configuration for a [`crate::Database`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for WAL segments, snapshots, and the MANIFEST.
    /// `None` runs fully in memory with no durability.
    pub path: Option<PathBuf>,
    /// Background flush cadence in milliseconds. `0` fsyncs before every
    /// commit returns.
    pub flush_interval_ms: u64,
    /// Worker pool size for parallel joins. `0` = hardware concurrency.
    pub workers: usize,
    /// Maximum tag value size in bytes.
    pub max_val_bytes: usize,
    /// Maximum ttype identifier size in bytes.
    pub max_ttype_bytes: usize,
    /// Set size above which joins are partitioned across workers.
    pub parallel_threshold: usize,
    /// Bound on the planner memo cache.
    pub memo_cache_entries: usize,
    /// Raise `QueryTypeError` for unknown ttypes instead of returning the
    /// empty set.
    pub strict_types: bool,
    /// Cap on live tags. `0` = unlimited.
    pub max_live_tags: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval_ms: 200,
            workers: 0,
            max_val_bytes: 1024,
            max_ttype_bytes: 64,
            parallel_threshold: 1024,
            memo_cache_entries: 10_000,
            strict_types: false,
            max_live_tags: 0,
        }
    }
}

impl Config {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval: u64) -> Self {
        self.flush_interval_ms = interval;
        self
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn with_strict_types(mut self, strict: bool) -> Self {
        self.strict_types = strict;
        self
    }
}
