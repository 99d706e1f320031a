// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Database entry point
//!
//! Wires the store, transaction manager, WAL, planner, executor, and caches
//! behind one handle. `fetch` walks the query lifecycle (parse, plan,
//! execute) against a view captured at entry; writes go through transactions
//! from [`Database::begin`] or the single-op auto-commit helpers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::ast::ast::{OverlayRef, OverlayStmt};
use crate::ast::parse_query;
use crate::cache::{MemoCache, MemoCacheStats};
use crate::config::Config;
use crate::error::ZipTagError;
use crate::exec::{CancelHandle, ExecContext, Executor, QueryPhase};
use crate::plan::{explain as explain_plan, QueryPlanner};
use crate::store::{
    link_key, validate_ttype, validate_val, TagRef, TagStore, View,
};
use crate::txn::snapshot::{
    remove_snapshots_before, write_manifest, write_snapshot, Manifest,
};
use crate::txn::wal::remove_segments_before;
use crate::txn::{recover, Limits, RecoveryReport, Tx, TxDelta, TxnManager, Wal};

/// WAL growth between background snapshots.
const SNAPSHOT_WAL_BYTES: u64 = 8 * 1024 * 1024;
/// Snapshotter poll interval.
const SNAPSHOT_TICK: Duration = Duration::from_millis(100);

/// One matching tag in a query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagHit {
    pub tref: TagRef,
    pub ttype: String,
    pub val: String,
}

/// Result of a fetch: a set of tags rendered in ascending tref order.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// Revision the query executed against.
    pub rev: u64,
    pub tags: Vec<TagHit>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn vals(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.val.as_str()).collect()
    }

    /// JSON rendering: an array of `{tref, ttype, val}` objects.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.tags).unwrap_or(serde_json::Value::Null)
    }
}

/// Options for [`Database::fetch_with`].
#[derive(Default)]
pub struct FetchOptions<'a> {
    /// Snapshot revision to read at; defaults to the current revision.
    pub rev: Option<u64>,
    /// Uncommitted transactions layered over the base, in order.
    pub overlays: Vec<&'a Tx>,
    pub cancel: Option<CancelHandle>,
}

/// Live-state counters.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub current_rev: u64,
    pub next_tref: u64,
    pub live_tags: usize,
    pub live_links: usize,
    pub ttypes: usize,
}

/// An embedded ZipTag database.
pub struct Database {
    config: Config,
    store: Arc<TagStore>,
    manager: Arc<TxnManager>,
    wal: Option<Arc<Wal>>,
    memo: Arc<MemoCache>,
    planner: QueryPlanner,
    executor: Executor,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    recovery: Option<RecoveryReport>,
}

impl Database {
    /// Open a database: recover from the data directory if one is
    /// configured, then start the background flusher and snapshotter.
    pub fn open(config: Config) -> Result<Self, ZipTagError> {
        let mut recovery = None;
        let (store, wal) = match &config.path {
            Some(path) => {
                std::fs::create_dir_all(path)
                    .map_err(|e| ZipTagError::DurabilityIoFailed(e.to_string()))?;
                let (store, report) = recover(path)?;
                info!(
                    "opened database at {} (rev {}, {} txs replayed)",
                    path.display(),
                    report.recovered_rev,
                    report.transactions_replayed
                );
                let wal = Arc::new(Wal::open(path, config.flush_interval_ms)?);
                recovery = Some(report);
                (Arc::new(store), Some(wal))
            }
            None => (Arc::new(TagStore::new()), None),
        };

        let memo = Arc::new(MemoCache::new(config.memo_cache_entries));
        memo.invalidate(store.current_rev());

        let limits = Limits {
            max_ttype_bytes: config.max_ttype_bytes,
            max_val_bytes: config.max_val_bytes,
            max_live_tags: config.max_live_tags,
        };
        let first_txid = recovery.as_ref().map(|r| r.last_txid + 1).unwrap_or(1);
        let manager = Arc::new(TxnManager::new(
            store.clone(),
            wal.clone(),
            memo.clone(),
            limits,
            config.flush_interval_ms == 0,
            first_txid,
        ));
        let executor = Executor::new(config.workers, config.parallel_threshold)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();
        if let (Some(wal), Some(path)) = (&wal, &config.path) {
            threads.push(spawn_flusher(wal.clone())?);
            threads.push(spawn_snapshotter(
                manager.clone(),
                store.clone(),
                wal.clone(),
                path.clone(),
                shutdown.clone(),
            )?);
        }

        Ok(Self {
            config,
            store,
            manager,
            wal,
            memo,
            planner: QueryPlanner::new(),
            executor,
            shutdown,
            threads: Mutex::new(threads),
            recovery,
        })
    }

    /// Open an ephemeral in-memory database (no durability).
    pub fn open_in_memory() -> Result<Self, ZipTagError> {
        Self::open(Config::default())
    }

    pub fn current_rev(&self) -> u64 {
        self.store.current_rev()
    }

    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Open a transaction against the current revision.
    pub fn begin(&self) -> Tx {
        self.manager.begin()
    }

    /// Run a query against the current revision with no overlays.
    pub fn fetch(&self, query: &str) -> Result<QueryResult, ZipTagError> {
        self.fetch_with(query, FetchOptions::default())
    }

    /// Run a query against `(base rev, overlays)`.
    pub fn fetch_with(
        &self,
        query: &str,
        opts: FetchOptions<'_>,
    ) -> Result<QueryResult, ZipTagError> {
        debug!("query phase: {}", QueryPhase::Parsing);
        let ast = parse_query(query)?;

        let gen = self.store.generation();
        let rev = opts.rev.unwrap_or(gen.rev);
        if rev > gen.rev {
            return Err(ZipTagError::Validation(format!(
                "rev {} is ahead of the current rev {}",
                rev, gen.rev
            )));
        }

        let mut overlays: Vec<Arc<TxDelta>> = opts
            .overlays
            .iter()
            .filter(|tx| !tx.delta().is_empty())
            .map(|tx| Arc::new(tx.delta().clone()))
            .collect();
        if !ast.overlay.is_empty() {
            let base_view = View::new(gen.clone(), rev, overlays.clone());
            let block = self.compile_overlay(&ast.overlay, &base_view)?;
            overlays.push(Arc::new(block));
        }
        let view = View::new(gen.clone(), rev, overlays);

        debug!("query phase: {}", QueryPhase::Planning);
        let plan = self.planner.plan(&ast, &view);

        debug!("query phase: {}", QueryPhase::Executing);
        let shared_memo = if !view.has_overlays() && rev == gen.rev {
            Some(self.memo.as_ref())
        } else {
            None
        };
        let mut ctx = ExecContext::new(
            &view,
            self.config.strict_types,
            opts.cancel.as_ref(),
            shared_memo,
        );
        let trefs = self.executor.run(&plan, &mut ctx)?;

        let tags = trefs
            .into_iter()
            .filter_map(|tref| {
                view.ident(tref).map(|(ttype, val)| TagHit {
                    tref,
                    ttype: ttype.to_string(),
                    val: val.to_string(),
                })
            })
            .collect();
        debug!("query phase: {}", QueryPhase::Done);
        Ok(QueryResult { rev, tags })
    }

    /// Render the optimized plan for a query.
    pub fn explain(&self, query: &str) -> Result<String, ZipTagError> {
        let ast = parse_query(query)?;
        let gen = self.store.generation();
        let mut overlays = Vec::new();
        if !ast.overlay.is_empty() {
            let base_view = View::new(gen.clone(), gen.rev, Vec::new());
            overlays.push(Arc::new(self.compile_overlay(&ast.overlay, &base_view)?));
        }
        let view = View::new(gen.clone(), gen.rev, overlays);
        let plan = self.planner.plan(&ast, &view);
        Ok(explain_plan(&plan, &view))
    }

    /// Identity lookup that surfaces a miss as [`ZipTagError::NotFound`].
    pub fn get_tag(&self, ttype: &str, val: &str) -> Result<TagHit, ZipTagError> {
        let gen = self.store.generation();
        let tref = gen
            .lookup_identity(ttype, val, gen.rev)
            .ok_or_else(|| ZipTagError::NotFound(format!("{}:{}", ttype, val)))?;
        Ok(TagHit {
            tref,
            ttype: ttype.to_string(),
            val: val.to_string(),
        })
    }

    /// Auto-commit: add one tag. Returns its (stable) tref.
    pub fn add_tag(&self, ttype: &str, val: &str) -> Result<TagRef, ZipTagError> {
        let mut tx = self.begin();
        let staged = tx.add_tag(ttype, val)?;
        if !staged.is_placeholder() {
            tx.abort();
            return Ok(staged);
        }
        let rev = tx.commit()?;
        self.store
            .generation()
            .lookup_identity(ttype, val, rev)
            .ok_or_else(|| ZipTagError::NotFound(format!("{}:{}", ttype, val)))
    }

    /// Auto-commit: tombstone one tag. Returns whether anything was removed.
    pub fn rem_tag(&self, ttype: &str, val: &str) -> Result<bool, ZipTagError> {
        let mut tx = self.begin();
        let removed = tx.rem_tag(ttype, val)?;
        if removed {
            tx.commit()?;
        } else {
            tx.abort();
        }
        Ok(removed)
    }

    /// Auto-commit: link two tags.
    pub fn link(&self, a: TagRef, b: TagRef) -> Result<bool, ZipTagError> {
        let mut tx = self.begin();
        let added = tx.link(a, b)?;
        if added {
            tx.commit()?;
        } else {
            tx.abort();
        }
        Ok(added)
    }

    /// Auto-commit: unlink two tags.
    pub fn unlink(&self, a: TagRef, b: TagRef) -> Result<bool, ZipTagError> {
        let mut tx = self.begin();
        let removed = tx.unlink(a, b)?;
        if removed {
            tx.commit()?;
        } else {
            tx.abort();
        }
        Ok(removed)
    }

    /// Block until the WAL tail is fsynced.
    pub fn sync(&self) -> Result<(), ZipTagError> {
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    /// Snapshot at the current revision, truncate older WAL segments, and
    /// prune in-memory tombstones below the snapshot.
    pub fn compact(&self) -> Result<u64, ZipTagError> {
        let path = self.config.path.as_ref().ok_or_else(|| {
            ZipTagError::Validation("compaction requires a data directory".to_string())
        })?;
        checkpoint(&self.manager, &self.store, path)
    }

    pub fn stats(&self) -> StoreStats {
        let gen = self.store.generation();
        StoreStats {
            current_rev: gen.rev,
            next_tref: gen.next_tref,
            live_tags: gen.live_tag_count(),
            live_links: gen.live_link_count(),
            ttypes: gen.type_count(),
        }
    }

    pub fn cache_stats(&self) -> MemoCacheStats {
        self.memo.stats()
    }

    /// Compile a `with { ... }` block into an overlay delta against the
    /// supplied base view.
    fn compile_overlay(
        &self,
        stmts: &[OverlayStmt],
        base_view: &View,
    ) -> Result<TxDelta, ZipTagError> {
        fn resolve_ident(
            delta: &TxDelta,
            base_view: &View,
            ttype: &str,
            val: &str,
        ) -> Option<TagRef> {
            if let Some(&staged) = delta.new_tags.get(&(ttype.to_string(), val.to_string())) {
                if !delta.tombstoned.contains(&staged) {
                    return Some(staged);
                }
                return None;
            }
            base_view
                .lookup_identity(ttype, val)
                .filter(|tref| !delta.tombstoned.contains(tref))
        }

        let limits = self.manager.limits();
        let mut delta = TxDelta::new(base_view.rev());
        let mut aliases: HashMap<String, TagRef> = HashMap::new();

        for stmt in stmts {
            match stmt {
                OverlayStmt::AddTag { ttype, val, alias } => {
                    validate_ttype(ttype, limits.max_ttype_bytes)?;
                    validate_val(val, limits.max_val_bytes)?;
                    let tref = match resolve_ident(&delta, base_view, ttype, val) {
                        Some(existing) => existing,
                        None => delta.stage_tag(ttype, val),
                    };
                    if let Some(name) = alias {
                        aliases.insert(name.clone(), tref);
                    }
                }
                OverlayStmt::RemTag { ttype, val } => {
                    if let Some(tref) = resolve_ident(&delta, base_view, ttype, val) {
                        delta.tombstoned.insert(tref);
                    }
                }
                OverlayStmt::Link { a, b } | OverlayStmt::Unlink { a, b } => {
                    let resolve_ref = |delta: &TxDelta, r: &OverlayRef| match r {
                        OverlayRef::Alias(name) => {
                            aliases.get(name).copied().ok_or_else(|| {
                                ZipTagError::Validation(format!(
                                    "unknown overlay alias {:?}",
                                    name
                                ))
                            })
                        }
                        OverlayRef::Identity { ttype, val } => {
                            resolve_ident(delta, base_view, ttype, val).ok_or_else(|| {
                                ZipTagError::NotFound(format!("{}:{}", ttype, val))
                            })
                        }
                    };
                    let ra = resolve_ref(&delta, a)?;
                    let rb = resolve_ref(&delta, b)?;
                    if ra == rb {
                        return Err(ZipTagError::Validation(
                            "self-links are not allowed".to_string(),
                        ));
                    }
                    let key = link_key(ra, rb);
                    let base_linked = !ra.is_placeholder()
                        && !rb.is_placeholder()
                        && base_view.link_present(ra, rb);
                    if matches!(stmt, OverlayStmt::Link { .. }) {
                        delta.removed_links.remove(&key);
                        if !base_linked {
                            delta.added_links.insert(key);
                        }
                    } else if !delta.added_links.remove(&key) && base_linked {
                        delta.removed_links.insert(key);
                    }
                }
            }
        }
        Ok(delta)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(wal) = &self.wal {
            wal.shutdown();
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("background thread panicked during shutdown");
            }
        }
        if let Some(wal) = &self.wal {
            if let Err(e) = wal.sync() {
                warn!("final wal sync failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("rev", &self.current_rev())
            .field("path", &self.config.path)
            .finish()
    }
}

/// Snapshot + manifest + truncation, serialized against commits by the
/// checkpoint barrier.
fn checkpoint(
    manager: &TxnManager,
    store: &TagStore,
    dir: &Path,
) -> Result<u64, ZipTagError> {
    let (gen, head) = manager.checkpoint_barrier()?;
    write_snapshot(dir, &gen)?;
    write_manifest(
        dir,
        &Manifest {
            snapshot_rev: Some(gen.rev),
            wal_head: head.unwrap_or(1),
        },
    )?;
    if let Some(head) = head {
        remove_segments_before(dir, head)?;
    }
    remove_snapshots_before(dir, gen.rev)?;
    store.install_compacted(gen.rev);
    info!("checkpoint complete at rev {}", gen.rev);
    Ok(gen.rev)
}

fn spawn_flusher(wal: Arc<Wal>) -> Result<JoinHandle<()>, ZipTagError> {
    std::thread::Builder::new()
        .name("ziptag-wal-flusher".to_string())
        .spawn(move || wal.run_flusher())
        .map_err(|e| ZipTagError::DurabilityIoFailed(e.to_string()))
}

fn spawn_snapshotter(
    manager: Arc<TxnManager>,
    store: Arc<TagStore>,
    wal: Arc<Wal>,
    dir: PathBuf,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, ZipTagError> {
    std::thread::Builder::new()
        .name("ziptag-snapshotter".to_string())
        .spawn(move || {
            let mut snapshotted_bytes = 0u64;
            while !shutdown.load(Ordering::Acquire) {
                std::thread::sleep(SNAPSHOT_TICK);
                let appended = wal.bytes_appended();
                if appended.saturating_sub(snapshotted_bytes) < SNAPSHOT_WAL_BYTES {
                    continue;
                }
                match checkpoint(&manager, &store, &dir) {
                    Ok(rev) => {
                        snapshotted_bytes = appended;
                        debug!("background snapshot at rev {}", rev);
                    }
                    Err(e) => warn!("background snapshot failed: {}", e),
                }
            }
        })
        .map_err(|e| ZipTagError::DurabilityIoFailed(e.to_string()))
}
