// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction manager and the atomic commit protocol
//!
//! Commit steps, in order: acquire the writer lock; re-validate staged
//! removals when the parent revision is stale; assign real trefs to staged
//! tags; append the TXBEGIN/TXOP*/TXCOMMIT group to the WAL; install the
//! delta into the store and advance the revision; invalidate the memo cache.
//! Failures before the WAL group is appended leave no trace; a WAL group
//! without its TXCOMMIT fsynced is ignored at recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::MemoCache;
use crate::store::{Generation, ResolvedDelta, StoreError, TagRef, TagStore};

use super::tx::{Tx, TxDelta};
use super::wal::{TxOp, Wal, WalError, WalRecord};

/// Transaction-layer errors
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("commit conflict: {0}")]
    ConflictStaleParent(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Durability(#[from] WalError),
}

/// Write-path validation limits, copied out of the configuration.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_ttype_bytes: usize,
    pub max_val_bytes: usize,
    /// 0 = unlimited.
    pub max_live_tags: usize,
}

/// Serializes commits and owns the write path.
pub struct TxnManager {
    store: Arc<TagStore>,
    wal: Option<Arc<Wal>>,
    memo: Arc<MemoCache>,
    writer: Mutex<()>,
    next_txid: AtomicU64,
    limits: Limits,
    /// `flush_interval_ms == 0`: fsync before every commit returns.
    sync_commits: bool,
}

impl TxnManager {
    pub fn new(
        store: Arc<TagStore>,
        wal: Option<Arc<Wal>>,
        memo: Arc<MemoCache>,
        limits: Limits,
        sync_commits: bool,
        first_txid: u64,
    ) -> Self {
        Self {
            store,
            wal,
            memo,
            writer: Mutex::new(()),
            next_txid: AtomicU64::new(first_txid),
            limits,
            sync_commits,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn store(&self) -> &Arc<TagStore> {
        &self.store
    }

    /// Open a transaction against the current revision.
    pub fn begin(self: &Arc<Self>) -> Tx {
        Tx::new(self.clone(), self.store.generation())
    }

    /// Atomically commit a staged delta. Returns the new revision.
    pub fn commit(&self, delta: &TxDelta) -> Result<u64, TxnError> {
        let _guard = self.writer.lock();
        let gen = self.store.generation();

        if gen.rev != delta.parent_rev {
            self.revalidate(&gen, delta)?;
        }

        let new_rev = gen.rev + 1;
        let resolved = self.assign_trefs(&gen, delta);
        if resolved.is_empty() {
            debug!("commit: empty delta at rev {}, nothing to do", gen.rev);
            return Ok(gen.rev);
        }

        if let Some(wal) = &self.wal {
            let txid = self.next_txid.fetch_add(1, Ordering::Relaxed);
            let records = self.wal_records(&gen, &resolved, delta.parent_rev, txid, new_rev);
            wal.append_group(&records)?;
            if self.sync_commits {
                wal.sync()?;
            }
        }

        self.store.install_delta(&resolved, new_rev);
        self.memo.invalidate(new_rev);
        info!(
            "commit: rev {} -> {} ({} new tags, {} links added, {} removed, {} tombstoned)",
            gen.rev,
            new_rev,
            resolved.new_tags.len(),
            resolved.added_links.len(),
            resolved.removed_links.len(),
            resolved.tombstoned.len()
        );
        Ok(new_rev)
    }

    /// Consistent (generation, WAL head) pair for checkpointing: rotating
    /// under the writer lock guarantees every record group covering a commit
    /// at or below the returned generation's rev sits in an older segment.
    pub fn checkpoint_barrier(&self) -> Result<(Arc<Generation>, Option<u64>), TxnError> {
        let _guard = self.writer.lock();
        let head = match &self.wal {
            Some(wal) => Some(wal.rotate()?),
            None => None,
        };
        Ok((self.store.generation(), head))
    }

    /// Staged removals must still have live targets; additions never
    /// conflict (they are idempotent by identity).
    fn revalidate(&self, gen: &Generation, delta: &TxDelta) -> Result<(), TxnError> {
        for tref in &delta.tombstoned {
            if tref.is_placeholder() {
                continue;
            }
            let live = gen.get(*tref).map(|t| t.live_at(gen.rev)).unwrap_or(false);
            if !live {
                return Err(TxnError::ConflictStaleParent(format!(
                    "staged removal of {} no longer live at rev {}",
                    tref, gen.rev
                )));
            }
        }
        for (a, b) in &delta.removed_links {
            if a.is_placeholder() || b.is_placeholder() {
                continue;
            }
            if !gen.live_link(*a, *b, gen.rev) {
                return Err(TxnError::ConflictStaleParent(format!(
                    "staged unlink of {}-{} no longer live at rev {}",
                    a, b, gen.rev
                )));
            }
        }
        for ttype in &delta.dropped_ttypes {
            let survivor = gen
                .all_of_type(ttype, gen.rev)
                .into_iter()
                .any(|tref| !delta.tombstoned.contains(&tref));
            if survivor {
                return Err(TxnError::ConflictStaleParent(format!(
                    "ttype {} gained live tags since rev {}",
                    ttype, delta.parent_rev
                )));
            }
        }
        Ok(())
    }

    /// Assign real trefs to staged tags and translate the delta. Staged tags
    /// whose identity is already live resolve to the existing handle; a tag
    /// staged and tombstoned in the same transaction nets out to nothing.
    fn assign_trefs(&self, gen: &Generation, delta: &TxDelta) -> ResolvedDelta {
        let mut resolved = ResolvedDelta {
            declared_ttypes: delta.declared_ttypes.iter().cloned().collect(),
            dropped_ttypes: delta.dropped_ttypes.iter().cloned().collect(),
            next_tref: gen.next_tref,
            ..Default::default()
        };
        let mut assign: HashMap<TagRef, TagRef> = HashMap::new();

        for ((ttype, val), placeholder) in &delta.new_tags {
            if delta.tombstoned.contains(placeholder) {
                continue;
            }
            if let Some(existing) = gen.lookup_identity(ttype, val, gen.rev) {
                if !delta.tombstoned.contains(&existing) {
                    assign.insert(*placeholder, existing);
                    continue;
                }
            }
            let real = TagRef::new(resolved.next_tref);
            resolved.next_tref += 1;
            assign.insert(*placeholder, real);
            resolved
                .new_tags
                .push((ttype.clone(), val.clone(), real));
        }

        for tref in &delta.tombstoned {
            if !tref.is_placeholder() {
                resolved.tombstoned.push(*tref);
            }
        }

        let map = |tref: TagRef| -> Option<TagRef> {
            if tref.is_placeholder() {
                assign.get(&tref).copied()
            } else {
                Some(tref)
            }
        };

        for (a, b) in &delta.added_links {
            if delta.tombstoned.contains(a) || delta.tombstoned.contains(b) {
                continue;
            }
            let (Some(ra), Some(rb)) = (map(*a), map(*b)) else {
                continue;
            };
            if gen.live_link(ra, rb, gen.rev) {
                continue;
            }
            resolved.added_links.push((ra, rb));
        }

        for (a, b) in &delta.removed_links {
            let (Some(ra), Some(rb)) = (map(*a), map(*b)) else {
                continue;
            };
            if gen.live_link(ra, rb, gen.rev) {
                resolved.removed_links.push((ra, rb));
            }
        }

        resolved
    }

    /// Build the WAL record group for a resolved delta. Op payloads are
    /// identity-addressed so replay needs no tref translation.
    fn wal_records(
        &self,
        gen: &Generation,
        resolved: &ResolvedDelta,
        parent_rev: u64,
        txid: u64,
        new_rev: u64,
    ) -> Vec<WalRecord> {
        let ident_of = |tref: TagRef| -> Option<(String, String)> {
            resolved
                .new_tags
                .iter()
                .find(|(_, _, r)| *r == tref)
                .map(|(t, v, _)| (t.clone(), v.clone()))
                .or_else(|| gen.get(tref).map(|t| (t.ttype.clone(), t.val.clone())))
        };

        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        // Removals precede additions so replay's identity resolution sees a
        // tombstoned old version before the idempotent re-add of the same
        // identity; otherwise a remove-then-re-add transaction would replay
        // as a plain remove.
        let mut ops: Vec<TxOp> = Vec::new();
        for ttype in &resolved.declared_ttypes {
            ops.push(TxOp::DeclareTtype {
                ttype: ttype.clone(),
            });
        }
        for (a, b) in &resolved.removed_links {
            if let (Some(ia), Some(ib)) = (ident_of(*a), ident_of(*b)) {
                ops.push(TxOp::Unlink { a: ia, b: ib });
            }
        }
        for tref in &resolved.tombstoned {
            if let Some((ttype, val)) = ident_of(*tref) {
                ops.push(TxOp::RemTag { ttype, val });
            }
        }
        for (ttype, val, _) in &resolved.new_tags {
            ops.push(TxOp::AddTag {
                ttype: ttype.clone(),
                val: val.clone(),
            });
        }
        for (a, b) in &resolved.added_links {
            if let (Some(ia), Some(ib)) = (ident_of(*a), ident_of(*b)) {
                ops.push(TxOp::Link { a: ia, b: ib });
            }
        }
        for ttype in &resolved.dropped_ttypes {
            ops.push(TxOp::DropTtype {
                ttype: ttype.clone(),
            });
        }

        let mut records = Vec::with_capacity(ops.len() + 2);
        records.push(WalRecord::TxBegin {
            txid,
            parent_rev,
            ts_ms,
        });
        for (index, op) in ops.into_iter().enumerate() {
            records.push(WalRecord::TxOp {
                txid,
                index: index as u32,
                op,
            });
        }
        records.push(WalRecord::TxCommit { txid, new_rev });
        records
    }
}

impl std::fmt::Debug for TxnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnManager")
            .field("rev", &self.store.current_rev())
            .field("sync_commits", &self.sync_commits)
            .finish()
    }
}
