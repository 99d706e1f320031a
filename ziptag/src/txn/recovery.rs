// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Startup recovery: snapshot load plus idempotent WAL replay

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::store::{Generation, ResolvedDelta, TagRef, TagStore};

use super::snapshot::{latest_snapshot, load_snapshot, read_manifest};
use super::wal::{scan_records, TxOp, WalError, WalRecord};

/// Summary of one recovery pass.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Snapshot the replay started from, if one existed.
    pub snapshot_rev: Option<u64>,
    pub records_scanned: usize,
    pub transactions_replayed: usize,
    /// Transactions with WAL records but no durable TXCOMMIT.
    pub transactions_discarded: usize,
    pub recovered_rev: u64,
    /// Highest txid seen anywhere in the scanned log; the manager resumes
    /// txid assignment above it.
    pub last_txid: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Recover committed state from the data directory.
///
/// 1. Load the newest snapshot (populates the store and `next_tref`).
/// 2. Scan the WAL from the manifest's head segment, collecting TXCOMMITs
///    and grouping ops by txid.
/// 3. Replay committed transactions in ascending `new_rev` order; ops are
///    identity-addressed and idempotent.
/// 4. Discard record groups without a TXCOMMIT.
pub fn recover(dir: &Path) -> Result<(TagStore, RecoveryReport), WalError> {
    let started_at = Utc::now();

    let manifest = read_manifest(dir)?;
    let snapshot = match manifest.as_ref().and_then(|m| m.snapshot_rev) {
        Some(rev) => {
            let path = super::snapshot::snapshot_path(dir, rev);
            if path.exists() {
                Some((rev, path))
            } else {
                warn!(
                    "manifest names snapshot rev {} but the file is missing; scanning directory",
                    rev
                );
                latest_snapshot(dir)?
            }
        }
        None => latest_snapshot(dir)?,
    };

    let (store, snapshot_rev) = match snapshot {
        Some((rev, path)) => {
            let gen = load_snapshot(&path)?;
            info!("recovery: starting from snapshot at rev {}", rev);
            (TagStore::from_generation(gen), Some(rev))
        }
        None => (TagStore::new(), None),
    };

    let from_seq = manifest.map(|m| m.wal_head.max(1)).unwrap_or(1);
    let outcome = scan_records(dir, from_seq)?;
    if let Some((path, offset)) = &outcome.torn_tail {
        warn!(
            "truncating torn wal tail of {} at offset {}",
            path.display(),
            offset
        );
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|f| f.set_len(*offset))
            .map_err(|e| WalError::Io {
                path: Some(path.clone()),
                source: e,
            })?;
    }
    let records = outcome.records;
    let records_scanned = records.len();

    let mut ops_by_txid: HashMap<u64, Vec<(u32, TxOp)>> = HashMap::new();
    let mut begun: HashSet<u64> = HashSet::new();
    let mut commits: Vec<(u64, u64)> = Vec::new(); // (new_rev, txid)
    let mut last_txid = 0u64;
    for record in records {
        match record {
            WalRecord::TxBegin { txid, .. } => {
                last_txid = last_txid.max(txid);
                begun.insert(txid);
            }
            WalRecord::TxOp { txid, index, op } => {
                ops_by_txid.entry(txid).or_default().push((index, op));
            }
            WalRecord::TxCommit { txid, new_rev } => {
                last_txid = last_txid.max(txid);
                commits.push((new_rev, txid));
            }
        }
    }
    commits.sort_unstable();

    let committed: HashSet<u64> = commits.iter().map(|(_, txid)| *txid).collect();
    let transactions_discarded = begun
        .iter()
        .filter(|txid| !committed.contains(txid))
        .count();

    let mut transactions_replayed = 0usize;
    for (new_rev, txid) in commits {
        if new_rev <= store.current_rev() {
            debug!(
                "recovery: skipping tx {} at rev {} (already in snapshot)",
                txid, new_rev
            );
            continue;
        }
        let mut ops = ops_by_txid.remove(&txid).unwrap_or_default();
        ops.sort_unstable_by_key(|(index, _)| *index);
        let gen = store.generation();
        let delta = resolve_replay_ops(&gen, ops.iter().map(|(_, op)| op));
        store.install_delta(&delta, new_rev);
        transactions_replayed += 1;
    }

    let recovered_rev = store.current_rev();
    let report = RecoveryReport {
        snapshot_rev,
        records_scanned,
        transactions_replayed,
        transactions_discarded,
        recovered_rev,
        last_txid,
        started_at,
        finished_at: Utc::now(),
    };
    info!(
        "recovery complete: rev {}, {} records scanned, {} txs replayed, {} discarded",
        report.recovered_rev,
        report.records_scanned,
        report.transactions_replayed,
        report.transactions_discarded
    );
    Ok((store, report))
}

/// Turn a committed transaction's identity-addressed ops back into a
/// resolved delta against the current generation. Ops that no longer apply
/// (duplicate adds, links to missing endpoints) are skipped.
fn resolve_replay_ops<'a>(
    gen: &Generation,
    ops: impl Iterator<Item = &'a TxOp>,
) -> ResolvedDelta {
    let mut delta = ResolvedDelta {
        next_tref: gen.next_tref,
        ..Default::default()
    };
    let mut staged: HashMap<(String, String), TagRef> = HashMap::new();
    let mut tombstoned: HashSet<TagRef> = HashSet::new();

    let resolve = |staged: &HashMap<(String, String), TagRef>,
                   tombstoned: &HashSet<TagRef>,
                   ttype: &str,
                   val: &str|
     -> Option<TagRef> {
        let tref = staged
            .get(&(ttype.to_string(), val.to_string()))
            .copied()
            .or_else(|| gen.lookup_identity(ttype, val, gen.rev))?;
        if tombstoned.contains(&tref) {
            None
        } else {
            Some(tref)
        }
    };

    for op in ops {
        match op {
            TxOp::DeclareTtype { ttype } => delta.declared_ttypes.push(ttype.clone()),
            TxOp::AddTag { ttype, val } => {
                if resolve(&staged, &tombstoned, ttype, val).is_some() {
                    continue;
                }
                let tref = TagRef::new(delta.next_tref);
                delta.next_tref += 1;
                staged.insert((ttype.clone(), val.clone()), tref);
                delta.new_tags.push((ttype.clone(), val.clone(), tref));
            }
            TxOp::Link { a, b } => {
                let (Some(ra), Some(rb)) = (
                    resolve(&staged, &tombstoned, &a.0, &a.1),
                    resolve(&staged, &tombstoned, &b.0, &b.1),
                ) else {
                    warn!("replay: link endpoint missing ({}:{} - {}:{}), skipped", a.0, a.1, b.0, b.1);
                    continue;
                };
                if !gen.live_link(ra, rb, gen.rev) {
                    delta.added_links.push((ra, rb));
                }
            }
            TxOp::Unlink { a, b } => {
                let (Some(ra), Some(rb)) = (
                    resolve(&staged, &tombstoned, &a.0, &a.1),
                    resolve(&staged, &tombstoned, &b.0, &b.1),
                ) else {
                    continue;
                };
                if gen.live_link(ra, rb, gen.rev) {
                    delta.removed_links.push((ra, rb));
                } else {
                    delta.added_links.retain(|&(x, y)| {
                        crate::store::link_key(x, y) != crate::store::link_key(ra, rb)
                    });
                }
            }
            TxOp::RemTag { ttype, val } => {
                if let Some(tref) = resolve(&staged, &tombstoned, ttype, val) {
                    tombstoned.insert(tref);
                    delta.tombstoned.push(tref);
                }
            }
            TxOp::DropTtype { ttype } => delta.dropped_ttypes.push(ttype.clone()),
        }
    }
    delta
}
