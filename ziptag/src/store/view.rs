// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Layered read views
//!
//! A [`View`] is `(base generation @ rev, ordered overlay deltas)`. Every
//! query executes against one view captured at entry. Overlay layering rules:
//! identity resolution is right-overrides-left (a later overlay's staged tag
//! or tombstone wins), links are additive unless explicitly unlinked by a
//! later overlay, and a link is visible only while both endpoints are.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::store::types::{link_key, TagRef};
use crate::store::Generation;
use crate::txn::tx::TxDelta;

#[derive(Clone)]
pub struct View {
    gen: Arc<Generation>,
    rev: u64,
    overlays: Vec<Arc<TxDelta>>,
}

impl View {
    pub fn new(gen: Arc<Generation>, rev: u64, overlays: Vec<Arc<TxDelta>>) -> Self {
        Self { gen, rev, overlays }
    }

    /// Base-only view at the generation's own revision.
    pub fn of_generation(gen: Arc<Generation>) -> Self {
        let rev = gen.rev;
        Self::new(gen, rev, Vec::new())
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn generation(&self) -> &Arc<Generation> {
        &self.gen
    }

    pub fn has_overlays(&self) -> bool {
        !self.overlays.is_empty()
    }

    /// Resolve `(ttype, val)` through the layers, last overlay winning.
    pub fn lookup_identity(&self, ttype: &str, val: &str) -> Option<TagRef> {
        let mut current = self.gen.lookup_identity(ttype, val, self.rev);
        for ovl in &self.overlays {
            if let Some(tref) = current {
                if ovl.tombstoned.contains(&tref) {
                    current = None;
                }
            }
            if let Some(&staged) = ovl.new_tags.get(&(ttype.to_string(), val.to_string())) {
                current = Some(staged);
            }
        }
        // A later overlay may tombstone an earlier overlay's staged tag.
        if let Some(tref) = current {
            if self.tombstoned_anywhere(tref) {
                return None;
            }
        }
        current
    }

    /// Whether `tref` identifies a tag visible in this view.
    pub fn visible(&self, tref: TagRef) -> bool {
        if self.tombstoned_anywhere(tref) {
            return false;
        }
        if tref.is_placeholder() {
            self.overlays
                .iter()
                .any(|ovl| ovl.staged_ident(tref).is_some())
        } else {
            self.gen
                .get(tref)
                .map(|t| t.live_at(self.rev))
                .unwrap_or(false)
        }
    }

    /// `(ttype, val)` of a visible tag.
    pub fn ident(&self, tref: TagRef) -> Option<(&str, &str)> {
        if !self.visible(tref) {
            return None;
        }
        if tref.is_placeholder() {
            self.overlays.iter().find_map(|ovl| ovl.staged_ident(tref))
        } else {
            self.gen
                .get(tref)
                .map(|t| (t.ttype.as_str(), t.val.as_str()))
        }
    }

    /// Neighbors of `tref`: base links filtered through overlay unlinks and
    /// tombstones, unioned with overlay link additions.
    pub fn neighbors(&self, tref: TagRef) -> Vec<TagRef> {
        if !self.visible(tref) {
            return Vec::new();
        }
        let mut out: BTreeSet<TagRef> = if tref.is_placeholder() {
            BTreeSet::new()
        } else {
            self.gen.neighbors(tref, self.rev).collect()
        };
        for ovl in &self.overlays {
            for &(a, b) in &ovl.removed_links {
                if a == tref {
                    out.remove(&b);
                } else if b == tref {
                    out.remove(&a);
                }
            }
            for &(a, b) in &ovl.added_links {
                if a == tref {
                    out.insert(b);
                } else if b == tref {
                    out.insert(a);
                }
            }
        }
        out.into_iter().filter(|n| self.visible(*n)).collect()
    }

    /// Whether the link `{a, b}` is visible in this view.
    pub fn link_present(&self, a: TagRef, b: TagRef) -> bool {
        if !self.visible(a) || !self.visible(b) {
            return false;
        }
        let key = link_key(a, b);
        let mut present = !a.is_placeholder()
            && !b.is_placeholder()
            && self.gen.live_link(a, b, self.rev);
        for ovl in &self.overlays {
            if ovl.removed_links.contains(&key) {
                present = false;
            }
            if ovl.added_links.contains(&key) {
                present = true;
            }
        }
        present
    }

    /// All visible tags of `ttype`, ascending by tref with staged tags after
    /// committed ones.
    pub fn all_of_type(&self, ttype: &str) -> Vec<TagRef> {
        let mut out: Vec<TagRef> = self
            .gen
            .all_of_type(ttype, self.rev)
            .into_iter()
            .filter(|tref| !self.tombstoned_anywhere(*tref))
            .collect();
        for ovl in &self.overlays {
            for ((t, _), &staged) in &ovl.new_tags {
                if t == ttype && self.visible(staged) {
                    out.push(staged);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Whether the ttype namespace exists anywhere in the view.
    pub fn has_type(&self, ttype: &str) -> bool {
        if self.gen.has_type(ttype) {
            return true;
        }
        self.overlays.iter().any(|ovl| {
            ovl.declared_ttypes.contains(ttype)
                || ovl.new_tags.keys().any(|(t, _)| t == ttype)
        })
    }

    /// Every ttype name visible in the view.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> =
            self.gen.type_names().map(|s| s.to_string()).collect();
        for ovl in &self.overlays {
            names.extend(ovl.declared_ttypes.iter().cloned());
            names.extend(ovl.new_tags.keys().map(|(t, _)| t.clone()));
        }
        names.into_iter().collect()
    }

    /// Cheap cardinality estimate for the planner.
    pub fn type_cardinality(&self, ttype: &str) -> usize {
        let staged: usize = self
            .overlays
            .iter()
            .map(|ovl| ovl.new_tags.keys().filter(|(t, _)| t == ttype).count())
            .sum();
        self.gen.type_cardinality(ttype) + staged
    }

    fn tombstoned_anywhere(&self, tref: TagRef) -> bool {
        self.overlays.iter().any(|ovl| ovl.tombstoned.contains(&tref))
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("rev", &self.rev)
            .field("overlays", &self.overlays.len())
            .finish()
    }
}
