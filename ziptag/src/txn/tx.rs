// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction delta layers
//!
//! A [`Tx`] is an in-memory delta staged against the revision it was opened
//! at. Staging operations are idempotent against the merged view of base
//! state plus the delta itself. The delta doubles as a query overlay: it can
//! be read by the executor before commit (hypothetical reads) and is the unit
//! the commit protocol installs atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::ZipTagError;
use crate::store::{link_key, validate_ttype, validate_val, Generation, StoreError, TagRef};

use super::manager::TxnManager;

/// Process-wide placeholder sequence so placeholders from distinct
/// transactions never collide when overlays are layered in one view.
static PLACEHOLDER_SEQ: AtomicU64 = AtomicU64::new(1);

/// Staged changes of one transaction. BTree-backed so the WAL op order at
/// commit is deterministic.
#[derive(Debug, Default, Clone)]
pub struct TxDelta {
    /// Revision of the base this delta was opened against.
    pub parent_rev: u64,
    pub declared_ttypes: BTreeSet<String>,
    pub dropped_ttypes: BTreeSet<String>,
    /// (ttype, val) -> placeholder tref for staged new tags.
    pub new_tags: BTreeMap<(String, String), TagRef>,
    /// Reverse index: placeholder tref -> (ttype, val).
    pub staged_by_ref: BTreeMap<TagRef, (String, String)>,
    /// Trefs (base or placeholder) tombstoned by this delta.
    pub tombstoned: BTreeSet<TagRef>,
    /// Normalized link pairs staged for addition.
    pub added_links: BTreeSet<(TagRef, TagRef)>,
    /// Normalized link pairs staged for removal.
    pub removed_links: BTreeSet<(TagRef, TagRef)>,
}

impl TxDelta {
    pub fn new(parent_rev: u64) -> Self {
        Self {
            parent_rev,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.declared_ttypes.is_empty()
            && self.dropped_ttypes.is_empty()
            && self.new_tags.is_empty()
            && self.tombstoned.is_empty()
            && self.added_links.is_empty()
            && self.removed_links.is_empty()
    }

    /// Stage a new tag under a fresh placeholder, superseding any tombstoned
    /// staged version of the same identity.
    pub fn stage_tag(&mut self, ttype: &str, val: &str) -> TagRef {
        let placeholder = TagRef::placeholder(PLACEHOLDER_SEQ.fetch_add(1, Ordering::Relaxed));
        self.new_tags
            .insert((ttype.to_string(), val.to_string()), placeholder);
        self.staged_by_ref
            .insert(placeholder, (ttype.to_string(), val.to_string()));
        placeholder
    }

    /// The staged identity behind a placeholder, if it is still current
    /// (not superseded by a re-add of the same identity).
    pub fn staged_ident(&self, tref: TagRef) -> Option<(&str, &str)> {
        let (t, v) = self.staged_by_ref.get(&tref)?;
        if self.new_tags.get(&(t.clone(), v.clone())) == Some(&tref) {
            Some((t.as_str(), v.as_str()))
        } else {
            None
        }
    }
}

/// An open transaction: a staged delta plus the base generation it reads
/// through. Dropping the transaction without committing discards the delta.
pub struct Tx {
    manager: Arc<TxnManager>,
    base: Arc<Generation>,
    delta: TxDelta,
}

impl Tx {
    pub(crate) fn new(manager: Arc<TxnManager>, base: Arc<Generation>) -> Self {
        let delta = TxDelta::new(base.rev);
        Self {
            manager,
            base,
            delta,
        }
    }

    pub fn parent_rev(&self) -> u64 {
        self.delta.parent_rev
    }

    pub fn delta(&self) -> &TxDelta {
        &self.delta
    }

    /// Stage a tag creation. Idempotent: returns the existing handle if the
    /// identity is already visible in the merged view.
    pub fn add_tag(&mut self, ttype: &str, val: &str) -> Result<TagRef, ZipTagError> {
        let limits = self.manager.limits();
        validate_ttype(ttype, limits.max_ttype_bytes)?;
        validate_val(val, limits.max_val_bytes)?;

        if let Some(&staged) = self.delta.new_tags.get(&(ttype.to_string(), val.to_string())) {
            if !self.delta.tombstoned.contains(&staged) {
                return Ok(staged);
            }
        }
        if let Some(base) = self.base.lookup_identity(ttype, val, self.delta.parent_rev) {
            if !self.delta.tombstoned.contains(&base) {
                return Ok(base);
            }
        }

        if limits.max_live_tags > 0 {
            let staged_live = self
                .delta
                .staged_by_ref
                .keys()
                .filter(|p| !self.delta.tombstoned.contains(p))
                .count();
            if self.base.live_tag_count() + staged_live >= limits.max_live_tags {
                return Err(StoreError::CapacityExceeded {
                    max: limits.max_live_tags,
                }
                .into());
            }
        }

        Ok(self.delta.stage_tag(ttype, val))
    }

    /// Stage a tag removal by identity. No-op (Ok(false)) if the tag is not
    /// visible in the merged view.
    pub fn rem_tag(&mut self, ttype: &str, val: &str) -> Result<bool, ZipTagError> {
        match self.resolve(ttype, val) {
            Some(tref) => {
                self.delta.tombstoned.insert(tref);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stage a link between two visible tags. Duplicate links are no-ops.
    pub fn link(&mut self, a: TagRef, b: TagRef) -> Result<bool, ZipTagError> {
        if a == b {
            return Err(StoreError::SelfLink.into());
        }
        self.require_visible(a)?;
        self.require_visible(b)?;
        let key = link_key(a, b);
        if self.delta.removed_links.remove(&key) {
            // Re-link after a staged unlink: the base link (if any) shows
            // through again; a staged add is only needed when none exists.
            if !a.is_placeholder()
                && !b.is_placeholder()
                && self.base.live_link(a, b, self.delta.parent_rev)
            {
                return Ok(true);
            }
        }
        if !a.is_placeholder()
            && !b.is_placeholder()
            && self.base.live_link(a, b, self.delta.parent_rev)
        {
            return Ok(false);
        }
        Ok(self.delta.added_links.insert(key))
    }

    /// Stage a link removal. No-op if no such link is visible.
    pub fn unlink(&mut self, a: TagRef, b: TagRef) -> Result<bool, ZipTagError> {
        if a == b {
            return Err(StoreError::SelfLink.into());
        }
        let key = link_key(a, b);
        if self.delta.added_links.remove(&key) {
            return Ok(true);
        }
        if !a.is_placeholder()
            && !b.is_placeholder()
            && self.base.live_link(a, b, self.delta.parent_rev)
        {
            return Ok(self.delta.removed_links.insert(key));
        }
        Ok(false)
    }

    /// Declare a ttype namespace ahead of its first tag.
    pub fn declare_ttype(&mut self, ttype: &str) -> Result<(), ZipTagError> {
        validate_ttype(ttype, self.manager.limits().max_ttype_bytes)?;
        self.delta.dropped_ttypes.remove(ttype);
        self.delta.declared_ttypes.insert(ttype.to_string());
        Ok(())
    }

    /// Drop a ttype namespace. Fails while any live tag of the type remains
    /// in the merged view.
    pub fn drop_ttype(&mut self, ttype: &str) -> Result<(), ZipTagError> {
        validate_ttype(ttype, self.manager.limits().max_ttype_bytes)?;
        let survivors = self
            .base
            .all_of_type(ttype, self.delta.parent_rev)
            .into_iter()
            .any(|tref| !self.delta.tombstoned.contains(&tref));
        let staged = self.delta.new_tags.iter().any(|((t, _), placeholder)| {
            t == ttype && !self.delta.tombstoned.contains(placeholder)
        });
        if survivors || staged {
            return Err(StoreError::TypeNotEmpty(ttype.to_string()).into());
        }
        self.delta.declared_ttypes.remove(ttype);
        self.delta.dropped_ttypes.insert(ttype.to_string());
        Ok(())
    }

    /// Discard the staged delta.
    pub fn abort(self) {
        debug!("tx abort: discarding delta at parent rev {}", self.delta.parent_rev);
    }

    /// Atomically commit the staged delta; returns the new revision.
    pub fn commit(self) -> Result<u64, ZipTagError> {
        self.manager.commit(&self.delta).map_err(ZipTagError::from)
    }

    /// Resolve an identity through the merged view (delta over base).
    pub fn resolve(&self, ttype: &str, val: &str) -> Option<TagRef> {
        if let Some(&staged) = self.delta.new_tags.get(&(ttype.to_string(), val.to_string())) {
            if !self.delta.tombstoned.contains(&staged) {
                return Some(staged);
            }
            return None;
        }
        let base = self.base.lookup_identity(ttype, val, self.delta.parent_rev)?;
        if self.delta.tombstoned.contains(&base) {
            None
        } else {
            Some(base)
        }
    }

    fn require_visible(&self, tref: TagRef) -> Result<(), ZipTagError> {
        if self.delta.tombstoned.contains(&tref) {
            return Err(StoreError::TagNotFound(tref.to_string()).into());
        }
        let present = if tref.is_placeholder() {
            self.delta.staged_ident(tref).is_some()
        } else {
            self.base
                .get(tref)
                .map(|t| t.live_at(self.delta.parent_rev))
                .unwrap_or(false)
        };
        if present {
            Ok(())
        } else {
            Err(StoreError::TagNotFound(tref.to_string()).into())
        }
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("parent_rev", &self.delta.parent_rev)
            .field("staged_tags", &self.delta.new_tags.len())
            .field("tombstoned", &self.delta.tombstoned.len())
            .finish()
    }
}
