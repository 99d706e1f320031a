// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Committed graph state and generation publishing
//!
//! The committed base state lives in an immutable [`Generation`]: the derived
//! indices (`by_type`, `by_tref`, `adj`) plus `rev` and `next_tref`. Commits
//! build a successor generation and publish it with an atomic pointer swap;
//! readers clone the `Arc` once at query entry and keep dereferencing the
//! pre-swap structures for the life of the query. Identity buckets hold a
//! version chain (ascending `create_rev`) so a read at any `rev <=
//! current_rev` resolves through the latest generation.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use super::types::{link_key, LinkVer, Tag, TagRef, REV_LIVE};

/// Immutable snapshot of committed state at a single revision.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    /// Revision this generation was committed at.
    pub rev: u64,
    /// Next real tref to assign; strictly monotonic, never reused.
    pub next_tref: u64,
    /// ttype -> val -> version chain of trefs, ascending by create_rev.
    by_type: HashMap<String, HashMap<String, Vec<TagRef>>>,
    /// tref -> tag record (tombstoned records retained until compaction).
    by_tref: HashMap<TagRef, Tag>,
    /// tref -> neighbor -> link version stamps.
    adj: HashMap<TagRef, HashMap<TagRef, LinkVer>>,
    /// Count of tags live at `rev`.
    live_tags: usize,
    /// Count of links live at `rev`.
    live_links: usize,
}

impl Generation {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            next_tref: 1,
            ..Default::default()
        }
    }

    /// Resolve `(ttype, val)` to the tref visible at `rev`.
    pub fn lookup_identity(&self, ttype: &str, val: &str, rev: u64) -> Option<TagRef> {
        let chain = self.by_type.get(ttype)?.get(val)?;
        // Newest first: at most one version of an identity is live at any rev.
        for tref in chain.iter().rev() {
            if let Some(tag) = self.by_tref.get(tref) {
                if tag.live_at(rev) {
                    return Some(*tref);
                }
                if tag.create_rev <= rev {
                    return None;
                }
            }
        }
        None
    }

    pub fn get(&self, tref: TagRef) -> Option<&Tag> {
        self.by_tref.get(&tref)
    }

    /// Neighbors of `tref` through links live at `rev`.
    ///
    /// Incident links are tombstoned together with either endpoint, so link
    /// liveness implies endpoint liveness on committed state.
    pub fn neighbors(&self, tref: TagRef, rev: u64) -> impl Iterator<Item = TagRef> + '_ {
        self.adj
            .get(&tref)
            .into_iter()
            .flat_map(move |edges| {
                edges
                    .iter()
                    .filter(move |(_, ver)| ver.live_at(rev))
                    .map(|(n, _)| *n)
            })
    }

    /// All trefs of `ttype` live at `rev`.
    pub fn all_of_type(&self, ttype: &str, rev: u64) -> Vec<TagRef> {
        let Some(bucket) = self.by_type.get(ttype) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for chain in bucket.values() {
            for tref in chain.iter().rev() {
                if let Some(tag) = self.by_tref.get(tref) {
                    if tag.live_at(rev) {
                        out.push(*tref);
                        break;
                    }
                    if tag.create_rev <= rev {
                        break;
                    }
                }
            }
        }
        out
    }

    /// Whether the ttype namespace exists (has ever held a tag or was declared).
    pub fn has_type(&self, ttype: &str) -> bool {
        self.by_type.contains_key(ttype)
    }

    /// Cheap cardinality estimate for the planner: identity-bucket size.
    pub fn type_cardinality(&self, ttype: &str) -> usize {
        self.by_type.get(ttype).map(|b| b.len()).unwrap_or(0)
    }

    pub fn live_link(&self, a: TagRef, b: TagRef, rev: u64) -> bool {
        self.adj
            .get(&a)
            .and_then(|edges| edges.get(&b))
            .map(|ver| ver.live_at(rev))
            .unwrap_or(false)
    }

    pub fn live_tag_count(&self) -> usize {
        self.live_tags
    }

    pub fn live_link_count(&self) -> usize {
        self.live_links
    }

    pub fn type_count(&self) -> usize {
        self.by_type.len()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(|s| s.as_str())
    }

    /// Iterate every tag record live at `rev` (snapshot building).
    pub fn live_tags_at(&self, rev: u64) -> impl Iterator<Item = &Tag> {
        self.by_tref.values().filter(move |t| t.live_at(rev))
    }

    /// Iterate every normalized link pair live at `rev` (snapshot building).
    pub fn live_links_at(&self, rev: u64) -> Vec<(TagRef, TagRef, LinkVer)> {
        let mut out = Vec::new();
        for (a, edges) in &self.adj {
            for (b, ver) in edges {
                if a < b && ver.live_at(rev) {
                    out.push((*a, *b, *ver));
                }
            }
        }
        out
    }

    /// Rebuild a generation from snapshot contents: live tags and links only.
    pub fn from_parts(
        rev: u64,
        next_tref: u64,
        tags: Vec<Tag>,
        links: Vec<(TagRef, TagRef, u64)>,
    ) -> Self {
        let mut gen = Generation {
            rev,
            next_tref,
            ..Default::default()
        };
        for tag in tags {
            gen.by_type
                .entry(tag.ttype.clone())
                .or_default()
                .entry(tag.val.clone())
                .or_default()
                .push(tag.tref);
            gen.by_tref.insert(tag.tref, tag);
            gen.live_tags += 1;
        }
        for (a, b, create_rev) in links {
            let (a, b) = link_key(a, b);
            let ver = LinkVer::new(create_rev);
            gen.adj.entry(a).or_default().insert(b, ver);
            gen.adj.entry(b).or_default().insert(a, ver);
            gen.live_links += 1;
        }
        gen
    }

    /// Drop version-chain entries and link stamps dead at or before `min_rev`.
    ///
    /// Called after a durable snapshot at `min_rev`: no future process can
    /// read below it, and in-process readers hold their own generation Arc.
    pub fn compacted(&self, min_rev: u64) -> Self {
        let mut gen = self.clone();
        gen.by_tref
            .retain(|_, tag| tag.delete_rev == REV_LIVE || tag.delete_rev > min_rev);
        for bucket in gen.by_type.values_mut() {
            for chain in bucket.values_mut() {
                let by_tref = &gen.by_tref;
                chain.retain(|tref| by_tref.contains_key(tref));
            }
            bucket.retain(|_, chain| !chain.is_empty());
        }
        gen.by_type.retain(|_, bucket| !bucket.is_empty());
        for edges in gen.adj.values_mut() {
            edges.retain(|_, ver| ver.delete_rev == REV_LIVE || ver.delete_rev > min_rev);
        }
        gen.adj.retain(|tref, edges| {
            !edges.is_empty() || gen.by_tref.contains_key(tref)
        });
        gen
    }
}

/// A transaction delta with real trefs assigned, ready to install.
///
/// Field order matches the application order of `install_delta`.
#[derive(Debug, Default, Clone)]
pub struct ResolvedDelta {
    pub declared_ttypes: Vec<String>,
    /// (ttype, val, real tref) for tags that did not exist at commit time.
    pub new_tags: Vec<(String, String, TagRef)>,
    pub added_links: Vec<(TagRef, TagRef)>,
    pub removed_links: Vec<(TagRef, TagRef)>,
    pub tombstoned: Vec<TagRef>,
    pub dropped_ttypes: Vec<String>,
    /// Value of `next_tref` after assignment.
    pub next_tref: u64,
}

impl ResolvedDelta {
    pub fn is_empty(&self) -> bool {
        self.declared_ttypes.is_empty()
            && self.new_tags.is_empty()
            && self.added_links.is_empty()
            && self.removed_links.is_empty()
            && self.tombstoned.is_empty()
            && self.dropped_ttypes.is_empty()
    }
}

/// Holder of the current generation pointer.
///
/// `install_delta` is the only mutator and runs under the transaction
/// manager's writer lock; readers are lock-free apart from the pointer clone.
#[derive(Debug)]
pub struct TagStore {
    current: RwLock<Arc<Generation>>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::from_generation(Generation::empty())
    }

    pub fn from_generation(gen: Generation) -> Self {
        Self {
            current: RwLock::new(Arc::new(gen)),
        }
    }

    /// Clone the current generation pointer. Readers hold this for the life
    /// of a query; concurrent commits never invalidate it.
    pub fn generation(&self) -> Arc<Generation> {
        self.current.read().clone()
    }

    pub fn current_rev(&self) -> u64 {
        self.current.read().rev
    }

    /// Apply a resolved delta, producing and publishing the successor
    /// generation at `new_rev`. Returns the published generation.
    pub fn install_delta(&self, delta: &ResolvedDelta, new_rev: u64) -> Arc<Generation> {
        let mut gen = Generation::clone(&self.generation());
        debug!(
            "install_delta: rev {} -> {} (+{} tags, +{} links, -{} links, -{} tags)",
            gen.rev,
            new_rev,
            delta.new_tags.len(),
            delta.added_links.len(),
            delta.removed_links.len(),
            delta.tombstoned.len()
        );

        for ttype in &delta.declared_ttypes {
            gen.by_type.entry(ttype.clone()).or_default();
        }

        for (ttype, val, tref) in &delta.new_tags {
            gen.by_type
                .entry(ttype.clone())
                .or_default()
                .entry(val.clone())
                .or_default()
                .push(*tref);
            gen.by_tref
                .insert(*tref, Tag::new(*tref, ttype.clone(), val.clone(), new_rev));
            gen.live_tags += 1;
        }

        for (a, b) in &delta.added_links {
            let (a, b) = link_key(*a, *b);
            let ver = LinkVer::new(new_rev);
            gen.adj.entry(a).or_default().insert(b, ver);
            gen.adj.entry(b).or_default().insert(a, ver);
            gen.live_links += 1;
        }

        for (a, b) in &delta.removed_links {
            let (a, b) = link_key(*a, *b);
            if Self::stamp_link(&mut gen.adj, a, b, new_rev) {
                gen.live_links -= 1;
            }
        }

        for tref in &delta.tombstoned {
            let incident: Vec<TagRef> = gen
                .neighbors(*tref, gen.rev.max(new_rev))
                .collect();
            for n in incident {
                if Self::stamp_link(&mut gen.adj, *tref, n, new_rev) {
                    gen.live_links -= 1;
                }
            }
            if let Some(tag) = gen.by_tref.get_mut(tref) {
                if tag.delete_rev == REV_LIVE {
                    tag.delete_rev = new_rev;
                    gen.live_tags -= 1;
                }
            }
        }

        // Dropped ttypes were validated empty of live tags; the bucket itself
        // is pruned once compaction clears any remaining tombstone chains.
        for ttype in &delta.dropped_ttypes {
            if let Some(bucket) = gen.by_type.get(ttype) {
                if bucket.is_empty() {
                    gen.by_type.remove(ttype);
                }
            }
        }

        gen.rev = new_rev;
        gen.next_tref = gen.next_tref.max(delta.next_tref);

        let published = Arc::new(gen);
        *self.current.write() = published.clone();
        published
    }

    /// Replace the published generation with a compacted clone.
    pub fn install_compacted(&self, min_rev: u64) {
        let compacted = Arc::new(self.generation().compacted(min_rev));
        *self.current.write() = compacted;
    }

    fn stamp_link(
        adj: &mut HashMap<TagRef, HashMap<TagRef, LinkVer>>,
        a: TagRef,
        b: TagRef,
        rev: u64,
    ) -> bool {
        let mut stamped = false;
        for (x, y) in [(a, b), (b, a)] {
            if let Some(ver) = adj.get_mut(&x).and_then(|e| e.get_mut(&y)) {
                if ver.delete_rev == REV_LIVE {
                    ver.delete_rev = rev;
                    stamped = true;
                }
            }
        }
        stamped
    }
}

impl Default for TagStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_with_tags(tags: &[(&str, &str)], first_tref: u64) -> ResolvedDelta {
        ResolvedDelta {
            new_tags: tags
                .iter()
                .enumerate()
                .map(|(i, (t, v))| (t.to_string(), v.to_string(), TagRef::new(first_tref + i as u64)))
                .collect(),
            next_tref: first_tref + tags.len() as u64,
            ..Default::default()
        }
    }

    #[test]
    fn test_install_and_lookup() {
        let store = TagStore::new();
        store.install_delta(&delta_with_tags(&[("person", "ada"), ("language", "python")], 1), 1);
        let gen = store.generation();
        assert_eq!(gen.rev, 1);
        assert_eq!(gen.lookup_identity("person", "ada", 1), Some(TagRef::new(1)));
        assert_eq!(gen.lookup_identity("person", "ada", 0), None);
        assert_eq!(gen.live_tag_count(), 2);
    }

    #[test]
    fn test_adjacency_symmetric_and_stamped_on_tombstone() {
        let store = TagStore::new();
        store.install_delta(&delta_with_tags(&[("a", "1"), ("b", "2")], 1), 1);
        let link = ResolvedDelta {
            added_links: vec![(TagRef::new(1), TagRef::new(2))],
            next_tref: 3,
            ..Default::default()
        };
        store.install_delta(&link, 2);
        let gen = store.generation();
        assert!(gen.live_link(TagRef::new(1), TagRef::new(2), 2));
        assert!(gen.live_link(TagRef::new(2), TagRef::new(1), 2));

        let rem = ResolvedDelta {
            tombstoned: vec![TagRef::new(1)],
            next_tref: 3,
            ..Default::default()
        };
        store.install_delta(&rem, 3);
        let gen = store.generation();
        assert!(!gen.live_link(TagRef::new(1), TagRef::new(2), 3));
        // Historic read still sees the link.
        assert!(gen.live_link(TagRef::new(1), TagRef::new(2), 2));
        assert_eq!(gen.neighbors(TagRef::new(2), 3).count(), 0);
    }

    #[test]
    fn test_old_generation_survives_swap() {
        let store = TagStore::new();
        store.install_delta(&delta_with_tags(&[("x", "1")], 1), 1);
        let old = store.generation();
        store.install_delta(
            &ResolvedDelta {
                tombstoned: vec![TagRef::new(1)],
                next_tref: 2,
                ..Default::default()
            },
            2,
        );
        // The captured generation is unaffected by the swap.
        assert_eq!(old.lookup_identity("x", "1", 1), Some(TagRef::new(1)));
        assert_eq!(store.generation().lookup_identity("x", "1", 2), None);
    }

    #[test]
    fn test_compaction_prunes_tombstones() {
        let store = TagStore::new();
        store.install_delta(&delta_with_tags(&[("x", "1"), ("x", "2")], 1), 1);
        store.install_delta(
            &ResolvedDelta {
                tombstoned: vec![TagRef::new(1)],
                next_tref: 3,
                ..Default::default()
            },
            2,
        );
        store.install_compacted(2);
        let gen = store.generation();
        assert!(gen.get(TagRef::new(1)).is_none());
        assert!(gen.get(TagRef::new(2)).is_some());
        assert_eq!(gen.type_cardinality("x"), 1);
        // next_tref is preserved: handles are never reused.
        assert_eq!(gen.next_tref, 3);
    }
}
