// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Set-valued intermediate results
//!
//! Small sets stay as sorted arrays; large ones switch to hash sets for O(1)
//! probes. Whenever ordering surfaces (final results, `top` without a key),
//! the tie-break is ascending tref.

use std::collections::HashSet;

use crate::store::TagRef;

/// Representation switch point between sorted arrays and hash sets.
const HASH_REPR_THRESHOLD: usize = 512;

/// A set of trefs.
#[derive(Debug, Clone)]
pub enum TrefSet {
    Sorted(Vec<TagRef>),
    Hashed(HashSet<TagRef>),
}

impl TrefSet {
    pub fn empty() -> Self {
        TrefSet::Sorted(Vec::new())
    }

    /// Build from an arbitrary vec; sorts and dedups.
    pub fn from_vec(mut trefs: Vec<TagRef>) -> Self {
        if trefs.len() > HASH_REPR_THRESHOLD {
            return TrefSet::Hashed(trefs.into_iter().collect());
        }
        trefs.sort_unstable();
        trefs.dedup();
        TrefSet::Sorted(trefs)
    }

    pub fn from_hash(set: HashSet<TagRef>) -> Self {
        if set.len() <= HASH_REPR_THRESHOLD {
            Self::from_vec(set.into_iter().collect())
        } else {
            TrefSet::Hashed(set)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TrefSet::Sorted(v) => v.len(),
            TrefSet::Hashed(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, tref: TagRef) -> bool {
        match self {
            TrefSet::Sorted(v) => v.binary_search(&tref).is_ok(),
            TrefSet::Hashed(s) => s.contains(&tref),
        }
    }

    /// Ascending tref order.
    pub fn into_sorted_vec(self) -> Vec<TagRef> {
        match self {
            TrefSet::Sorted(v) => v,
            TrefSet::Hashed(s) => {
                let mut v: Vec<TagRef> = s.into_iter().collect();
                v.sort_unstable();
                v
            }
        }
    }

    pub fn sorted_vec(&self) -> Vec<TagRef> {
        self.clone().into_sorted_vec()
    }

    /// Probe-side hash set.
    pub fn to_hash(&self) -> HashSet<TagRef> {
        match self {
            TrefSet::Sorted(v) => v.iter().copied().collect(),
            TrefSet::Hashed(s) => s.clone(),
        }
    }

    pub fn union(self, other: TrefSet) -> TrefSet {
        let (mut big, small) = if self.len() >= other.len() {
            (self.to_hash(), other)
        } else {
            (other.to_hash(), self)
        };
        big.extend(small.into_sorted_vec());
        TrefSet::from_hash(big)
    }

    pub fn difference(self, other: &TrefSet) -> TrefSet {
        TrefSet::from_vec(
            self.into_sorted_vec()
                .into_iter()
                .filter(|t| !other.contains(*t))
                .collect(),
        )
    }
}

impl Default for TrefSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl FromIterator<TagRef> for TrefSet {
    fn from_iter<I: IntoIterator<Item = TagRef>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_and_deduped() {
        let set = TrefSet::from_vec(vec![TagRef::new(3), TagRef::new(1), TagRef::new(3)]);
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.into_sorted_vec(),
            vec![TagRef::new(1), TagRef::new(3)]
        );
    }

    #[test]
    fn test_large_sets_use_hash_repr() {
        let set = TrefSet::from_vec((0..2000).map(TagRef::new).collect());
        assert!(matches!(set, TrefSet::Hashed(_)));
        assert!(set.contains(TagRef::new(1999)));
        // Sorted rendering still comes out ascending.
        let v = set.into_sorted_vec();
        assert_eq!(v[0], TagRef::new(0));
        assert_eq!(v[1999], TagRef::new(1999));
    }

    #[test]
    fn test_union_difference() {
        let a = TrefSet::from_vec(vec![TagRef::new(1), TagRef::new(2)]);
        let b = TrefSet::from_vec(vec![TagRef::new(2), TagRef::new(3)]);
        assert_eq!(
            a.clone().union(b.clone()).into_sorted_vec(),
            vec![TagRef::new(1), TagRef::new(2), TagRef::new(3)]
        );
        assert_eq!(a.difference(&b).into_sorted_vec(), vec![TagRef::new(1)]);
    }
}
