// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Core tag data structures and error types
//!
//! Defines TagRef handles, the Tag entity, per-link version stamps,
//! and error types for store operations.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel `delete_rev` for live entities.
pub const REV_LIVE: u64 = u64::MAX;

/// High bit marks a staged placeholder handle that has not been committed.
const PLACEHOLDER_BIT: u64 = 1 << 63;

static TTYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,63}$").expect("ttype pattern is valid"));

/// Stable 64-bit handle for a tag.
///
/// Real handles are assigned monotonically at commit and never reused.
/// Staged tags inside an uncommitted transaction carry placeholder handles
/// (high bit set) until commit assigns a real one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TagRef(u64);

impl TagRef {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Placeholder handle for a staged, uncommitted tag.
    pub fn placeholder(seq: u64) -> Self {
        Self(seq | PLACEHOLDER_BIT)
    }

    pub fn is_placeholder(&self) -> bool {
        self.0 & PLACEHOLDER_BIT != 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TagRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_placeholder() {
            write!(f, "~{}", self.0 & !PLACEHOLDER_BIT)
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// A tag: a typed string value with a stable handle and revision stamps.
///
/// Identity is `(ttype, val)`; the handle is not identity. Values are never
/// edited in place; a tag is only ever tombstoned via `delete_rev`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub tref: TagRef,
    pub ttype: String,
    pub val: String,
    pub create_rev: u64,
    pub delete_rev: u64,
}

impl Tag {
    pub fn new(tref: TagRef, ttype: String, val: String, create_rev: u64) -> Self {
        Self {
            tref,
            ttype,
            val,
            create_rev,
            delete_rev: REV_LIVE,
        }
    }

    /// Visibility check: `create_rev <= rev < delete_rev`.
    pub fn live_at(&self, rev: u64) -> bool {
        self.create_rev <= rev && rev < self.delete_rev
    }
}

/// Revision stamps carried by each link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkVer {
    pub create_rev: u64,
    pub delete_rev: u64,
}

impl LinkVer {
    pub fn new(create_rev: u64) -> Self {
        Self {
            create_rev,
            delete_rev: REV_LIVE,
        }
    }

    pub fn live_at(&self, rev: u64) -> bool {
        self.create_rev <= rev && rev < self.delete_rev
    }
}

/// Normalize an unordered link pair to `(min, max)`.
pub fn link_key(a: TagRef, b: TagRef) -> (TagRef, TagRef) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Error types for store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid ttype identifier: {0:?} (expected [a-z][a-z0-9-]{{0,63}})")]
    InvalidType(String),

    #[error("value exceeds {max} bytes (got {got})")]
    ValueTooLarge { max: usize, got: usize },

    #[error("empty value")]
    EmptyValue,

    #[error("self-links are not allowed")]
    SelfLink,

    #[error("live tag limit exceeded ({max})")]
    CapacityExceeded { max: usize },

    #[error("unknown ttype: {0}")]
    UnknownType(String),

    #[error("ttype {0} still has live tags")]
    TypeNotEmpty(String),

    #[error("tag not found: {0}")]
    TagNotFound(String),
}

/// Validate a ttype identifier against the identifier pattern and byte limit.
pub fn validate_ttype(ttype: &str, max_bytes: usize) -> Result<(), StoreError> {
    if ttype.len() > max_bytes || !TTYPE_RE.is_match(ttype) {
        return Err(StoreError::InvalidType(ttype.to_string()));
    }
    Ok(())
}

/// Validate a tag value against the configured byte limit.
pub fn validate_val(val: &str, max_bytes: usize) -> Result<(), StoreError> {
    if val.is_empty() {
        return Err(StoreError::EmptyValue);
    }
    if val.len() > max_bytes {
        return Err(StoreError::ValueTooLarge {
            max: max_bytes,
            got: val.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagref_placeholder_roundtrip() {
        let p = TagRef::placeholder(7);
        assert!(p.is_placeholder());
        assert!(!TagRef::new(7).is_placeholder());
        assert_ne!(p, TagRef::new(7));
        assert_eq!(format!("{}", p), "~7");
        assert_eq!(format!("{}", TagRef::new(7)), "#7");
    }

    #[test]
    fn test_visibility_window() {
        let mut tag = Tag::new(TagRef::new(1), "person".into(), "ada".into(), 3);
        assert!(!tag.live_at(2));
        assert!(tag.live_at(3));
        assert!(tag.live_at(100));
        tag.delete_rev = 5;
        assert!(tag.live_at(4));
        assert!(!tag.live_at(5));
    }

    #[test]
    fn test_ttype_validation() {
        assert!(validate_ttype("person", 64).is_ok());
        assert!(validate_ttype("a-b-9", 64).is_ok());
        assert!(validate_ttype("Person", 64).is_err());
        assert!(validate_ttype("-x", 64).is_err());
        assert!(validate_ttype("", 64).is_err());
        assert!(validate_ttype("verylongname", 4).is_err());
    }

    #[test]
    fn test_link_key_normalizes() {
        let (a, b) = (TagRef::new(9), TagRef::new(2));
        assert_eq!(link_key(a, b), link_key(b, a));
        assert_eq!(link_key(a, b), (TagRef::new(2), TagRef::new(9)));
    }
}
