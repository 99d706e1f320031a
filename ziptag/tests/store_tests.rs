// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Store invariants: identity, idempotence, adjacency symmetry, trefs

#[path = "testutils/mod.rs"]
mod testutils;

use testutils::test_fixture::TestFixture;
use ziptag::ZipTagError;

#[test]
fn test_add_tag_is_idempotent() {
    let fixture = TestFixture::in_memory();
    let first = fixture.add("language", "python");
    let second = fixture.add("language", "python");
    assert_eq!(first, second);
    assert_eq!(fixture.db.stats().live_tags, 1);
    fixture.assert_vals("| language", &["python"]);
}

#[test]
fn test_trefs_are_monotonic_and_never_reused() {
    let fixture = TestFixture::in_memory();
    let a = fixture.add("x", "1");
    let b = fixture.add("x", "2");
    assert!(b.raw() > a.raw());

    // Delete and re-add: the identity comes back under a fresh handle.
    assert!(fixture.db.rem_tag("x", "1").unwrap());
    let reborn = fixture.add("x", "1");
    assert!(reborn.raw() > b.raw());
    assert_ne!(reborn, a);
}

#[test]
fn test_link_is_bidirectional_and_deduped() {
    let fixture = TestFixture::in_memory();
    let a = fixture.add("x", "a");
    let b = fixture.add("y", "b");
    assert!(fixture.db.link(a, b).unwrap());
    // Same link in either direction is a no-op.
    assert!(!fixture.db.link(b, a).unwrap());
    assert_eq!(fixture.db.stats().live_links, 1);

    fixture.assert_vals("| x > y", &["b"]);
    fixture.assert_vals("| y > x", &["a"]);
}

#[test]
fn test_self_link_rejected() {
    let fixture = TestFixture::in_memory();
    let a = fixture.add("x", "a");
    let err = fixture.db.link(a, a).unwrap_err();
    assert!(matches!(err, ZipTagError::Validation(_)));
}

#[test]
fn test_rem_tag_removes_incident_links() {
    let fixture = TestFixture::in_memory();
    let hub = fixture.add("hub", "h");
    let s1 = fixture.add("spoke", "s1");
    let s2 = fixture.add("spoke", "s2");
    fixture.link(hub, s1);
    fixture.link(hub, s2);
    assert_eq!(fixture.db.stats().live_links, 2);

    assert!(fixture.db.rem_tag("hub", "h").unwrap());
    assert_eq!(fixture.db.stats().live_links, 0);
    assert_eq!(fixture.db.stats().live_tags, 2);
    fixture.assert_empty("| spoke > hub");
}

#[test]
fn test_rem_tag_missing_is_noop() {
    let fixture = TestFixture::in_memory();
    assert!(!fixture.db.rem_tag("ghost", "nope").unwrap());
    assert_eq!(fixture.db.current_rev(), 0);
}

#[test]
fn test_validation_rejects_bad_writes() {
    let fixture = TestFixture::in_memory();
    assert!(matches!(
        fixture.db.add_tag("Bad-Type", "x"),
        Err(ZipTagError::Validation(_))
    ));
    assert!(matches!(
        fixture.db.add_tag("x", ""),
        Err(ZipTagError::Validation(_))
    ));
    let oversize = "v".repeat(2048);
    assert!(matches!(
        fixture.db.add_tag("x", &oversize),
        Err(ZipTagError::Validation(_))
    ));
    // Nothing committed along the way.
    assert_eq!(fixture.db.current_rev(), 0);
}

#[test]
fn test_get_tag_surfaces_not_found() {
    let fixture = TestFixture::in_memory();
    fixture.add("person", "ada");
    assert!(fixture.db.get_tag("person", "ada").is_ok());
    assert!(matches!(
        fixture.db.get_tag("person", "grace"),
        Err(ZipTagError::NotFound(_))
    ));
}

#[test]
fn test_snapshot_reads_at_older_revs() {
    let fixture = TestFixture::in_memory();
    fixture.add("x", "one");
    let rev_one = fixture.db.current_rev();
    fixture.add("x", "two");
    fixture.db.rem_tag("x", "one").unwrap();
    let rev_final = fixture.db.current_rev();

    let at_one = fixture
        .db
        .fetch_with("| x", ziptag::FetchOptions {
            rev: Some(rev_one),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(at_one.vals(), vec!["one"]);

    let latest = fixture.db.fetch("| x").unwrap();
    assert_eq!(latest.vals(), vec!["two"]);
    assert_eq!(latest.rev, rev_final);
}

#[test]
fn test_drop_ttype_requires_empty() {
    let fixture = TestFixture::in_memory();
    fixture.add("tmp", "a");

    let mut tx = fixture.db.begin();
    assert!(tx.drop_ttype("tmp").is_err());
    tx.rem_tag("tmp", "a").unwrap();
    tx.drop_ttype("tmp").unwrap();
    tx.commit().unwrap();
    fixture.assert_empty("| tmp");
}

#[test]
fn test_max_live_tags_enforced() {
    let mut config = ziptag::Config::default();
    config.max_live_tags = 2;
    let fixture = TestFixture::with_config(config);
    fixture.add("x", "1");
    fixture.add("x", "2");
    assert!(matches!(
        fixture.db.add_tag("x", "3"),
        Err(ZipTagError::Validation(_))
    ));
}
