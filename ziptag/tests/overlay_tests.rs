// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Overlay laws: preview vs commit, tombstone masking, layering

#[path = "testutils/mod.rs"]
mod testutils;

use testutils::test_fixture::TestFixture;
use ziptag::{FetchOptions, ZipTagError};

#[test]
fn test_overlay_preview_vs_commit() {
    let fixture = TestFixture::in_memory();
    let acme = fixture.add("person", "acme");
    let azure = fixture.add("provider", "azure");
    let rev_before = fixture.db.current_rev();

    let query = r#"| person == "acme" > rel == "excludes-provider" > provider"#;

    let mut tx = fixture.db.begin();
    let excludes = tx.add_tag("rel", "excludes-provider").unwrap();
    tx.link(acme, excludes).unwrap();
    tx.link(excludes, azure).unwrap();

    // The overlay sees the exclusion; the base does not.
    let preview = fixture
        .db
        .fetch_with(query, FetchOptions {
            overlays: vec![&tx],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(preview.vals(), vec!["azure"]);
    assert!(fixture.db.fetch(query).unwrap().is_empty());

    let new_rev = tx.commit().unwrap();
    assert_eq!(new_rev, rev_before + 1);
    assert_eq!(fixture.db.fetch(query).unwrap().vals(), vec!["azure"]);
}

#[test]
fn test_overlay_tombstone_masks_base() {
    let fixture = TestFixture::in_memory();
    fixture.add("t", "A");

    let mut tx = fixture.db.begin();
    tx.rem_tag("t", "A").unwrap();

    let masked = fixture
        .db
        .fetch_with("| t", FetchOptions {
            overlays: vec![&tx],
            ..Default::default()
        })
        .unwrap();
    assert!(masked.is_empty());
    assert_eq!(fixture.db.fetch("| t").unwrap().vals(), vec!["A"]);
    tx.abort();
    assert_eq!(fixture.db.fetch("| t").unwrap().vals(), vec!["A"]);
}

#[test]
fn test_empty_overlay_is_identity() {
    let fixture = TestFixture::in_memory();
    fixture.seed_speaks();
    let tx = fixture.db.begin();
    let query = "| person > rel > language";
    let with_empty = fixture
        .db
        .fetch_with(query, FetchOptions {
            overlays: vec![&tx],
            ..Default::default()
        })
        .unwrap();
    let without = fixture.db.fetch(query).unwrap();
    assert_eq!(with_empty.tags, without.tags);
}

#[test]
fn test_overlay_block_in_query() {
    let fixture = TestFixture::in_memory();
    fixture.add("person", "acme");
    fixture.add("provider", "azure");

    let query = r#"with {
        +tag(rel, "excludes-provider") as x;
        link((person, "acme"), x);
        link(x, (provider, "azure"));
    } | person == "acme" > rel == "excludes-provider" > provider"#;

    assert_eq!(fixture.db.fetch(query).unwrap().vals(), vec!["azure"]);
    // The overlay block is hypothetical: nothing was committed.
    assert!(fixture
        .db
        .fetch(r#"| person == "acme" > rel > provider"#)
        .unwrap()
        .is_empty());
    assert_eq!(fixture.db.stats().live_tags, 2);
}

#[test]
fn test_overlay_block_unlink_and_remove() {
    let fixture = TestFixture::in_memory();
    let (ada, speaks, _python) = fixture.seed_speaks();
    let _ = (ada, speaks);

    // Unlinking in an overlay hides the base link for that query only.
    let cut = fixture
        .db
        .fetch(r#"with { unlink((person, "ada"), (rel, "speaks")); } | person > rel > language"#)
        .unwrap();
    assert!(cut.is_empty());
    fixture.assert_vals("| person > rel > language", &["python"]);

    // Tombstoning the relation tag has the same effect.
    let masked = fixture
        .db
        .fetch(r#"with { -tag(rel, "speaks"); } | person > rel > language"#)
        .unwrap();
    assert!(masked.is_empty());
}

#[test]
fn test_commit_equals_overlay_fetch() {
    let fixture = TestFixture::in_memory();
    fixture.add("person", "ada");
    let query = r#"| person > rel == "knows" > person"#;

    let mut tx = fixture.db.begin();
    let grace = tx.add_tag("person", "grace").unwrap();
    let knows = tx.add_tag("rel", "knows").unwrap();
    let ada = fixture.db.get_tag("person", "ada").unwrap().tref;
    tx.link(ada, knows).unwrap();
    tx.link(knows, grace).unwrap();

    let preview: Vec<String> = fixture
        .db
        .fetch_with(query, FetchOptions {
            overlays: vec![&tx],
            ..Default::default()
        })
        .unwrap()
        .vals()
        .iter()
        .map(|s| s.to_string())
        .collect();

    tx.commit().unwrap();
    let committed = fixture.db.fetch(query).unwrap();
    // Same identities either way (handles differ: placeholders vs real).
    let mut preview_sorted = preview;
    preview_sorted.sort();
    let mut committed_sorted: Vec<String> =
        committed.vals().iter().map(|s| s.to_string()).collect();
    committed_sorted.sort();
    assert_eq!(preview_sorted, committed_sorted);
}

#[test]
fn test_stale_parent_conflict_on_removal() {
    let fixture = TestFixture::in_memory();
    fixture.add("t", "doomed");

    let mut tx = fixture.db.begin();
    tx.rem_tag("t", "doomed").unwrap();

    // A concurrent commit removes the target first.
    fixture.db.rem_tag("t", "doomed").unwrap();

    assert!(matches!(
        tx.commit(),
        Err(ZipTagError::ConflictStaleParent(_))
    ));
}

#[test]
fn test_stale_parent_additions_never_conflict() {
    let fixture = TestFixture::in_memory();

    let mut tx = fixture.db.begin();
    tx.add_tag("x", "mine").unwrap();

    // Concurrent commits advance the base; additions are idempotent.
    fixture.add("x", "other");
    fixture.add("x", "mine");

    let rev = tx.commit().unwrap();
    assert_eq!(rev, fixture.db.current_rev());
    fixture.assert_vals("| x", &["other", "mine"]);
    assert_eq!(fixture.db.stats().live_tags, 2);
}

#[test]
fn test_tx_staged_reads_are_idempotent() {
    let fixture = TestFixture::in_memory();
    let mut tx = fixture.db.begin();
    let a = tx.add_tag("x", "a").unwrap();
    let again = tx.add_tag("x", "a").unwrap();
    assert_eq!(a, again);

    let b = tx.add_tag("y", "b").unwrap();
    assert!(tx.link(a, b).unwrap());
    assert!(!tx.link(b, a).unwrap());
    assert!(tx.unlink(a, b).unwrap());
    assert!(!tx.unlink(a, b).unwrap());
    tx.commit().unwrap();

    // The staged link was retracted before commit.
    assert_eq!(fixture.db.stats().live_links, 0);
    assert_eq!(fixture.db.stats().live_tags, 2);
}
