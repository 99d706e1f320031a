// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query language end-to-end tests: traversal, filters, builtins

#[path = "testutils/mod.rs"]
mod testutils;

use testutils::test_fixture::TestFixture;
use ziptag::{CancelHandle, Config, FetchOptions, ZipTagError};

#[test]
fn test_relation_traversal() {
    let fixture = TestFixture::in_memory();
    fixture.seed_speaks();
    fixture.assert_vals(
        r#"| person == "ada" > rel == "speaks" > language"#,
        &["python"],
    );
}

#[test]
fn test_traversal_misses_are_empty_sets() {
    let fixture = TestFixture::in_memory();
    fixture.seed_speaks();
    fixture.assert_empty(r#"| person == "grace" > rel > language"#);
    fixture.assert_empty(r#"| person == "ada" > rel == "wrote" > language"#);
    // Unknown ttypes are empty, not errors, by default.
    fixture.assert_empty("| nonexistent");
}

#[test]
fn test_strict_types_raises() {
    let fixture = TestFixture::with_config(Config::default().with_strict_types(true));
    fixture.add("person", "ada");
    assert!(matches!(
        fixture.db.fetch("| nonexistent"),
        Err(ZipTagError::UnknownType(_))
    ));
    fixture.assert_vals("| person", &["ada"]);
}

#[test]
fn test_star_steps() {
    let fixture = TestFixture::in_memory();
    let (ada, speaks, python) = fixture.seed_speaks();
    let _ = (ada, speaks, python);
    // '*' as a hop accepts any neighbor type.
    fixture.assert_vals(r#"| person == "ada" > * > language"#, &["python"]);
    // Leading '*' scans everything.
    fixture.assert_vals("| *", &["ada", "speaks", "python"]);
}

#[test]
fn test_value_filters_and_boolean_groups() {
    let fixture = TestFixture::in_memory();
    fixture.add("lang", "python");
    fixture.add("lang", "perl");
    fixture.add("lang", "rust");

    fixture.assert_vals(r#"| lang startswith("p")"#, &["python", "perl"]);
    fixture.assert_vals(r#"| lang regex("^r.st$")"#, &["rust"]);
    fixture.assert_vals(
        r#"| lang (startswith("py") or == "rust")"#,
        &["python", "rust"],
    );
    fixture.assert_vals(
        r#"| lang (startswith("p") and exclude(startswith("pe")))"#,
        &["python"],
    );
    fixture.assert_vals(r#"| lang != "perl""#, &["python", "rust"]);
    fixture.assert_vals(r#"| lang all()"#, &["python", "perl", "rust"]);
}

#[test]
fn test_numeric_comparators() {
    let fixture = TestFixture::in_memory();
    fixture.add("metric", "10");
    fixture.add("metric", "25");
    fixture.add("metric", "7.5");
    fixture.add("metric", "n/a");

    fixture.assert_vals("| metric >= 10", &["10", "25"]);
    fixture.assert_vals("| metric < 10", &["7.5"]);
    fixture.assert_vals("| metric > 10", &["25"]);
    fixture.assert_vals("| metric num()", &["10", "25", "7.5"]);
}

#[test]
fn test_top_selector() {
    let fixture = TestFixture::in_memory();
    fixture.add("score", "30");
    fixture.add("score", "10");
    fixture.add("score", "20");

    // Keyed: largest first, rendered back in tref order.
    fixture.assert_vals("| score top(2, num)", &["30", "20"]);
    // Unkeyed: smallest trefs.
    fixture.assert_vals("| score top(2)", &["30", "10"]);
}

#[test]
fn test_match_first_selector() {
    let fixture = TestFixture::in_memory();
    fixture.add("name", "Ada");
    fixture.add("name", "ada");
    fixture.add("name", "grace");
    // One winner per lowercased key, first tref wins.
    fixture.assert_vals("| name match_first(lower)", &["Ada", "grace"]);
}

#[test]
fn test_filter_only_step_narrows_without_traversal() {
    let fixture = TestFixture::in_memory();
    let hub = fixture.add("y", "hub");
    let a1 = fixture.add("x", "alpha");
    let b1 = fixture.add("x", "beta");
    fixture.link(hub, a1);
    fixture.link(hub, b1);

    fixture.assert_vals(r#"| y > x > startswith("a")"#, &["alpha"]);
    fixture.assert_vals(r#"| y > x > (== "alpha" or == "beta")"#, &["alpha", "beta"]);
}

#[test]
fn test_let_prelude_splices() {
    let fixture = TestFixture::in_memory();
    fixture.seed_speaks();
    fixture.assert_vals(
        r#"let who = (| person == "ada") | who > rel == "speaks" > language"#,
        &["python"],
    );
}

#[test]
fn test_parse_errors_carry_position_and_hint() {
    let fixture = TestFixture::in_memory();
    match fixture.db.fetch("| lang startwith(\"p\")") {
        Err(ZipTagError::Parse {
            position,
            suggestion,
            ..
        }) => {
            assert!(position > 0);
            assert_eq!(suggestion.as_deref(), Some("startswith"));
        }
        other => panic!("expected parse error, got {:?}", other),
    }
    assert!(matches!(
        fixture.db.fetch("person > language"),
        Err(ZipTagError::Parse { .. })
    ));
}

#[test]
fn test_cancelled_query_surfaces() {
    let fixture = TestFixture::in_memory();
    fixture.seed_speaks();
    let cancel = CancelHandle::new();
    cancel.cancel();
    let result = fixture.db.fetch_with(
        "| person > rel > language",
        FetchOptions {
            cancel: Some(cancel),
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(ZipTagError::Cancelled)));
}

#[test]
fn test_result_json_rendering() {
    let fixture = TestFixture::in_memory();
    fixture.add("person", "ada");
    let json = fixture.db.fetch("| person").unwrap().to_json();
    let rows = json.as_array().expect("array rendering");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["ttype"], "person");
    assert_eq!(rows[0]["val"], "ada");
}

#[test]
fn test_explain_shows_plan_shape() {
    let fixture = TestFixture::in_memory();
    fixture.seed_speaks();
    let plan = fixture
        .db
        .explain(r#"| person == "ada" > rel == "speaks" > language"#)
        .unwrap();
    // The equality rewrite should surface point sources and the join order.
    assert!(plan.contains("SourceByIdentity"), "plan was:\n{}", plan);
    assert!(plan.contains("Intersect"), "plan was:\n{}", plan);
    assert!(plan.contains("est "), "plan was:\n{}", plan);
}

#[test]
fn test_memo_cache_reused_across_identical_queries() {
    let fixture = TestFixture::in_memory();
    fixture.add("lang", "python");
    fixture.add("lang", "perl");

    let query = r#"| lang (startswith("p") or == "python")"#;
    let first = fixture.db.fetch(query).unwrap();
    let second = fixture.db.fetch(query).unwrap();
    assert_eq!(first.tags, second.tags);

    let stats = fixture.db.cache_stats();
    assert!(stats.hits > 0, "expected shared memo hits: {:?}", stats);
}

#[test]
fn test_memo_cache_invalidated_by_commit() {
    let fixture = TestFixture::in_memory();
    fixture.add("lang", "python");
    let query = r#"| lang (startswith("p") or == "x")"#;
    fixture.assert_vals(query, &["python"]);
    fixture.add("lang", "perl");
    fixture.assert_vals(query, &["python", "perl"]);
}
