// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Parallel join determinism: results are independent of worker count and
//! the parallel threshold

#[path = "testutils/mod.rs"]
mod testutils;

use testutils::test_fixture::TestFixture;
use ziptag::Config;

/// 10,000 `x` tags linked to one `y` hub; roughly a third start with "a".
fn seed_fanout(fixture: &TestFixture) {
    let mut tx = fixture.db.begin();
    let hub = tx.add_tag("y", "hub").unwrap();
    for i in 0..10_000u32 {
        let prefix = match i % 3 {
            0 => "a",
            1 => "b",
            _ => "c",
        };
        let spoke = tx.add_tag("x", &format!("{}{:05}", prefix, i)).unwrap();
        tx.link(hub, spoke).unwrap();
    }
    tx.commit().unwrap();
}

fn run_with(workers: usize, parallel_threshold: usize) -> Vec<String> {
    let fixture = TestFixture::with_config(
        Config::default()
            .with_workers(workers)
            .with_parallel_threshold(parallel_threshold),
    );
    seed_fanout(&fixture);
    fixture
        .db
        .fetch(r#"| y > x > startswith("a")"#)
        .unwrap()
        .vals()
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[test]
fn test_result_independent_of_workers_and_threshold() {
    let baseline = run_with(1, usize::MAX);
    assert_eq!(baseline.len(), 3334);
    // Rendered order is ascending tref, so equality is exact, not set-wise.
    assert!(baseline.windows(2).all(|w| w[0] < w[1]));

    for (workers, threshold) in [(0, 1024), (2, 64), (8, 1), (3, 100_000)] {
        let result = run_with(workers, threshold);
        assert_eq!(
            result, baseline,
            "workers={} threshold={} diverged",
            workers, threshold
        );
    }
}

#[test]
fn test_large_intersection_parallel_matches_sequential() {
    let queries = [
        r#"| x (startswith("a") or startswith("b")) > y"#,
        r#"| x > y > x top(5)"#,
    ];
    for query in queries {
        let sequential = {
            let fixture = TestFixture::with_config(
                Config::default().with_workers(1).with_parallel_threshold(usize::MAX),
            );
            seed_fanout(&fixture);
            fixture.db.fetch(query).unwrap().to_json()
        };
        let parallel = {
            let fixture = TestFixture::with_config(
                Config::default().with_workers(4).with_parallel_threshold(16),
            );
            seed_fanout(&fixture);
            fixture.db.fetch(query).unwrap().to_json()
        };
        assert_eq!(sequential, parallel, "query {:?} diverged", query);
    }
}
