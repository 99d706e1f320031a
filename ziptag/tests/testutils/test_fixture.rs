// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Test fixture: a database plus seeding and assertion helpers

use tempfile::TempDir;
use ziptag::{Config, Database, TagRef};

pub struct TestFixture {
    pub db: Database,
    // Kept alive so the data directory outlives the database.
    _dir: Option<TempDir>,
}

impl TestFixture {
    /// Ephemeral in-memory database.
    pub fn in_memory() -> Self {
        let db = Database::open(Config::default()).expect("failed to open in-memory database");
        Self { db, _dir: None }
    }

    /// Database backed by a throwaway data directory, fsyncing every commit.
    pub fn persistent() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db = Database::open(
            Config::default()
                .with_path(dir.path())
                .with_flush_interval_ms(0),
        )
        .expect("failed to open persistent database");
        Self {
            db,
            _dir: Some(dir),
        }
    }

    pub fn with_config(config: Config) -> Self {
        let db = Database::open(config).expect("failed to open database");
        Self { db, _dir: None }
    }

    pub fn add(&self, ttype: &str, val: &str) -> TagRef {
        self.db
            .add_tag(ttype, val)
            .unwrap_or_else(|e| panic!("add_tag({}, {}) failed: {}", ttype, val, e))
    }

    pub fn link(&self, a: TagRef, b: TagRef) {
        self.db
            .link(a, b)
            .unwrap_or_else(|e| panic!("link failed: {}", e));
    }

    /// Seed the ada-speaks-python triple: two entity tags joined through an
    /// intermediary relation tag.
    pub fn seed_speaks(&self) -> (TagRef, TagRef, TagRef) {
        let ada = self.add("person", "ada");
        let speaks = self.add("rel", "speaks");
        let python = self.add("language", "python");
        self.link(ada, speaks);
        self.link(speaks, python);
        (ada, speaks, python)
    }

    /// Query and compare the result values (ascending tref order).
    pub fn assert_vals(&self, query: &str, expected: &[&str]) {
        let result = self
            .db
            .fetch(query)
            .unwrap_or_else(|e| panic!("query {:?} failed: {}", query, e));
        assert_eq!(result.vals(), expected, "query {:?}", query);
    }

    pub fn assert_empty(&self, query: &str) {
        self.assert_vals(query, &[]);
    }
}
