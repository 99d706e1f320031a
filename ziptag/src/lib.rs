// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! ZipTag - an embeddable in-memory graph-flavored data store
//!
//! ZipTag stores small, text-centric data as **tags** (typed string values,
//! identified by `(ttype, val)`) connected by untyped bidirectional links.
//! Relationship semantics are expressed as tags themselves: to say that ada
//! speaks python, link both tags to an intermediary `rel:speaks` tag.
//!
//! # Features
//!
//! - **Pipeline queries**: declarative pipes of traversal-plus-filter steps
//! - **Transactions & overlays**: staged deltas that preview against queries
//!   before an atomic commit advances the revision
//! - **Snapshot reads**: every query runs at a consistent revision while
//!   commits proceed concurrently
//! - **Durability**: transaction-aware WAL with batched flush, snapshots,
//!   and idempotent crash recovery
//! - **Parallel joins**: large intersections and traversals are partitioned
//!   across a worker pool
//!
//! # Usage
//!
//! ```no_run
//! use ziptag::{Config, Database};
//!
//! let db = Database::open(Config::default().with_path("./mydb"))?;
//!
//! let ada = db.add_tag("person", "ada")?;
//! let speaks = db.add_tag("rel", "speaks")?;
//! let python = db.add_tag("language", "python")?;
//! db.link(ada, speaks)?;
//! db.link(speaks, python)?;
//!
//! let result = db.fetch(r#"| person == "ada" > rel == "speaks" > language"#)?;
//! assert_eq!(result.vals(), vec!["python"]);
//! # Ok::<(), ziptag::ZipTagError>(())
//! ```

pub(crate) mod ast;
pub(crate) mod cache;
pub(crate) mod exec;
pub(crate) mod functions;
pub(crate) mod plan;
pub(crate) mod store;
pub(crate) mod txn;

mod config;
mod db;
mod error;

pub use cache::MemoCacheStats;
pub use config::Config;
pub use db::{Database, FetchOptions, QueryResult, StoreStats, TagHit};
pub use error::ZipTagError;
pub use exec::CancelHandle;
pub use store::{Tag, TagRef};
pub use txn::{RecoveryReport, Tx};

/// ZipTag version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ZipTag crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
