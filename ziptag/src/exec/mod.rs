// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query execution engine
//!
//! Runs optimized plans against a captured view and produces tref sets.

pub mod error;
pub mod executor;
pub mod set;

pub use error::ExecutionError;
pub use executor::{ExecContext, Executor};
pub use set::TrefSet;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Parsing,
    Planning,
    Executing,
    Done,
}

impl std::fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryPhase::Parsing => "parsing",
            QueryPhase::Planning => "planning",
            QueryPhase::Executing => "executing",
            QueryPhase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Cooperative cancellation handle. The executor checks it between
/// operators and at join-partition boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
