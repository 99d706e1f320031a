// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transactions, overlays, and the durability pipeline
//!
//! This module provides:
//! - Staged delta layers with idempotent operations ([`tx`])
//! - The atomic commit protocol behind the writer lock ([`manager`])
//! - The transaction-aware write-ahead log ([`wal`])
//! - Snapshot files, the MANIFEST, and startup recovery

pub mod manager;
pub mod recovery;
pub mod snapshot;
pub mod tx;
pub mod wal;

pub use manager::{Limits, TxnError, TxnManager};
pub use recovery::{recover, RecoveryReport};
pub use tx::{Tx, TxDelta};
pub use wal::{Wal, WalError};
