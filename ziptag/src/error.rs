// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Top-level error type
//!
//! Module-level errors (`StoreError`, `ParserError`, `WalError`, ...) are
//! converted into this enum at the public API boundary.

use thiserror::Error;

use crate::ast::ParserError;
use crate::exec::ExecutionError;
use crate::store::StoreError;
use crate::txn::{TxnError, WalError};

/// Errors surfaced by the public API
#[derive(Error, Debug)]
pub enum ZipTagError {
    #[error("query parse error at byte {position}: {message}")]
    Parse {
        message: String,
        position: usize,
        suggestion: Option<String>,
    },

    #[error("unknown ttype: {0}")]
    UnknownType(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("commit conflict: {0}")]
    ConflictStaleParent(String),

    #[error("durability error: corrupt record at offset {offset}: {reason}")]
    DurabilityCorrupt { offset: u64, reason: String },

    #[error("durability error: {0}")]
    DurabilityIoFailed(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<ParserError> for ZipTagError {
    fn from(err: ParserError) -> Self {
        ZipTagError::Parse {
            position: err.position(),
            suggestion: err.suggestion().map(|s| s.to_string()),
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for ZipTagError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownType(t) => ZipTagError::UnknownType(t),
            StoreError::TagNotFound(t) => ZipTagError::NotFound(t),
            other => ZipTagError::Validation(other.to_string()),
        }
    }
}

impl From<WalError> for ZipTagError {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Corrupt { offset, reason } => {
                ZipTagError::DurabilityCorrupt { offset, reason }
            }
            io => ZipTagError::DurabilityIoFailed(io.to_string()),
        }
    }
}

impl From<TxnError> for ZipTagError {
    fn from(err: TxnError) -> Self {
        match err {
            TxnError::ConflictStaleParent(detail) => ZipTagError::ConflictStaleParent(detail),
            TxnError::Store(store) => store.into(),
            TxnError::Durability(wal) => wal.into(),
        }
    }
}

impl From<ExecutionError> for ZipTagError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Cancelled => ZipTagError::Cancelled,
            ExecutionError::UnknownType(t) => ZipTagError::UnknownType(t),
            other => ZipTagError::Execution(other.to_string()),
        }
    }
}
