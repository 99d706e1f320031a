// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Execution error types

use thiserror::Error;

use crate::functions::eval::FunctionError;

/// Execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("unknown ttype: {0}")]
    UnknownType(String),

    #[error("function error: {0}")]
    Function(#[from] FunctionError),

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("query cancelled")]
    Cancelled,
}
