// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! AST for the pipeline query language
//!
//! A query is an optional overlay block followed by a pipe of steps. Each
//! step narrows or traverses: a type filter (optionally carrying a value
//! filter), or `*` for an untyped traversal hop. Variable references from a
//! `let` prelude are resolved by the parser and never reach the AST.

use serde::{Deserialize, Serialize};

/// A parsed query: overlay statements plus the step pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub overlay: Vec<OverlayStmt>,
    pub steps: Vec<Step>,
}

/// One pipe step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Step {
    /// Keep neighbors of the given ttype, optionally value-filtered.
    Type {
        ttype: String,
        filter: Option<Filter>,
    },
    /// Keep all neighbors regardless of type.
    Any,
    /// Filter the current result set in place, without traversing.
    Filter(Filter),
}

/// Boolean value-filter tree attached to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Compare { op: CmpOp, rhs: CmpRhs },
    Call(FunCall),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Lt => "<",
        }
    }
}

/// Right-hand side of a comparison. Equality compares strings; the ordered
/// comparators compare `num(val)` against a number or a key-function result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CmpRhs {
    Str(String),
    Num(f64),
    Call(FunCall),
}

/// A builtin function call inside a value filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunCall {
    pub name: String,
    pub args: Vec<Expr>,
}

/// Function-call argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Str(String),
    Num(f64),
    /// Bare function reference, e.g. the key function in `top(3, num)`.
    Name(String),
    Call(FunCall),
}

/// One statement of a `with { ... }` overlay block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverlayStmt {
    AddTag {
        ttype: String,
        val: String,
        alias: Option<String>,
    },
    RemTag {
        ttype: String,
        val: String,
    },
    Link {
        a: OverlayRef,
        b: OverlayRef,
    },
    Unlink {
        a: OverlayRef,
        b: OverlayRef,
    },
}

/// Tag reference inside an overlay block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverlayRef {
    Alias(String),
    Identity { ttype: String, val: String },
}
