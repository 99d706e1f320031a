// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Logical plan operators over tref sets
//!
//! A plan is a tree of primitive set operators. Lowering from the AST is
//! direct and unoptimized; the optimizer rewrites the tree afterwards.
//! Operator trees serialize deterministically, which is what the memoization
//! digests are computed from.

use serde::{Deserialize, Serialize};

use crate::ast::ast::{CmpOp, CmpRhs, Filter, FunCall, Step};
use crate::cache::fnv64;

/// Value predicate attached to a `FilterPredicate` operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pred {
    Const(bool),
    Compare { op: CmpOp, rhs: CmpRhs },
    Call(FunCall),
    And(Vec<Pred>),
    Or(Vec<Pred>),
}

impl Pred {
    pub fn from_filter(filter: &Filter) -> Self {
        match filter {
            Filter::Compare { op, rhs } => Pred::Compare {
                op: *op,
                rhs: rhs.clone(),
            },
            Filter::Call(call) => Pred::Call(call.clone()),
            Filter::And(a, b) => {
                Pred::And(vec![Pred::from_filter(a), Pred::from_filter(b)])
            }
            Filter::Or(a, b) => Pred::Or(vec![Pred::from_filter(a), Pred::from_filter(b)]),
        }
    }
}

/// Primitive plan operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanOp {
    /// Statically-known empty result.
    Empty,
    SourceAllOfType {
        ttype: String,
    },
    SourceByIdentity {
        ttype: String,
        val: String,
    },
    /// Every live tag; produced by a leading `*` step.
    SourceAllTags,
    Traverse {
        input: Box<PlanOp>,
    },
    FilterType {
        input: Box<PlanOp>,
        ttype: String,
    },
    FilterPredicate {
        input: Box<PlanOp>,
        pred: Pred,
    },
    Intersect {
        left: Box<PlanOp>,
        right: Box<PlanOp>,
    },
    Union {
        left: Box<PlanOp>,
        right: Box<PlanOp>,
    },
    Difference {
        left: Box<PlanOp>,
        right: Box<PlanOp>,
    },
    /// Memoized sub-plan; `digest` is the stable digest of the wrapped tree.
    Memo {
        digest: u64,
        input: Box<PlanOp>,
    },
}

impl PlanOp {
    pub fn boxed(self) -> Box<PlanOp> {
        Box::new(self)
    }
}

/// Stable digest of a plan subtree (FNV-64 over the canonical JSON form).
pub fn plan_digest(op: &PlanOp) -> u64 {
    let bytes = serde_json::to_vec(op).unwrap_or_default();
    fnv64(&bytes)
}

/// Direct, unoptimized lowering of a step pipe.
pub fn lower(steps: &[Step]) -> PlanOp {
    let mut iter = steps.iter();
    let mut op = match iter.next() {
        Some(Step::Type { ttype, filter }) => {
            let source = PlanOp::SourceAllOfType {
                ttype: ttype.clone(),
            };
            apply_filter(source, filter)
        }
        Some(Step::Any) => PlanOp::SourceAllTags,
        Some(Step::Filter(filter)) => PlanOp::FilterPredicate {
            input: PlanOp::SourceAllTags.boxed(),
            pred: Pred::from_filter(filter),
        },
        None => PlanOp::Empty,
    };
    for step in iter {
        match step {
            Step::Type { ttype, filter } => {
                op = PlanOp::Traverse { input: op.boxed() };
                op = PlanOp::FilterType {
                    input: op.boxed(),
                    ttype: ttype.clone(),
                };
                op = apply_filter(op, filter);
            }
            Step::Any => {
                op = PlanOp::Traverse { input: op.boxed() };
            }
            // Filter-only steps narrow in place; no traversal hop.
            Step::Filter(filter) => {
                op = PlanOp::FilterPredicate {
                    input: op.boxed(),
                    pred: Pred::from_filter(filter),
                };
            }
        }
    }
    op
}

fn apply_filter(op: PlanOp, filter: &Option<Filter>) -> PlanOp {
    match filter {
        Some(f) => PlanOp::FilterPredicate {
            input: op.boxed(),
            pred: Pred::from_filter(f),
        },
        None => op,
    }
}
