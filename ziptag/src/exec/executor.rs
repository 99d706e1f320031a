// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Plan execution over a captured view
//!
//! The executor never touches the writer lock: it reads through the view's
//! generation pointer for the whole query. Traversals, intersections, and
//! per-tag filters partition their larger input across the worker pool once
//! it crosses the parallel threshold; cancellation is checked between
//! operators and at partition boundaries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use crate::ast::ast::{CmpOp, CmpRhs};
use crate::cache::{digest_set, MemoCache};
use crate::functions::{self, eval::FunctionError, FunctionKind};
use crate::plan::{PlanOp, Pred};
use crate::store::{TagRef, View};

use super::error::ExecutionError;
use super::set::TrefSet;
use super::CancelHandle;

/// Work chunk for partitioned operators.
const PARTITION_CHUNK: usize = 256;

/// Per-query execution context.
pub struct ExecContext<'a> {
    pub view: &'a View,
    pub strict_types: bool,
    pub cancel: Option<&'a CancelHandle>,
    /// Shared memo cache; only wired up for overlay-free views.
    pub shared_memo: Option<&'a MemoCache>,
    local_memo: HashMap<(u64, u64), Arc<Vec<TagRef>>>,
    regexes: functions::RegexCache,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        view: &'a View,
        strict_types: bool,
        cancel: Option<&'a CancelHandle>,
        shared_memo: Option<&'a MemoCache>,
    ) -> Self {
        Self {
            view,
            strict_types,
            cancel,
            shared_memo,
            local_memo: HashMap::new(),
            regexes: functions::RegexCache::new(),
        }
    }

    fn check_cancel(&self) -> Result<(), ExecutionError> {
        match self.cancel {
            Some(handle) if handle.is_cancelled() => Err(ExecutionError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Plan executor backed by a worker pool.
pub struct Executor {
    pool: rayon::ThreadPool,
    parallel_threshold: usize,
}

impl Executor {
    /// `workers == 0` sizes the pool to hardware concurrency.
    pub fn new(workers: usize, parallel_threshold: usize) -> Result<Self, ExecutionError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ziptag-worker-{}", i))
            .build()
            .map_err(|e| ExecutionError::Pool(e.to_string()))?;
        Ok(Self {
            pool,
            parallel_threshold: parallel_threshold.max(1),
        })
    }

    /// Execute a plan, returning the result set in ascending tref order.
    pub fn run(
        &self,
        plan: &PlanOp,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Vec<TagRef>, ExecutionError> {
        let set = self.eval(plan, ctx)?;
        ctx.check_cancel()?;
        Ok(set.into_sorted_vec())
    }

    fn eval(&self, op: &PlanOp, ctx: &mut ExecContext<'_>) -> Result<TrefSet, ExecutionError> {
        ctx.check_cancel()?;
        match op {
            PlanOp::Empty => Ok(TrefSet::empty()),
            PlanOp::SourceAllOfType { ttype } => self.source_type(ttype, ctx),
            PlanOp::SourceByIdentity { ttype, val } => {
                if ctx.strict_types && !ctx.view.has_type(ttype) {
                    return Err(ExecutionError::UnknownType(ttype.clone()));
                }
                Ok(match ctx.view.lookup_identity(ttype, val) {
                    Some(tref) => TrefSet::from_vec(vec![tref]),
                    None => TrefSet::empty(),
                })
            }
            PlanOp::SourceAllTags => {
                let mut acc = TrefSet::empty();
                for ttype in ctx.view.type_names() {
                    acc = acc.union(TrefSet::from_vec(ctx.view.all_of_type(&ttype)));
                }
                Ok(acc)
            }
            PlanOp::Traverse { input } => {
                let input = self.eval(input, ctx)?;
                self.traverse(input, ctx)
            }
            PlanOp::FilterType { input, ttype } => {
                let input = self.eval(input, ctx)?;
                if ctx.strict_types && !ctx.view.has_type(ttype) {
                    return Err(ExecutionError::UnknownType(ttype.clone()));
                }
                let view = ctx.view;
                self.retain(input, ctx, move |tref, _| {
                    Ok(view
                        .ident(tref)
                        .map(|(t, _)| t == ttype)
                        .unwrap_or(false))
                })
            }
            PlanOp::FilterPredicate { input, pred } => {
                let input = self.eval(input, ctx)?;
                self.apply_pred(input, pred, ctx)
            }
            PlanOp::Intersect { left, right } => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                self.intersect(left, right, ctx)
            }
            PlanOp::Union { left, right } => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                Ok(left.union(right))
            }
            PlanOp::Difference { left, right } => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                Ok(left.difference(&right))
            }
            PlanOp::Memo { digest, input } => {
                // Memo wraps a closed sub-plan: the input-set component of
                // the key is the empty-set digest, discrimination comes from
                // the sub-AST digest, and rev scoping provides invalidation.
                let key = (digest_set(&[]), *digest);
                if let Some(hit) = ctx.local_memo.get(&key) {
                    return Ok(TrefSet::from_vec(hit.as_ref().clone()));
                }
                if let Some(cache) = ctx.shared_memo {
                    if let Some(hit) = cache.get(ctx.view.rev(), key) {
                        ctx.local_memo.insert(key, hit.clone());
                        return Ok(TrefSet::from_vec(hit.as_ref().clone()));
                    }
                }
                let result = self.eval(input, ctx)?;
                let sorted = Arc::new(result.sorted_vec());
                ctx.local_memo.insert(key, sorted.clone());
                if let Some(cache) = ctx.shared_memo {
                    cache.insert(ctx.view.rev(), key, sorted.clone());
                }
                Ok(result)
            }
        }
    }

    fn source_type(
        &self,
        ttype: &str,
        ctx: &ExecContext<'_>,
    ) -> Result<TrefSet, ExecutionError> {
        if !ctx.view.has_type(ttype) {
            if ctx.strict_types {
                return Err(ExecutionError::UnknownType(ttype.to_string()));
            }
            debug!("unknown ttype {:?} treated as empty set", ttype);
            return Ok(TrefSet::empty());
        }
        Ok(TrefSet::from_vec(ctx.view.all_of_type(ttype)))
    }

    /// Neighbor expansion; partitioned above the threshold.
    fn traverse(
        &self,
        input: TrefSet,
        ctx: &ExecContext<'_>,
    ) -> Result<TrefSet, ExecutionError> {
        let trefs = input.into_sorted_vec();
        let view = ctx.view;
        if trefs.len() < self.parallel_threshold {
            let mut out: HashSet<TagRef> = HashSet::new();
            for (i, tref) in trefs.iter().enumerate() {
                if i % PARTITION_CHUNK == 0 {
                    ctx.check_cancel()?;
                }
                out.extend(view.neighbors(*tref));
            }
            return Ok(TrefSet::from_hash(out));
        }

        let cancel = ctx.cancel;
        let partials: Vec<HashSet<TagRef>> = self.pool.install(|| {
            trefs
                .par_chunks(PARTITION_CHUNK)
                .map(|chunk| {
                    if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                        return HashSet::new();
                    }
                    let mut local = HashSet::new();
                    for tref in chunk {
                        local.extend(view.neighbors(*tref));
                    }
                    local
                })
                .collect()
        });
        ctx.check_cancel()?;
        let mut out = HashSet::new();
        for partial in partials {
            out.extend(partial);
        }
        Ok(TrefSet::from_hash(out))
    }

    /// Hash-probe intersection: the larger side is partitioned, each worker
    /// probes the smaller side's hash set and emits a local result.
    fn intersect(
        &self,
        left: TrefSet,
        right: TrefSet,
        ctx: &ExecContext<'_>,
    ) -> Result<TrefSet, ExecutionError> {
        let (large, small) = if left.len() >= right.len() {
            (left, right)
        } else {
            (right, left)
        };
        let probe = small.to_hash();
        let large = large.into_sorted_vec();

        if large.len() < self.parallel_threshold {
            return Ok(TrefSet::from_vec(
                large.into_iter().filter(|t| probe.contains(t)).collect(),
            ));
        }

        let cancel = ctx.cancel;
        let locals: Vec<Vec<TagRef>> = self.pool.install(|| {
            large
                .par_chunks(PARTITION_CHUNK)
                .map(|chunk| {
                    if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                        return Vec::new();
                    }
                    chunk
                        .iter()
                        .filter(|t| probe.contains(t))
                        .copied()
                        .collect()
                })
                .collect()
        });
        ctx.check_cancel()?;
        Ok(TrefSet::from_vec(locals.into_iter().flatten().collect()))
    }

    /// Keep the trefs for which the predicate holds. Partitioned above the
    /// threshold; each worker compiles its own regexes.
    fn retain<F>(
        &self,
        input: TrefSet,
        ctx: &mut ExecContext<'_>,
        test: F,
    ) -> Result<TrefSet, ExecutionError>
    where
        F: Fn(TagRef, &mut functions::RegexCache) -> Result<bool, FunctionError> + Sync,
    {
        let trefs = input.into_sorted_vec();
        if trefs.len() < self.parallel_threshold {
            let mut out = Vec::new();
            for (i, tref) in trefs.into_iter().enumerate() {
                if i % PARTITION_CHUNK == 0 {
                    ctx.check_cancel()?;
                }
                if test(tref, &mut ctx.regexes)? {
                    out.push(tref);
                }
            }
            return Ok(TrefSet::from_vec(out));
        }

        let cancel = ctx.cancel;
        let locals: Vec<Result<Vec<TagRef>, FunctionError>> = self.pool.install(|| {
            trefs
                .par_chunks(PARTITION_CHUNK)
                .map(|chunk| {
                    let mut regexes = functions::RegexCache::new();
                    let mut local = Vec::new();
                    if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                        return Ok(local);
                    }
                    for tref in chunk {
                        if test(*tref, &mut regexes)? {
                            local.push(*tref);
                        }
                    }
                    Ok(local)
                })
                .collect()
        });
        ctx.check_cancel()?;
        let mut out = Vec::new();
        for local in locals {
            out.extend(local?);
        }
        Ok(TrefSet::from_vec(out))
    }

    /// Apply a predicate tree to a set. `And` chains thread the set through
    /// each conjunct in order (selectors reduce the set where they stand);
    /// `Or` branches are per-tag and union their matches.
    fn apply_pred(
        &self,
        input: TrefSet,
        pred: &Pred,
        ctx: &mut ExecContext<'_>,
    ) -> Result<TrefSet, ExecutionError> {
        match pred {
            Pred::Const(true) => Ok(input),
            Pred::Const(false) => Ok(TrefSet::empty()),
            Pred::And(children) => {
                let mut current = input;
                for child in children {
                    current = self.apply_pred(current, child, ctx)?;
                    if current.is_empty() {
                        break;
                    }
                }
                Ok(current)
            }
            Pred::Call(call) if is_selector(call.name.as_str()) => {
                let view = ctx.view;
                let items: Vec<(TagRef, String)> = input
                    .into_sorted_vec()
                    .into_iter()
                    .filter_map(|tref| {
                        view.ident(tref).map(|(_, val)| (tref, val.to_string()))
                    })
                    .collect();
                let kept = functions::eval_selector(call, &items)?;
                Ok(TrefSet::from_vec(kept))
            }
            per_tag => {
                let view = ctx.view;
                self.retain(input, ctx, move |tref, regexes| {
                    let val = match view.ident(tref) {
                        Some((_, val)) => val,
                        None => return Ok(false),
                    };
                    eval_per_tag(per_tag, val, regexes)
                })
            }
        }
    }
}

fn is_selector(name: &str) -> bool {
    functions::lookup(name)
        .map(|b| b.kind == FunctionKind::Selector)
        .unwrap_or(false)
}

/// Per-tag predicate evaluation (no selectors below this point; the parser
/// rejects selectors inside `or`, and `And` is handled set-wise above).
fn eval_per_tag(
    pred: &Pred,
    val: &str,
    regexes: &mut functions::RegexCache,
) -> Result<bool, FunctionError> {
    match pred {
        Pred::Const(b) => Ok(*b),
        Pred::Compare { op, rhs } => eval_compare(*op, rhs, val, regexes),
        Pred::Call(call) => functions::eval_predicate(call, val, regexes),
        Pred::And(children) => {
            for child in children {
                if !eval_per_tag(child, val, regexes)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Pred::Or(children) => {
            for child in children {
                if eval_per_tag(child, val, regexes)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn eval_compare(
    op: CmpOp,
    rhs: &CmpRhs,
    val: &str,
    _regexes: &mut functions::RegexCache,
) -> Result<bool, FunctionError> {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let rhs = match rhs {
                CmpRhs::Str(s) => s.as_str(),
                _ => return Ok(false),
            };
            Ok(if op == CmpOp::Eq {
                val == rhs
            } else {
                val != rhs
            })
        }
        ordered => {
            // The left operand is num(val); a non-numeric value filters out.
            let Some(lhs) = functions::parse_num(val) else {
                return Ok(false);
            };
            let rhs = match rhs {
                CmpRhs::Num(n) => Some(*n),
                CmpRhs::Call(call) => functions::eval_key(
                    &crate::ast::ast::Expr::Call(call.clone()),
                    val,
                )?
                .and_then(|v| v.as_num()),
                CmpRhs::Str(s) => functions::parse_num(s),
            };
            let Some(rhs) = rhs else {
                return Ok(false);
            };
            Ok(match ordered {
                CmpOp::Ge => lhs >= rhs,
                CmpOp::Gt => lhs > rhs,
                CmpOp::Le => lhs <= rhs,
                CmpOp::Lt => lhs < rhs,
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            })
        }
    }
}
