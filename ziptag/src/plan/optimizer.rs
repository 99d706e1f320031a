// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Plan simplification and join ordering
//!
//! Rewrite rules are applied bottom-up until the tree stops changing:
//! duplicate type-filter collapse, constant folding of predicates, identity
//! rewrites (an equality filter on `(ttype, val)` becomes a point source),
//! DNF expansion with a memo-shared input, empty-set propagation, and
//! ascending-cardinality ordering of intersection chains. A final pass wraps
//! repeated subtrees in `Memo` so the executor computes them once.

use std::collections::HashMap;

use log::debug;

use crate::ast::ast::{CmpOp, CmpRhs};
use crate::ast::Query;
use crate::functions::{self, FunctionKind};
use crate::store::View;

use super::logical::{lower, plan_digest, PlanOp, Pred};

const MAX_PASSES: usize = 8;
const MAX_DNF_DISJUNCTS: usize = 8;

/// Main query planner: lowers the AST and rewrites the plan.
#[derive(Debug, Default)]
pub struct QueryPlanner;

impl QueryPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan a parsed query against a view.
    pub fn plan(&self, query: &Query, view: &View) -> PlanOp {
        let lowered = lower(&query.steps);
        self.optimize(lowered, view)
    }

    /// Rewrite to fixed point, then insert memoization markers.
    pub fn optimize(&self, op: PlanOp, view: &View) -> PlanOp {
        let mut current = op;
        for pass in 0..MAX_PASSES {
            let next = rewrite(current.clone(), view);
            if next == current {
                debug!("plan stable after {} passes", pass);
                break;
            }
            current = next;
        }
        memoize_repeats(current)
    }
}

/// Cheap cardinality estimate for join ordering and explain output.
pub fn estimate(op: &PlanOp, view: &View) -> usize {
    match op {
        PlanOp::Empty => 0,
        PlanOp::SourceByIdentity { .. } => 1,
        PlanOp::SourceAllOfType { ttype } => view.type_cardinality(ttype),
        PlanOp::SourceAllTags => view
            .type_names()
            .iter()
            .map(|t| view.type_cardinality(t))
            .sum(),
        PlanOp::Traverse { input } | PlanOp::Memo { input, .. } => estimate(input, view),
        PlanOp::FilterType { input, ttype } => {
            estimate(input, view).min(view.type_cardinality(ttype))
        }
        PlanOp::FilterPredicate { input, .. } => estimate(input, view),
        PlanOp::Intersect { left, right } => estimate(left, view).min(estimate(right, view)),
        PlanOp::Union { left, right } => estimate(left, view) + estimate(right, view),
        PlanOp::Difference { left, .. } => estimate(left, view),
    }
}

fn rewrite(op: PlanOp, view: &View) -> PlanOp {
    match op {
        PlanOp::Traverse { input } => {
            let input = rewrite(*input, view);
            if input == PlanOp::Empty {
                PlanOp::Empty
            } else {
                PlanOp::Traverse {
                    input: input.boxed(),
                }
            }
        }
        PlanOp::FilterType { input, ttype } => rewrite_filter_type(rewrite(*input, view), ttype),
        PlanOp::FilterPredicate { input, pred } => {
            rewrite_filter_predicate(rewrite(*input, view), fold_pred(pred))
        }
        PlanOp::Intersect { left, right } => {
            let left = rewrite(*left, view);
            let right = rewrite(*right, view);
            if left == PlanOp::Empty || right == PlanOp::Empty {
                return PlanOp::Empty;
            }
            if left == right {
                return left;
            }
            order_intersection(left, right, view)
        }
        PlanOp::Union { left, right } => {
            let left = rewrite(*left, view);
            let right = rewrite(*right, view);
            if left == PlanOp::Empty {
                return right;
            }
            if right == PlanOp::Empty {
                return left;
            }
            if left == right {
                return left;
            }
            PlanOp::Union {
                left: left.boxed(),
                right: right.boxed(),
            }
        }
        PlanOp::Difference { left, right } => {
            let left = rewrite(*left, view);
            let right = rewrite(*right, view);
            if left == PlanOp::Empty {
                return PlanOp::Empty;
            }
            if right == PlanOp::Empty {
                return left;
            }
            PlanOp::Difference {
                left: left.boxed(),
                right: right.boxed(),
            }
        }
        PlanOp::Memo { digest, input } => {
            let input = rewrite(*input, view);
            if input == PlanOp::Empty {
                PlanOp::Empty
            } else {
                PlanOp::Memo {
                    digest,
                    input: input.boxed(),
                }
            }
        }
        leaf => leaf,
    }
}

/// Adjacent same-type filters collapse, including across an empty predicate.
fn rewrite_filter_type(input: PlanOp, ttype: String) -> PlanOp {
    match input {
        PlanOp::Empty => PlanOp::Empty,
        PlanOp::FilterType {
            input: inner,
            ttype: inner_ttype,
        } if inner_ttype == ttype => PlanOp::FilterType {
            input: inner,
            ttype,
        },
        PlanOp::FilterPredicate {
            input: inner,
            pred: Pred::Const(true),
        } => rewrite_filter_type(*inner, ttype),
        PlanOp::SourceAllOfType { ttype: source_ttype } if source_ttype == ttype => {
            PlanOp::SourceAllOfType { ttype }
        }
        other => PlanOp::FilterType {
            input: other.boxed(),
            ttype,
        },
    }
}

fn rewrite_filter_predicate(input: PlanOp, pred: Pred) -> PlanOp {
    if input == PlanOp::Empty {
        return PlanOp::Empty;
    }
    match &pred {
        Pred::Const(true) => return input,
        Pred::Const(false) => return PlanOp::Empty,
        _ => {}
    }

    // Equality on identity: replace the scan (and any traversal type filter)
    // with a point source, intersected with the traversal frontier.
    if let Some((val, rest)) = extract_eq_conjunct(&pred) {
        match input {
            PlanOp::SourceAllOfType { ttype } => {
                let source = PlanOp::SourceByIdentity { ttype, val };
                return rewrite_filter_predicate(source, rest);
            }
            PlanOp::FilterType { input: inner, ttype } => match *inner {
                PlanOp::Traverse { input: prev } => {
                    // Point source first: it is the smaller side.
                    let joined = PlanOp::Intersect {
                        left: PlanOp::SourceByIdentity { ttype, val }.boxed(),
                        right: PlanOp::Traverse { input: prev }.boxed(),
                    };
                    return rewrite_filter_predicate(joined, rest);
                }
                other => {
                    let restored = PlanOp::FilterType {
                        input: other.boxed(),
                        ttype,
                    };
                    return finish_filter_predicate(restored, pred);
                }
            },
            other => return finish_filter_predicate(other, pred),
        }
    }

    // A sole inequality becomes a set difference against the point source.
    if let Pred::Compare {
        op: CmpOp::Ne,
        rhs: CmpRhs::Str(val),
    } = &pred
    {
        let ttype = match &input {
            PlanOp::SourceAllOfType { ttype } => Some(ttype.clone()),
            PlanOp::FilterType { ttype, .. } => Some(ttype.clone()),
            _ => None,
        };
        if let Some(ttype) = ttype {
            return PlanOp::Difference {
                left: input.boxed(),
                right: PlanOp::SourceByIdentity {
                    ttype,
                    val: val.clone(),
                }
                .boxed(),
            };
        }
    }

    finish_filter_predicate(input, pred)
}

/// DNF expansion with a shared, memoized input; falls back to the plain
/// filter when the predicate has selectors or would blow up.
fn finish_filter_predicate(input: PlanOp, pred: Pred) -> PlanOp {
    if !matches!(input, PlanOp::Memo { .. }) && !pred_has_selector(&pred) {
        if let Some(disjuncts) = to_dnf(&pred) {
            if disjuncts.len() > 1 && disjuncts.len() <= MAX_DNF_DISJUNCTS {
                let shared = PlanOp::Memo {
                    digest: plan_digest(&input),
                    input: input.boxed(),
                };
                let mut branches = disjuncts.into_iter().map(|conjunct| PlanOp::FilterPredicate {
                    input: shared.clone().boxed(),
                    pred: fold_pred(Pred::And(conjunct)),
                });
                let first = branches.next().expect("at least two disjuncts");
                return branches.fold(first, |acc, branch| PlanOp::Union {
                    left: acc.boxed(),
                    right: branch.boxed(),
                });
            }
        }
    }
    PlanOp::FilterPredicate {
        input: input.boxed(),
        pred,
    }
}

/// Reorder an intersection chain by ascending cardinality estimate.
fn order_intersection(left: PlanOp, right: PlanOp, view: &View) -> PlanOp {
    let mut inputs = Vec::new();
    collect_intersect_chain(left, &mut inputs);
    collect_intersect_chain(right, &mut inputs);
    // Stable sort keyed by (estimate, digest) so re-planning is idempotent.
    inputs.sort_by_key(|op| (estimate(op, view), plan_digest(op)));
    inputs.dedup();
    let mut iter = inputs.into_iter();
    let first = iter.next().expect("intersection has at least one input");
    iter.fold(first, |acc, op| PlanOp::Intersect {
        left: acc.boxed(),
        right: op.boxed(),
    })
}

fn collect_intersect_chain(op: PlanOp, out: &mut Vec<PlanOp>) {
    match op {
        PlanOp::Intersect { left, right } => {
            collect_intersect_chain(*left, out);
            collect_intersect_chain(*right, out);
        }
        other => out.push(other),
    }
}

/// Constant folding over the predicate tree.
fn fold_pred(pred: Pred) -> Pred {
    match pred {
        Pred::Call(call) if matches!(call.name.as_str(), "all" | "any") => Pred::Const(true),
        Pred::And(children) => {
            let mut flat = Vec::new();
            for child in children {
                match fold_pred(child) {
                    Pred::Const(true) => {}
                    Pred::Const(false) => return Pred::Const(false),
                    Pred::And(nested) => flat.extend(nested),
                    other => flat.push(other),
                }
            }
            match flat.len() {
                0 => Pred::Const(true),
                1 => flat.into_iter().next().expect("length checked"),
                _ => Pred::And(flat),
            }
        }
        Pred::Or(children) => {
            let mut flat = Vec::new();
            for child in children {
                match fold_pred(child) {
                    Pred::Const(false) => {}
                    Pred::Const(true) => return Pred::Const(true),
                    Pred::Or(nested) => flat.extend(nested),
                    other => flat.push(other),
                }
            }
            match flat.len() {
                0 => Pred::Const(false),
                1 => flat.into_iter().next().expect("length checked"),
                _ => Pred::Or(flat),
            }
        }
        other => other,
    }
}

/// Pull the first top-level equality conjunct out of a predicate.
fn extract_eq_conjunct(pred: &Pred) -> Option<(String, Pred)> {
    match pred {
        Pred::Compare {
            op: CmpOp::Eq,
            rhs: CmpRhs::Str(val),
        } => Some((val.clone(), Pred::Const(true))),
        Pred::And(children) => {
            let index = children.iter().position(|c| {
                matches!(
                    c,
                    Pred::Compare {
                        op: CmpOp::Eq,
                        rhs: CmpRhs::Str(_),
                    }
                )
            })?;
            let val = match &children[index] {
                Pred::Compare {
                    rhs: CmpRhs::Str(val),
                    ..
                } => val.clone(),
                _ => unreachable!("position matched an equality"),
            };
            let rest: Vec<Pred> = children
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, c)| c.clone())
                .collect();
            Some((val, fold_pred(Pred::And(rest))))
        }
        _ => None,
    }
}

pub(crate) fn pred_has_selector(pred: &Pred) -> bool {
    match pred {
        Pred::Call(call) => functions::lookup(&call.name)
            .map(|b| b.kind == FunctionKind::Selector)
            .unwrap_or(false),
        Pred::And(children) | Pred::Or(children) => children.iter().any(pred_has_selector),
        _ => false,
    }
}

/// Disjunctive normal form as a list of conjunct lists; None when the
/// expansion would exceed the size bound.
fn to_dnf(pred: &Pred) -> Option<Vec<Vec<Pred>>> {
    match pred {
        Pred::And(children) => {
            let mut acc: Vec<Vec<Pred>> = vec![Vec::new()];
            for child in children {
                let child_dnf = to_dnf(child)?;
                let mut next = Vec::new();
                for prefix in &acc {
                    for disjunct in &child_dnf {
                        let mut merged = prefix.clone();
                        merged.extend(disjunct.iter().cloned());
                        next.push(merged);
                    }
                }
                if next.len() > MAX_DNF_DISJUNCTS {
                    return None;
                }
                acc = next;
            }
            Some(acc)
        }
        Pred::Or(children) => {
            let mut acc = Vec::new();
            for child in children {
                acc.extend(to_dnf(child)?);
            }
            if acc.len() > MAX_DNF_DISJUNCTS {
                None
            } else {
                Some(acc)
            }
        }
        atom => Some(vec![vec![atom.clone()]]),
    }
}

/// Wrap subtrees that occur more than once in `Memo`, sharing a digest so
/// the executor computes them a single time per query.
fn memoize_repeats(op: PlanOp) -> PlanOp {
    let mut counts: HashMap<u64, usize> = HashMap::new();
    count_subtrees(&op, &mut counts, false);
    wrap_repeats(op, &counts, false)
}

fn count_subtrees(op: &PlanOp, counts: &mut HashMap<u64, usize>, under_memo: bool) {
    if memo_eligible(op) && !under_memo {
        *counts.entry(plan_digest(op)).or_insert(0) += 1;
    }
    match op {
        PlanOp::Traverse { input }
        | PlanOp::FilterType { input, .. }
        | PlanOp::FilterPredicate { input, .. } => count_subtrees(input, counts, under_memo),
        // Everything beneath a Memo is already shared.
        PlanOp::Memo { input, .. } => count_subtrees(input, counts, true),
        PlanOp::Intersect { left, right }
        | PlanOp::Union { left, right }
        | PlanOp::Difference { left, right } => {
            count_subtrees(left, counts, under_memo);
            count_subtrees(right, counts, under_memo);
        }
        _ => {}
    }
}

fn wrap_repeats(op: PlanOp, counts: &HashMap<u64, usize>, under_memo: bool) -> PlanOp {
    let digest = if memo_eligible(&op) && !under_memo {
        Some(plan_digest(&op))
    } else {
        None
    };
    let rebuilt = match op {
        PlanOp::Traverse { input } => PlanOp::Traverse {
            input: wrap_repeats(*input, counts, under_memo).boxed(),
        },
        PlanOp::FilterType { input, ttype } => PlanOp::FilterType {
            input: wrap_repeats(*input, counts, under_memo).boxed(),
            ttype,
        },
        PlanOp::FilterPredicate { input, pred } => PlanOp::FilterPredicate {
            input: wrap_repeats(*input, counts, under_memo).boxed(),
            pred,
        },
        PlanOp::Memo { digest, input } => PlanOp::Memo {
            digest,
            input: wrap_repeats(*input, counts, true).boxed(),
        },
        PlanOp::Intersect { left, right } => PlanOp::Intersect {
            left: wrap_repeats(*left, counts, under_memo).boxed(),
            right: wrap_repeats(*right, counts, under_memo).boxed(),
        },
        PlanOp::Union { left, right } => PlanOp::Union {
            left: wrap_repeats(*left, counts, under_memo).boxed(),
            right: wrap_repeats(*right, counts, under_memo).boxed(),
        },
        PlanOp::Difference { left, right } => PlanOp::Difference {
            left: wrap_repeats(*left, counts, under_memo).boxed(),
            right: wrap_repeats(*right, counts, under_memo).boxed(),
        },
        leaf => leaf,
    };
    match digest {
        Some(d) if counts.get(&d).copied().unwrap_or(0) > 1 => PlanOp::Memo {
            digest: d,
            input: rebuilt.boxed(),
        },
        _ => rebuilt,
    }
}

/// Only subtrees that do real work are worth memoizing.
fn memo_eligible(op: &PlanOp) -> bool {
    matches!(
        op,
        PlanOp::Traverse { .. }
            | PlanOp::FilterType { .. }
            | PlanOp::FilterPredicate { .. }
            | PlanOp::Intersect { .. }
            | PlanOp::Union { .. }
            | PlanOp::Difference { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_query;
    use crate::exec::{ExecContext, Executor};
    use crate::plan::logical::lower;
    use crate::store::{ResolvedDelta, TagRef, TagStore};

    /// ada -(speaks)- python plus a handful of extra languages.
    fn sample_view() -> View {
        let store = TagStore::new();
        store.install_delta(
            &ResolvedDelta {
                new_tags: vec![
                    ("person".into(), "ada".into(), TagRef::new(1)),
                    ("rel".into(), "speaks".into(), TagRef::new(2)),
                    ("language".into(), "python".into(), TagRef::new(3)),
                    ("language".into(), "rust".into(), TagRef::new(4)),
                    ("language".into(), "perl".into(), TagRef::new(5)),
                ],
                added_links: vec![
                    (TagRef::new(1), TagRef::new(2)),
                    (TagRef::new(2), TagRef::new(3)),
                ],
                next_tref: 6,
                ..Default::default()
            },
            1,
        );
        View::of_generation(store.generation())
    }

    fn run(plan: &PlanOp, view: &View) -> Vec<TagRef> {
        let executor = Executor::new(1, 1024).expect("pool");
        let mut ctx = ExecContext::new(view, false, None, None);
        executor.run(plan, &mut ctx).expect("execution")
    }

    #[test]
    fn test_simplification_is_idempotent() {
        let view = sample_view();
        let planner = QueryPlanner::new();
        let queries = [
            "| person == \"ada\" > rel == \"speaks\" > language",
            "| language (startswith(\"p\") or == \"rust\")",
            "| language != \"perl\"",
            "| person > * > language",
        ];
        for query in queries {
            let ast = parse_query(query).expect("parse");
            let once = planner.plan(&ast, &view);
            let twice = planner.optimize(once.clone(), &view);
            assert_eq!(once, twice, "query {:?}", query);
        }
    }

    #[test]
    fn test_optimized_plan_matches_naive_results() {
        let view = sample_view();
        let planner = QueryPlanner::new();
        let queries = [
            "| person == \"ada\" > rel == \"speaks\" > language",
            "| language (startswith(\"p\") or == \"rust\")",
            "| language != \"perl\"",
            "| language (num() and >= 1)",
            "| person > rel > language",
            "| *",
        ];
        for query in queries {
            let ast = parse_query(query).expect("parse");
            let naive = lower(&ast.steps);
            let optimized = planner.plan(&ast, &view);
            assert_eq!(
                run(&naive, &view),
                run(&optimized, &view),
                "query {:?}: naive and optimized plans disagree",
                query
            );
        }
    }

    #[test]
    fn test_equality_becomes_point_source() {
        let view = sample_view();
        let planner = QueryPlanner::new();
        let ast = parse_query("| person == \"ada\"").expect("parse");
        let plan = planner.plan(&ast, &view);
        assert_eq!(
            plan,
            PlanOp::SourceByIdentity {
                ttype: "person".into(),
                val: "ada".into(),
            }
        );
    }

    #[test]
    fn test_intersections_ordered_small_first() {
        let view = sample_view();
        let planner = QueryPlanner::new();
        let big = PlanOp::SourceAllOfType {
            ttype: "language".into(),
        };
        let small = PlanOp::SourceByIdentity {
            ttype: "language".into(),
            val: "rust".into(),
        };
        let plan = planner.optimize(
            PlanOp::Intersect {
                left: big.clone().boxed(),
                right: small.clone().boxed(),
            },
            &view,
        );
        assert_eq!(
            plan,
            PlanOp::Intersect {
                left: small.boxed(),
                right: big.boxed(),
            }
        );
    }

    #[test]
    fn test_constant_folding() {
        let view = sample_view();
        let planner = QueryPlanner::new();
        let ast = parse_query("| language all()").expect("parse");
        let plan = planner.plan(&ast, &view);
        assert_eq!(
            plan,
            PlanOp::SourceAllOfType {
                ttype: "language".into(),
            }
        );
    }

    #[test]
    fn test_dnf_shares_input_through_memo() {
        let view = sample_view();
        let planner = QueryPlanner::new();
        let ast =
            parse_query("| language (startswith(\"p\") or == \"rust\")").expect("parse");
        let plan = planner.plan(&ast, &view);
        fn count_memos(op: &PlanOp) -> usize {
            match op {
                PlanOp::Memo { input, .. } => 1 + count_memos(input),
                PlanOp::Traverse { input }
                | PlanOp::FilterType { input, .. }
                | PlanOp::FilterPredicate { input, .. } => count_memos(input),
                PlanOp::Intersect { left, right }
                | PlanOp::Union { left, right }
                | PlanOp::Difference { left, right } => {
                    count_memos(left) + count_memos(right)
                }
                _ => 0,
            }
        }
        assert!(matches!(plan, PlanOp::Union { .. }), "plan: {:?}", plan);
        assert!(count_memos(&plan) >= 2, "plan: {:?}", plan);
    }

    #[test]
    fn test_duplicate_type_filters_collapse() {
        let view = sample_view();
        let planner = QueryPlanner::new();
        let doubled = PlanOp::FilterType {
            input: PlanOp::FilterType {
                input: PlanOp::SourceAllTags.boxed(),
                ttype: "language".into(),
            }
            .boxed(),
            ttype: "language".into(),
        };
        let plan = planner.optimize(doubled, &view);
        assert_eq!(
            plan,
            PlanOp::FilterType {
                input: PlanOp::SourceAllTags.boxed(),
                ttype: "language".into(),
            }
        );
    }

}
