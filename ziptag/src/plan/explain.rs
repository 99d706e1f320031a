// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Human-readable plan rendering

use crate::store::View;

use super::logical::{PlanOp, Pred};
use super::optimizer::estimate;

/// Render a plan as an indented operator tree with cardinality estimates
/// and memoization markers.
pub fn explain(op: &PlanOp, view: &View) -> String {
    let mut out = String::new();
    render(op, view, 0, &mut out);
    out
}

fn render(op: &PlanOp, view: &View, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let est = estimate(op, view);
    match op {
        PlanOp::Empty => {
            out.push_str(&format!("{}Empty\n", indent));
        }
        PlanOp::SourceAllOfType { ttype } => {
            out.push_str(&format!("{}SourceAllOfType {} (est {})\n", indent, ttype, est));
        }
        PlanOp::SourceByIdentity { ttype, val } => {
            out.push_str(&format!(
                "{}SourceByIdentity {}={:?} (est {})\n",
                indent, ttype, val, est
            ));
        }
        PlanOp::SourceAllTags => {
            out.push_str(&format!("{}SourceAllTags (est {})\n", indent, est));
        }
        PlanOp::Traverse { input } => {
            out.push_str(&format!("{}Traverse (est {})\n", indent, est));
            render(input, view, depth + 1, out);
        }
        PlanOp::FilterType { input, ttype } => {
            out.push_str(&format!("{}FilterType {} (est {})\n", indent, ttype, est));
            render(input, view, depth + 1, out);
        }
        PlanOp::FilterPredicate { input, pred } => {
            out.push_str(&format!(
                "{}FilterPredicate {} (est {})\n",
                indent,
                render_pred(pred),
                est
            ));
            render(input, view, depth + 1, out);
        }
        PlanOp::Intersect { left, right } => {
            out.push_str(&format!(
                "{}Intersect (est {}, smaller side first)\n",
                indent, est
            ));
            render(left, view, depth + 1, out);
            render(right, view, depth + 1, out);
        }
        PlanOp::Union { left, right } => {
            out.push_str(&format!("{}Union (est {})\n", indent, est));
            render(left, view, depth + 1, out);
            render(right, view, depth + 1, out);
        }
        PlanOp::Difference { left, right } => {
            out.push_str(&format!("{}Difference (est {})\n", indent, est));
            render(left, view, depth + 1, out);
            render(right, view, depth + 1, out);
        }
        PlanOp::Memo { digest, input } => {
            out.push_str(&format!(
                "{}Memo [{:016x}] (est {})\n",
                indent, digest, est
            ));
            render(input, view, depth + 1, out);
        }
    }
}

fn render_pred(pred: &Pred) -> String {
    match pred {
        Pred::Const(b) => format!("{}", b),
        Pred::Compare { op, rhs } => match rhs {
            crate::ast::ast::CmpRhs::Str(s) => format!("val {} {:?}", op.symbol(), s),
            crate::ast::ast::CmpRhs::Num(n) => format!("num(val) {} {}", op.symbol(), n),
            crate::ast::ast::CmpRhs::Call(call) => {
                format!("num(val) {} {}(...)", op.symbol(), call.name)
            }
        },
        Pred::Call(call) => format!("{}(...)", call.name),
        Pred::And(children) => {
            let parts: Vec<String> = children.iter().map(render_pred).collect();
            format!("({})", parts.join(" and "))
        }
        Pred::Or(children) => {
            let parts: Vec<String> = children.iter().map(render_pred).collect();
            format!("({})", parts.join(" or "))
        }
    }
}
