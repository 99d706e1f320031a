// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Runtime evaluation of the builtin functions

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::ast::ast::{Expr, FunCall};
use crate::store::TagRef;

static NUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?\d+(\.\d+)?$").expect("numeric pattern is valid"));

/// Function evaluation errors
#[derive(Error, Debug)]
pub enum FunctionError {
    #[error("unknown function: {0}")]
    Unknown(String),

    #[error("{0} is not usable as a predicate")]
    NotAPredicate(String),

    #[error("invalid regular expression {pattern:?}: {message}")]
    BadRegex { pattern: String, message: String },

    #[error("invalid argument to {func}: {message}")]
    BadArgument { func: String, message: String },
}

/// A key-function result.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncValue {
    Str(String),
    Num(f64),
}

impl FuncValue {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            FuncValue::Num(n) => Some(*n),
            FuncValue::Str(s) => parse_num(s),
        }
    }

    /// Stable string rendering for grouping keys.
    pub fn render(&self) -> String {
        match self {
            FuncValue::Str(s) => s.clone(),
            FuncValue::Num(n) => format!("{}", n),
        }
    }
}

/// Parse the numeric literal shape `[+-]?\d+(\.\d+)?`; anything else is None.
pub fn parse_num(s: &str) -> Option<f64> {
    if NUM_RE.is_match(s) {
        s.parse().ok()
    } else {
        None
    }
}

/// Per-query compiled-regex cache; patterns are compiled once per query.
#[derive(Default)]
pub struct RegexCache {
    compiled: HashMap<String, Regex>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, pattern: &str) -> Result<&Regex, FunctionError> {
        if !self.compiled.contains_key(pattern) {
            let regex = Regex::new(pattern).map_err(|e| FunctionError::BadRegex {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            self.compiled.insert(pattern.to_string(), regex);
        }
        Ok(&self.compiled[pattern])
    }
}

fn key_by_name(name: &str, val: &str) -> Result<Option<FuncValue>, FunctionError> {
    match name {
        "num" => Ok(parse_num(val).map(FuncValue::Num)),
        "len" => Ok(Some(FuncValue::Num(val.chars().count() as f64))),
        "lower" => Ok(Some(FuncValue::Str(val.to_lowercase()))),
        "upper" => Ok(Some(FuncValue::Str(val.to_uppercase()))),
        other => Err(FunctionError::Unknown(other.to_string())),
    }
}

/// Evaluate a key expression against a tag value. `None` means the tag has
/// no key (e.g. non-numeric under `num`) and is filtered out by the caller.
pub fn eval_key(expr: &Expr, val: &str) -> Result<Option<FuncValue>, FunctionError> {
    match expr {
        Expr::Str(s) => Ok(Some(FuncValue::Str(s.clone()))),
        Expr::Num(n) => Ok(Some(FuncValue::Num(*n))),
        Expr::Name(name) => key_by_name(name, val),
        Expr::Call(call) => match call.args.len() {
            0 => key_by_name(&call.name, val),
            1 => {
                // Applied to an explicit argument instead of the tag value.
                let inner = match eval_key(&call.args[0], val)? {
                    Some(v) => v.render(),
                    None => return Ok(None),
                };
                key_by_name(&call.name, &inner)
            }
            n => Err(FunctionError::BadArgument {
                func: call.name.clone(),
                message: format!("expected at most 1 argument, got {}", n),
            }),
        },
    }
}

fn string_arg(call: &FunCall, index: usize) -> Result<&str, FunctionError> {
    match call.args.get(index) {
        Some(Expr::Str(s)) => Ok(s),
        other => Err(FunctionError::BadArgument {
            func: call.name.clone(),
            message: format!("expected a string argument, got {:?}", other),
        }),
    }
}

fn inner_predicate(call: &FunCall) -> Result<FunCall, FunctionError> {
    match call.args.first() {
        Some(Expr::Call(inner)) => Ok(inner.clone()),
        Some(Expr::Name(name)) => Ok(FunCall {
            name: name.clone(),
            args: Vec::new(),
        }),
        other => Err(FunctionError::BadArgument {
            func: call.name.clone(),
            message: format!("expected a predicate argument, got {:?}", other),
        }),
    }
}

/// Evaluate a per-tag predicate call against a tag value.
pub fn eval_predicate(
    call: &FunCall,
    val: &str,
    regexes: &mut RegexCache,
) -> Result<bool, FunctionError> {
    match call.name.as_str() {
        "startswith" => {
            let prefix = string_arg(call, 0)?;
            Ok(val.starts_with(prefix))
        }
        "regex" => {
            let pattern = string_arg(call, 0)?;
            Ok(regexes.get(pattern)?.is_match(val))
        }
        "num" => Ok(parse_num(val).is_some()),
        "all" | "any" => Ok(true),
        "match" => {
            let inner = inner_predicate(call)?;
            eval_predicate(&inner, val, regexes)
        }
        "exclude" => {
            let inner = inner_predicate(call)?;
            Ok(!eval_predicate(&inner, val, regexes)?)
        }
        "len" | "lower" | "upper" => Err(FunctionError::NotAPredicate(call.name.clone())),
        other => Err(FunctionError::Unknown(other.to_string())),
    }
}

/// Sort key wrapper: numbers order before strings, ties break on tref asc.
fn rank(value: &FuncValue) -> (u8, f64, &str) {
    match value {
        FuncValue::Num(n) => (0, *n, ""),
        FuncValue::Str(s) => (1, 0.0, s.as_str()),
    }
}

/// Apply a set-level selector to `(tref, val)` pairs (any order). The
/// returned trefs are a subset of the input.
pub fn eval_selector(
    call: &FunCall,
    items: &[(TagRef, String)],
) -> Result<Vec<TagRef>, FunctionError> {
    match call.name.as_str() {
        "top" => {
            let n = match call.args.first() {
                Some(Expr::Num(n)) if *n >= 0.0 => *n as usize,
                other => {
                    return Err(FunctionError::BadArgument {
                        func: "top".into(),
                        message: format!("expected a non-negative count, got {:?}", other),
                    })
                }
            };
            match call.args.get(1) {
                Some(key_expr) => {
                    let mut keyed: Vec<(FuncValue, TagRef)> = Vec::with_capacity(items.len());
                    for (tref, val) in items {
                        if let Some(key) = eval_key(key_expr, val)? {
                            keyed.push((key, *tref));
                        }
                    }
                    // Largest key first; ties on ascending tref.
                    keyed.sort_by(|(ka, ta), (kb, tb)| {
                        let (ra, na, sa) = rank(ka);
                        let (rb, nb, sb) = rank(kb);
                        ra.cmp(&rb)
                            .then(nb.partial_cmp(&na).unwrap_or(std::cmp::Ordering::Equal))
                            .then(sb.cmp(sa))
                            .then(ta.cmp(tb))
                    });
                    Ok(keyed.into_iter().take(n).map(|(_, tref)| tref).collect())
                }
                None => {
                    let mut trefs: Vec<TagRef> = items.iter().map(|(t, _)| *t).collect();
                    trefs.sort_unstable();
                    trefs.truncate(n);
                    Ok(trefs)
                }
            }
        }
        "match_first" => {
            let key_expr = call.args.first().ok_or_else(|| FunctionError::BadArgument {
                func: "match_first".into(),
                message: "expected a key function".into(),
            })?;
            let mut sorted: Vec<&(TagRef, String)> = items.iter().collect();
            sorted.sort_unstable_by_key(|(tref, _)| *tref);
            let mut seen: HashSet<String> = HashSet::new();
            let mut out = Vec::new();
            for (tref, val) in sorted {
                if let Some(key) = eval_key(key_expr, val)? {
                    if seen.insert(key.render()) {
                        out.push(*tref);
                    }
                }
            }
            Ok(out)
        }
        other => Err(FunctionError::Unknown(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Expr>) -> FunCall {
        FunCall {
            name: name.into(),
            args,
        }
    }

    #[test]
    fn test_parse_num_shape() {
        assert_eq!(parse_num("42"), Some(42.0));
        assert_eq!(parse_num("-1.5"), Some(-1.5));
        assert_eq!(parse_num("+7"), Some(7.0));
        assert_eq!(parse_num("1.2.3"), None);
        assert_eq!(parse_num("abc"), None);
        assert_eq!(parse_num(""), None);
    }

    #[test]
    fn test_startswith_and_regex() {
        let mut regexes = RegexCache::new();
        let sw = call("startswith", vec![Expr::Str("py".into())]);
        assert!(eval_predicate(&sw, "python", &mut regexes).unwrap());
        assert!(!eval_predicate(&sw, "rust", &mut regexes).unwrap());

        let re = call("regex", vec![Expr::Str("^p.+n$".into())]);
        assert!(eval_predicate(&re, "python", &mut regexes).unwrap());
        assert!(!eval_predicate(&re, "perl", &mut regexes).unwrap());
    }

    #[test]
    fn test_match_and_exclude_nest() {
        let mut regexes = RegexCache::new();
        let m = call("match", vec![Expr::Name("num".into())]);
        assert!(eval_predicate(&m, "12", &mut regexes).unwrap());
        let ex = call("exclude", vec![Expr::Name("num".into())]);
        assert!(!eval_predicate(&ex, "12", &mut regexes).unwrap());
        assert!(eval_predicate(&ex, "ada", &mut regexes).unwrap());
    }

    #[test]
    fn test_top_default_takes_smallest_trefs() {
        let items: Vec<(TagRef, String)> = (1..=5)
            .map(|i| (TagRef::new(i), format!("v{}", i)))
            .collect();
        let sel = call("top", vec![Expr::Num(2.0)]);
        assert_eq!(
            eval_selector(&sel, &items).unwrap(),
            vec![TagRef::new(1), TagRef::new(2)]
        );
    }

    #[test]
    fn test_top_by_key_takes_largest() {
        let items = vec![
            (TagRef::new(1), "10".to_string()),
            (TagRef::new(2), "30".to_string()),
            (TagRef::new(3), "20".to_string()),
            (TagRef::new(4), "x".to_string()), // no numeric key, dropped
        ];
        let sel = call("top", vec![Expr::Num(2.0), Expr::Name("num".into())]);
        assert_eq!(
            eval_selector(&sel, &items).unwrap(),
            vec![TagRef::new(2), TagRef::new(3)]
        );
    }

    #[test]
    fn test_match_first_groups_by_key() {
        let items = vec![
            (TagRef::new(3), "Ada".to_string()),
            (TagRef::new(1), "ada".to_string()),
            (TagRef::new(2), "grace".to_string()),
        ];
        let sel = call("match_first", vec![Expr::Name("lower".into())]);
        // tref 1 wins the "ada" group because it is first in tref order.
        assert_eq!(
            eval_selector(&sel, &items).unwrap(),
            vec![TagRef::new(1), TagRef::new(2)]
        );
    }
}
