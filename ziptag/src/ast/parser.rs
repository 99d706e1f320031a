// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Parser for the pipeline query language
//!
//! Recursive descent over the token stream. A `let` prelude defines named
//! sub-pipes that are spliced into the main pipe where referenced, so the
//! planner never sees variables. Function names and arities are validated
//! here so unknown-function errors surface with a position and a hint.

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::functions::{self, FunctionKind};

use super::ast::*;
use super::lexer::{tokenize, Spanned, Token};

/// Parser error type
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("lex error at byte {position}: {message}")]
    Lex { position: usize, message: String },

    #[error("syntax error at byte {position}: {message} ({suggestion})")]
    Syntax {
        position: usize,
        message: String,
        suggestion: String,
    },

    #[error("unknown function {name:?} at byte {position}; did you mean {suggestion:?}?")]
    UnknownFunction {
        name: String,
        position: usize,
        suggestion: String,
    },
}

impl ParserError {
    pub fn position(&self) -> usize {
        match self {
            ParserError::Lex { position, .. }
            | ParserError::Syntax { position, .. }
            | ParserError::UnknownFunction { position, .. } => *position,
        }
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            ParserError::Lex { .. } => None,
            ParserError::Syntax { suggestion, .. }
            | ParserError::UnknownFunction { suggestion, .. } => Some(suggestion),
        }
    }
}

/// Parse a query (optionally preceded by a `let` prelude) into an AST.
pub fn parse_query(input: &str) -> Result<Query, ParserError> {
    let tokens = tokenize(input).map_err(|(position, message)| ParserError::Lex {
        position,
        message,
    })?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        vars: HashMap::new(),
    };
    let query = parser.parse_document()?;
    debug!(
        "parsed query: {} overlay stmts, {} steps",
        query.overlay.len(),
        query.steps.len()
    );
    Ok(query)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    vars: HashMap<String, Vec<Step>>,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].0
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].0.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn syntax(&self, message: impl Into<String>, suggestion: impl Into<String>) -> ParserError {
        ParserError::Syntax {
            position: self.offset(),
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    fn expect(&mut self, expected: &Token, context: &str) -> Result<(), ParserError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.syntax(
                format!("expected {} but found {}", expected.describe(), self.peek().describe()),
                context.to_string(),
            ))
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<String, ParserError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.syntax(
                format!("expected an identifier but found {}", other.describe()),
                context.to_string(),
            )),
        }
    }

    fn expect_string(&mut self, context: &str) -> Result<String, ParserError> {
        match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                Ok(s)
            }
            other => Err(self.syntax(
                format!("expected a string but found {}", other.describe()),
                context.to_string(),
            )),
        }
    }

    fn parse_document(&mut self) -> Result<Query, ParserError> {
        while matches!(self.peek(), Token::Let) {
            self.parse_let()?;
        }
        let query = self.parse_main_query(true)?;
        if !matches!(self.peek(), Token::Eof) {
            return Err(self.syntax(
                format!("unexpected {} after query", self.peek().describe()),
                "remove trailing input or join it with '>'",
            ));
        }
        Ok(query)
    }

    fn parse_let(&mut self) -> Result<(), ParserError> {
        self.expect(&Token::Let, "let NAME = ( | step > ... )")?;
        let name = self.expect_ident("let NAME = ( ... )")?;
        self.expect(&Token::Assign, "let NAME = ( ... )")?;
        self.expect(&Token::LParen, "let NAME = ( ... )")?;
        let sub = self.parse_main_query(false)?;
        self.expect(&Token::RParen, "close the let body with ')'")?;
        self.vars.insert(name, sub.steps);
        Ok(())
    }

    fn parse_main_query(&mut self, allow_overlay: bool) -> Result<Query, ParserError> {
        let overlay = if matches!(self.peek(), Token::With) {
            if !allow_overlay {
                return Err(self.syntax(
                    "overlay blocks are not allowed inside let definitions",
                    "move the 'with { ... }' block to the main query",
                ));
            }
            self.advance();
            self.parse_overlay_block()?
        } else {
            Vec::new()
        };

        self.expect(&Token::Pipe, "queries start with '|'")?;
        let mut steps = Vec::new();
        self.parse_step_into(&mut steps)?;
        while matches!(self.peek(), Token::Gt) {
            self.advance();
            self.parse_step_into(&mut steps)?;
        }
        Ok(Query { overlay, steps })
    }

    /// Parse one step, splicing variable references in place.
    fn parse_step_into(&mut self, steps: &mut Vec<Step>) -> Result<(), ParserError> {
        match self.peek().clone() {
            Token::Star => {
                self.advance();
                steps.push(Step::Any);
                Ok(())
            }
            // A bare predicate is a filter-only step: it narrows the current
            // result set without traversing.
            Token::Ident(name)
                if matches!(self.peek_at(1), Token::LParen)
                    && functions::lookup(&name).is_some() =>
            {
                let call = self.parse_funcall(true)?;
                steps.push(Step::Filter(Filter::Call(call)));
                Ok(())
            }
            Token::EqEq | Token::NotEq => {
                steps.push(Step::Filter(self.parse_eq_compare()?));
                Ok(())
            }
            Token::Gte | Token::Lte | Token::Lt => {
                steps.push(Step::Filter(self.parse_num_compare()?));
                Ok(())
            }
            Token::LParen => {
                self.advance();
                let filter = self.parse_disjunction()?;
                self.expect(&Token::RParen, "close the filter group with ')'")?;
                self.check_selector_placement(&filter)?;
                steps.push(Step::Filter(filter));
                Ok(())
            }
            Token::Ident(name) => {
                self.advance();
                let filter = self.parse_value_filter()?;
                if filter.is_none() {
                    if let Some(sub) = self.vars.get(&name) {
                        steps.extend(sub.iter().cloned());
                        return Ok(());
                    }
                }
                if name.len() > 64 {
                    return Err(self.syntax(
                        format!("ttype {:?} exceeds 64 characters", name),
                        "shorten the ttype name",
                    ));
                }
                steps.push(Step::Type { ttype: name, filter });
                Ok(())
            }
            other => Err(self.syntax(
                format!("expected a step but found {}", other.describe()),
                "a step is a ttype, '*', or a let-bound name",
            )),
        }
    }

    /// Optional value filter following a type filter.
    fn parse_value_filter(&mut self) -> Result<Option<Filter>, ParserError> {
        match self.peek().clone() {
            Token::EqEq | Token::NotEq => Ok(Some(self.parse_eq_compare()?)),
            Token::Gte | Token::Lte | Token::Lt => Ok(Some(self.parse_num_compare()?)),
            // '>' doubles as the step separator; it is a comparator only
            // when a number follows.
            Token::Gt if matches!(self.peek_at(1), Token::Num(_)) => {
                Ok(Some(self.parse_num_compare()?))
            }
            Token::Ident(_) if matches!(self.peek_at(1), Token::LParen) => {
                let call = self.parse_funcall(true)?;
                Ok(Some(Filter::Call(call)))
            }
            Token::LParen => {
                self.advance();
                let filter = self.parse_disjunction()?;
                self.expect(&Token::RParen, "close the filter group with ')'")?;
                self.check_selector_placement(&filter)?;
                Ok(Some(filter))
            }
            _ => Ok(None),
        }
    }

    fn parse_eq_compare(&mut self) -> Result<Filter, ParserError> {
        let op = match self.advance() {
            Token::EqEq => CmpOp::Eq,
            Token::NotEq => CmpOp::Ne,
            _ => unreachable!("caller checked the operator token"),
        };
        let rhs = self.expect_string("equality compares against a string literal")?;
        Ok(Filter::Compare {
            op,
            rhs: CmpRhs::Str(rhs),
        })
    }

    fn parse_num_compare(&mut self) -> Result<Filter, ParserError> {
        let op = match self.advance() {
            Token::Gte => CmpOp::Ge,
            Token::Gt => CmpOp::Gt,
            Token::Lte => CmpOp::Le,
            Token::Lt => CmpOp::Lt,
            _ => unreachable!("caller checked the operator token"),
        };
        let rhs = match self.peek().clone() {
            Token::Num(n) => {
                self.advance();
                CmpRhs::Num(n)
            }
            Token::Ident(_) if matches!(self.peek_at(1), Token::LParen) => {
                CmpRhs::Call(self.parse_funcall(false)?)
            }
            other => {
                return Err(self.syntax(
                    format!(
                        "expected a number or key function after {:?} but found {}",
                        op.symbol(),
                        other.describe()
                    ),
                    "numeric comparators apply to num(val)",
                ))
            }
        };
        Ok(Filter::Compare { op, rhs })
    }

    fn parse_disjunction(&mut self) -> Result<Filter, ParserError> {
        let mut left = self.parse_conjunction()?;
        while matches!(self.peek(), Token::Or) {
            self.advance();
            let right = self.parse_conjunction()?;
            left = Filter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_conjunction(&mut self) -> Result<Filter, ParserError> {
        let mut left = self.parse_predicate()?;
        while matches!(self.peek(), Token::And) {
            self.advance();
            let right = self.parse_predicate()?;
            left = Filter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_predicate(&mut self) -> Result<Filter, ParserError> {
        match self.peek().clone() {
            Token::EqEq | Token::NotEq => self.parse_eq_compare(),
            Token::Gte | Token::Lte | Token::Lt | Token::Gt => self.parse_num_compare(),
            Token::Ident(_) if matches!(self.peek_at(1), Token::LParen) => {
                Ok(Filter::Call(self.parse_funcall(true)?))
            }
            other => Err(self.syntax(
                format!("expected a predicate but found {}", other.describe()),
                "predicates are comparisons or function calls",
            )),
        }
    }

    /// Parse and validate a function call. `predicate_position` is true when
    /// the call stands alone as a filter (key functions are rejected there).
    fn parse_funcall(&mut self, predicate_position: bool) -> Result<FunCall, ParserError> {
        let name_offset = self.offset();
        let name = self.expect_ident("function call")?;
        let builtin = functions::lookup(&name).ok_or_else(|| ParserError::UnknownFunction {
            name: name.clone(),
            position: name_offset,
            suggestion: functions::suggest(&name).to_string(),
        })?;

        self.expect(&Token::LParen, "function arguments")?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            args.push(self.parse_expr()?);
            while matches!(self.peek(), Token::Comma) {
                self.advance();
                args.push(self.parse_expr()?);
            }
        }
        self.expect(&Token::RParen, "close the argument list with ')'")?;

        if args.len() < builtin.min_args || args.len() > builtin.max_args {
            return Err(ParserError::Syntax {
                position: name_offset,
                message: format!(
                    "{} takes {}..={} arguments, got {}",
                    name, builtin.min_args, builtin.max_args, args.len()
                ),
                suggestion: builtin.description.to_string(),
            });
        }
        if predicate_position && builtin.kind == FunctionKind::Key {
            return Err(ParserError::Syntax {
                position: name_offset,
                message: format!("{} is a key function, not a predicate", name),
                suggestion: "use it inside a comparison, top(), or match_first()".to_string(),
            });
        }
        if builtin.name == "regex" {
            if let Some(Expr::Str(pattern)) = args.first() {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(ParserError::Syntax {
                        position: name_offset,
                        message: format!("invalid regular expression {:?}: {}", pattern, e),
                        suggestion: "fix the pattern syntax".to_string(),
                    });
                }
            }
        }
        if builtin.name == "top" {
            if !matches!(args.first(), Some(Expr::Num(n)) if *n >= 0.0 && n.fract() == 0.0) {
                return Err(ParserError::Syntax {
                    position: name_offset,
                    message: "top() requires a non-negative integer count".to_string(),
                    suggestion: "e.g. top(5) or top(5, num)".to_string(),
                });
            }
        }
        Ok(FunCall { name, args })
    }

    fn parse_expr(&mut self) -> Result<Expr, ParserError> {
        match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::Num(n) => {
                self.advance();
                Ok(Expr::Num(n))
            }
            Token::Ident(name) => {
                if matches!(self.peek_at(1), Token::LParen) {
                    Ok(Expr::Call(self.parse_funcall(false)?))
                } else {
                    let offset = self.offset();
                    self.advance();
                    if functions::lookup(&name).is_none() {
                        return Err(ParserError::UnknownFunction {
                            suggestion: functions::suggest(&name).to_string(),
                            name,
                            position: offset,
                        });
                    }
                    Ok(Expr::Name(name))
                }
            }
            other => Err(self.syntax(
                format!("expected an argument but found {}", other.describe()),
                "arguments are strings, numbers, or function references",
            )),
        }
    }

    /// Selectors reduce whole sets; a disjunction branch has no set of its
    /// own, so they may only appear in plain conjunctions.
    fn check_selector_placement(&self, filter: &Filter) -> Result<(), ParserError> {
        fn has_selector(filter: &Filter) -> bool {
            match filter {
                Filter::Call(call) => functions::lookup(&call.name)
                    .map(|b| b.kind == FunctionKind::Selector)
                    .unwrap_or(false),
                Filter::And(a, b) => has_selector(a) || has_selector(b),
                Filter::Or(a, b) => has_selector(a) || has_selector(b),
                Filter::Compare { .. } => false,
            }
        }
        fn or_contains_selector(filter: &Filter) -> bool {
            match filter {
                Filter::Or(a, b) => has_selector(a) || has_selector(b),
                Filter::And(a, b) => or_contains_selector(a) || or_contains_selector(b),
                _ => false,
            }
        }
        if or_contains_selector(filter) {
            return Err(self.syntax(
                "selectors like top() cannot appear inside 'or'",
                "apply the selector after the disjunction, e.g. (a or b) and top(3)",
            ));
        }
        Ok(())
    }

    fn parse_overlay_block(&mut self) -> Result<Vec<OverlayStmt>, ParserError> {
        self.expect(&Token::LBrace, "overlay blocks are '{ stmt; ... }'")?;
        let mut stmts = Vec::new();
        loop {
            if matches!(self.peek(), Token::RBrace) {
                self.advance();
                break;
            }
            stmts.push(self.parse_overlay_stmt()?);
            match self.peek() {
                Token::Semicolon => {
                    self.advance();
                }
                Token::RBrace => {
                    self.advance();
                    break;
                }
                other => {
                    return Err(self.syntax(
                        format!("expected ';' or '}}' but found {}", other.describe()),
                        "separate overlay statements with ';'",
                    ))
                }
            }
        }
        Ok(stmts)
    }

    fn parse_overlay_stmt(&mut self) -> Result<OverlayStmt, ParserError> {
        match self.peek().clone() {
            Token::AddTag => {
                self.advance();
                self.expect(&Token::LParen, "+tag(ttype, \"value\")")?;
                let ttype = self.expect_ident("+tag(ttype, \"value\")")?;
                self.expect(&Token::Comma, "+tag(ttype, \"value\")")?;
                let val = self.expect_string("+tag(ttype, \"value\")")?;
                self.expect(&Token::RParen, "+tag(ttype, \"value\")")?;
                let alias = if matches!(self.peek(), Token::As) {
                    self.advance();
                    Some(self.expect_ident("+tag(...) as name")?)
                } else {
                    None
                };
                Ok(OverlayStmt::AddTag { ttype, val, alias })
            }
            Token::RemTag => {
                self.advance();
                self.expect(&Token::LParen, "-tag(ttype, \"value\")")?;
                let ttype = self.expect_ident("-tag(ttype, \"value\")")?;
                self.expect(&Token::Comma, "-tag(ttype, \"value\")")?;
                let val = self.expect_string("-tag(ttype, \"value\")")?;
                self.expect(&Token::RParen, "-tag(ttype, \"value\")")?;
                Ok(OverlayStmt::RemTag { ttype, val })
            }
            Token::Link | Token::Unlink => {
                let is_link = matches!(self.advance(), Token::Link);
                self.expect(&Token::LParen, "link(ref, ref)")?;
                let a = self.parse_overlay_ref()?;
                self.expect(&Token::Comma, "link(ref, ref)")?;
                let b = self.parse_overlay_ref()?;
                self.expect(&Token::RParen, "link(ref, ref)")?;
                Ok(if is_link {
                    OverlayStmt::Link { a, b }
                } else {
                    OverlayStmt::Unlink { a, b }
                })
            }
            other => Err(self.syntax(
                format!("expected an overlay statement but found {}", other.describe()),
                "overlay statements are +tag, -tag, link, unlink",
            )),
        }
    }

    fn parse_overlay_ref(&mut self) -> Result<OverlayRef, ParserError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(OverlayRef::Alias(name))
            }
            Token::LParen => {
                self.advance();
                let ttype = self.expect_ident("(ttype, \"value\") reference")?;
                self.expect(&Token::Comma, "(ttype, \"value\") reference")?;
                let val = self.expect_string("(ttype, \"value\") reference")?;
                self.expect(&Token::RParen, "(ttype, \"value\") reference")?;
                Ok(OverlayRef::Identity { ttype, val })
            }
            other => Err(self.syntax(
                format!("expected a tag reference but found {}", other.describe()),
                "references are an alias name or (ttype, \"value\")",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_pipe() {
        let q = parse_query("| person == \"ada\" > rel == \"speaks\" > language").unwrap();
        assert!(q.overlay.is_empty());
        assert_eq!(q.steps.len(), 3);
        assert_eq!(
            q.steps[0],
            Step::Type {
                ttype: "person".into(),
                filter: Some(Filter::Compare {
                    op: CmpOp::Eq,
                    rhs: CmpRhs::Str("ada".into()),
                }),
            }
        );
        assert_eq!(
            q.steps[2],
            Step::Type {
                ttype: "language".into(),
                filter: None,
            }
        );
    }

    #[test]
    fn test_star_step_and_numeric_compare() {
        let q = parse_query("| metric >= 10 > * > sample > 3").unwrap();
        assert_eq!(q.steps.len(), 3);
        assert_eq!(
            q.steps[2],
            Step::Type {
                ttype: "sample".into(),
                filter: Some(Filter::Compare {
                    op: CmpOp::Gt,
                    rhs: CmpRhs::Num(3.0),
                }),
            }
        );
    }

    #[test]
    fn test_group_filter() {
        let q = parse_query("| x (startswith(\"a\") or == \"b\") > y").unwrap();
        match &q.steps[0] {
            Step::Type {
                filter: Some(Filter::Or(_, _)),
                ..
            } => {}
            other => panic!("expected or-filter, got {:?}", other),
        }
    }

    #[test]
    fn test_let_splice() {
        let q = parse_query("let who = (| person == \"ada\") | who > language").unwrap();
        assert_eq!(q.steps.len(), 2);
        assert!(matches!(&q.steps[0], Step::Type { ttype, .. } if ttype == "person"));
    }

    #[test]
    fn test_filter_only_step() {
        let q = parse_query(r#"| y > x > startswith("a")"#).unwrap();
        assert_eq!(q.steps.len(), 3);
        assert!(matches!(q.steps[2], Step::Filter(Filter::Call(_))));

        let q = parse_query(r#"| x > (== "a" or == "b")"#).unwrap();
        assert_eq!(q.steps.len(), 2);
        assert!(matches!(q.steps[1], Step::Filter(Filter::Or(_, _))));
    }

    #[test]
    fn test_overlay_block() {
        let q = parse_query(
            "with { +tag(rel, \"excludes\") as x; link(x, (provider, \"azure\")); } | provider",
        )
        .unwrap();
        assert_eq!(q.overlay.len(), 2);
        assert_eq!(
            q.overlay[0],
            OverlayStmt::AddTag {
                ttype: "rel".into(),
                val: "excludes".into(),
                alias: Some("x".into()),
            }
        );
    }

    #[test]
    fn test_unknown_function_has_hint() {
        let err = parse_query("| x startwith(\"a\")").unwrap_err();
        match err {
            ParserError::UnknownFunction { suggestion, .. } => {
                assert_eq!(suggestion, "startswith")
            }
            other => panic!("expected unknown function error, got {:?}", other),
        }
    }

    #[test]
    fn test_arity_error() {
        let err = parse_query("| x startswith()").unwrap_err();
        assert!(matches!(err, ParserError::Syntax { .. }));
    }

    #[test]
    fn test_bad_regex_rejected_at_parse() {
        let err = parse_query("| x regex(\"(unclosed\")").unwrap_err();
        assert!(matches!(err, ParserError::Syntax { .. }));
    }

    #[test]
    fn test_selector_inside_or_rejected() {
        let err = parse_query("| x (top(3) or == \"a\")").unwrap_err();
        assert!(matches!(err, ParserError::Syntax { .. }));
    }

    #[test]
    fn test_syntax_error_carries_position() {
        let err = parse_query("| person >").unwrap_err();
        assert!(err.position() > 0);
        assert!(err.suggestion().is_some());
    }
}
