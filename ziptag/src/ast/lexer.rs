// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Lexer for the pipeline query language using nom parsers
//!
//! Tokens carry their byte offset in the input so parse errors can point at
//! the offending position. Every token parser either consumes input or
//! returns an error; the driver loop verifies forward progress.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, satisfy},
    combinator::{map, opt, recognize},
    sequence::{pair, tuple},
    IResult,
};

/// Token types for the pipeline query language
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    With,
    As,
    Let,
    And,
    Or,
    Link,
    Unlink,
    // Overlay operations
    AddTag, // '+tag'
    RemTag, // '-tag'
    // Punctuation
    Pipe,
    Gt,
    Gte,
    Lt,
    Lte,
    EqEq,
    NotEq,
    Assign,
    Star,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Semicolon,
    // Literals
    Ident(String),
    Str(String),
    Num(f64),
    Eof,
}

impl Token {
    /// Short description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier {:?}", name),
            Token::Str(s) => format!("string {:?}", s),
            Token::Num(n) => format!("number {}", n),
            Token::Eof => "end of input".to_string(),
            other => format!("{:?}", other),
        }
    }
}

/// A token plus its byte offset in the source.
pub type Spanned = (Token, usize);

fn identifier(input: &str) -> IResult<&str, Token> {
    map(
        recognize(pair(
            satisfy(|c| c.is_ascii_lowercase()),
            take_while(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'),
        )),
        |name: &str| match name {
            "with" => Token::With,
            "as" => Token::As,
            "let" => Token::Let,
            "and" => Token::And,
            "or" => Token::Or,
            "link" => Token::Link,
            "unlink" => Token::Unlink,
            other => Token::Ident(other.to_string()),
        },
    )(input)
}

fn number(input: &str) -> IResult<&str, Token> {
    map(
        recognize(tuple((
            opt(alt((char('+'), char('-')))),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        |text: &str| Token::Num(text.parse::<f64>().unwrap_or(0.0)),
    )(input)
}

/// Quoted string with standard escapes.
fn string_literal(input: &str) -> IResult<&str, Token> {
    let (rest, _) = char('"')(input)?;
    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&rest[i + 1..], Token::Str(out))),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, '"')) => out.push('"'),
                _ => {
                    return Err(nom::Err::Error(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::Escaped,
                    )))
                }
            },
            other => out.push(other),
        }
    }
    // Unterminated string.
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

fn operator(input: &str) -> IResult<&str, Token> {
    alt((
        map(tag("+tag"), |_| Token::AddTag),
        map(tag("-tag"), |_| Token::RemTag),
        map(tag("=="), |_| Token::EqEq),
        map(tag("!="), |_| Token::NotEq),
        map(tag(">="), |_| Token::Gte),
        map(tag("<="), |_| Token::Lte),
        map(tag(">"), |_| Token::Gt),
        map(tag("<"), |_| Token::Lt),
        map(tag("="), |_| Token::Assign),
        map(tag("|"), |_| Token::Pipe),
        map(tag("*"), |_| Token::Star),
        map(tag("{"), |_| Token::LBrace),
        map(tag("}"), |_| Token::RBrace),
        map(tag("("), |_| Token::LParen),
        map(tag(")"), |_| Token::RParen),
        map(tag(","), |_| Token::Comma),
        map(tag(";"), |_| Token::Semicolon),
    ))(input)
}

fn token(input: &str) -> IResult<&str, Token> {
    // Number before operator so a leading sign binds to the literal; string
    // and identifier cannot collide with either.
    alt((string_literal, number, operator, identifier))(input)
}

/// Tokenize the full input, attaching byte offsets.
pub fn tokenize(input: &str) -> Result<Vec<Spanned>, (usize, String)> {
    let mut tokens = Vec::new();
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            tokens.push((Token::Eof, input.len()));
            return Ok(tokens);
        }
        let offset = input.len() - trimmed.len();
        match token(trimmed) {
            Ok((after, tok)) => {
                // Guard against a parser that returns without consuming.
                if after.len() >= trimmed.len() {
                    return Err((offset, "lexer made no progress".to_string()));
                }
                tokens.push((tok, offset));
                rest = after;
            }
            Err(_) => {
                let snippet: String = trimmed.chars().take(12).collect();
                return Err((offset, format!("unrecognized input starting at {:?}", snippet)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_basic_pipe() {
        assert_eq!(
            kinds("| person == \"ada\" > language"),
            vec![
                Token::Pipe,
                Token::Ident("person".into()),
                Token::EqEq,
                Token::Str("ada".into()),
                Token::Gt,
                Token::Ident("language".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_overlay_tokens() {
        assert_eq!(
            kinds("with { +tag(rel, \"x\") as r; unlink(a, b); }"),
            vec![
                Token::With,
                Token::LBrace,
                Token::AddTag,
                Token::LParen,
                Token::Ident("rel".into()),
                Token::Comma,
                Token::Str("x".into()),
                Token::RParen,
                Token::As,
                Token::Ident("r".into()),
                Token::Semicolon,
                Token::Unlink,
                Token::LParen,
                Token::Ident("a".into()),
                Token::Comma,
                Token::Ident("b".into()),
                Token::RParen,
                Token::Semicolon,
                Token::RBrace,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n""#),
            vec![Token::Str("a\"b\n".into()), Token::Eof]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("top(3, -1.5)"),
            vec![
                Token::Ident("top".into()),
                Token::LParen,
                Token::Num(3.0),
                Token::Comma,
                Token::Num(-1.5),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_offsets_point_into_source() {
        let tokens = tokenize("| person").unwrap();
        assert_eq!(tokens[0].1, 0);
        assert_eq!(tokens[1].1, 2);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(tokenize("| person @@").is_err());
        assert!(tokenize("\"unterminated").is_err());
    }
}
