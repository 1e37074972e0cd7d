// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! Filter expressions over version fields and labels.
//!
//! A small, safe expression language: no function calls, no attribute
//! access, only the grammar below over a fixed schema.
//!
//! ```text
//! expr    := or
//! or      := and ('or' and)*
//! and     := not ('and' not)*
//! not     := 'not' not | cmp
//! cmp     := primary ( ('==' | '!=' | '<' | '>' | '<=' | '>=' | 'like') primary )?
//! primary := 'True' | 'False' | INT | STR | IDENT | 'labels' '[' STR ']' | '(' expr ')'
//! ```
//!
//! Identifiers are restricted to the known version fields. `labels[name]`
//! used as a bare expression is true iff the label exists. `like` uses SQL
//! `%` wildcards. Date literals may be absolute RFC 3339 or relative English
//! such as `1 week ago`; comparisons against `date` coerce to UTC.

use std::fmt;

use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::errors::Error;
use crate::version::Version;
use crate::Result;

/// Version fields addressable from a filter expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Uid,
    Date,
    Volume,
    Snapshot,
    Size,
    BlockSize,
    Status,
    Protected,
    Storage,
}

impl Field {
    fn parse(name: &str) -> Option<Field> {
        match name {
            "uid" => Some(Field::Uid),
            "date" => Some(Field::Date),
            "volume" => Some(Field::Volume),
            "snapshot" => Some(Field::Snapshot),
            "size" => Some(Field::Size),
            "block_size" => Some(Field::BlockSize),
            "status" => Some(Field::Status),
            "protected" => Some(Field::Protected),
            "storage" => Some(Field::Storage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Like,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(Primary, CmpOp, Primary),
    Bare(Primary),
}

#[derive(Debug, Clone)]
pub enum Primary {
    Bool(bool),
    Int(i64),
    Str(String),
    Field(Field),
    Label(String),
    Paren(Box<Expr>),
}

/// Runtime value of a primary during evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    Date(OffsetDateTime),
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Op(CmpOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::Int(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Op(_) => write!(f, "comparison operator"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
        }
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidInput {
        reason: reason.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Eq));
                    i += 2;
                } else {
                    return Err(invalid("single '=' is not a valid operator, use '=='"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    return Err(invalid("unexpected '!'"));
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] as char != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(invalid("unterminated string literal"));
                }
                tokens.push(Token::Str(input[start..j].to_owned()));
                i = j + 1;
            }
            '0'..='9' | '-' => {
                let start = i;
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                let text = &input[start..j];
                let n = text
                    .parse::<i64>()
                    .map_err(|_| invalid(format!("invalid integer literal {:?}", text)))?;
                tokens.push(Token::Int(n));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i + 1;
                while j < bytes.len()
                    && ((bytes[j] as char).is_ascii_alphanumeric() || bytes[j] == b'_')
                {
                    j += 1;
                }
                tokens.push(Token::Ident(input[start..j].to_owned()));
                i = j;
            }
            other => return Err(invalid(format!("unexpected character {:?}", other))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(invalid(format!("expected {}, found {}", expected, token))),
            None => Err(invalid(format!("expected {}, found end of input", expected))),
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_ident("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_ident("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_ident("not") {
            Ok(Expr::Not(Box::new(self.not_expr()?)))
        } else {
            self.cmp_expr()
        }
    }

    fn cmp_expr(&mut self) -> Result<Expr> {
        let left = self.primary()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                op
            }
            Some(Token::Ident(s)) if s == "like" => {
                self.pos += 1;
                CmpOp::Like
            }
            _ => return Ok(Expr::Bare(left)),
        };
        let right = self.primary()?;
        Ok(Expr::Cmp(left, op, right))
    }

    fn primary(&mut self) -> Result<Primary> {
        match self.next() {
            Some(Token::Ident(name)) => match name.as_str() {
                "True" => Ok(Primary::Bool(true)),
                "False" => Ok(Primary::Bool(false)),
                "labels" => {
                    self.expect(Token::LBracket)?;
                    let label = match self.next() {
                        Some(Token::Str(s)) => s,
                        other => {
                            return Err(invalid(format!(
                                "labels[] requires a string, found {}",
                                other.map_or_else(|| "end of input".to_owned(), |t| t.to_string())
                            )))
                        }
                    };
                    self.expect(Token::RBracket)?;
                    Ok(Primary::Label(label))
                }
                other => Field::parse(other)
                    .map(Primary::Field)
                    .ok_or_else(|| invalid(format!("unknown identifier {:?}", other))),
            },
            Some(Token::Int(n)) => Ok(Primary::Int(n)),
            Some(Token::Str(s)) => Ok(Primary::Str(s)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(Primary::Paren(Box::new(inner)))
            }
            Some(token) => Err(invalid(format!("unexpected {}", token))),
            None => Err(invalid("unexpected end of input")),
        }
    }
}

/// A parsed filter expression.
#[derive(Debug, Clone)]
pub struct FilterExpression {
    root: Expr,
    now: OffsetDateTime,
}

impl FilterExpression {
    pub fn parse(input: &str) -> Result<FilterExpression> {
        FilterExpression::parse_at(input, OffsetDateTime::now_utc())
    }

    /// Parse with an explicit reference time for relative date literals.
    pub fn parse_at(input: &str, now: OffsetDateTime) -> Result<FilterExpression> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(invalid("empty filter expression"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "trailing input after expression: {}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(FilterExpression { root, now })
    }

    /// Evaluate against one version. `storage_name` is the resolved name of
    /// the version's storage.
    pub fn matches(&self, version: &Version, storage_name: &str) -> Result<bool> {
        eval_expr(&self.root, version, storage_name, self.now)
    }
}

fn eval_expr(
    expr: &Expr,
    version: &Version,
    storage_name: &str,
    now: OffsetDateTime,
) -> Result<bool> {
    match expr {
        Expr::Or(a, b) => Ok(eval_expr(a, version, storage_name, now)?
            || eval_expr(b, version, storage_name, now)?),
        Expr::And(a, b) => Ok(eval_expr(a, version, storage_name, now)?
            && eval_expr(b, version, storage_name, now)?),
        Expr::Not(inner) => Ok(!eval_expr(inner, version, storage_name, now)?),
        Expr::Cmp(left, op, right) => {
            let lv = eval_primary(left, version, storage_name, now)?;
            let rv = eval_primary(right, version, storage_name, now)?;
            compare(&lv, *op, &rv, now)
        }
        Expr::Bare(primary) => match eval_primary(primary, version, storage_name, now)? {
            Value::Bool(b) => Ok(b),
            // A bare label reference tests existence.
            Value::Missing => Ok(false),
            Value::Str(_) => Ok(true),
            other => Err(invalid(format!(
                "expression value {:?} is not a condition",
                other
            ))),
        },
    }
}

fn eval_primary(
    primary: &Primary,
    version: &Version,
    storage_name: &str,
    now: OffsetDateTime,
) -> Result<Value> {
    Ok(match primary {
        Primary::Bool(b) => Value::Bool(*b),
        Primary::Int(n) => Value::Int(*n),
        Primary::Str(s) => Value::Str(s.clone()),
        Primary::Field(field) => match field {
            Field::Uid => Value::Str(version.uid.to_string()),
            Field::Date => Value::Date(version.date),
            Field::Volume => Value::Str(version.volume.clone()),
            Field::Snapshot => Value::Str(version.snapshot.clone()),
            Field::Size => Value::Int(version.size as i64),
            Field::BlockSize => Value::Int(i64::from(version.block_size)),
            Field::Status => Value::Str(version.status.as_str().to_owned()),
            Field::Protected => Value::Bool(version.protected),
            Field::Storage => Value::Str(storage_name.to_owned()),
        },
        Primary::Label(name) => match version.labels.get(name) {
            Some(value) => Value::Str(value.clone()),
            None => Value::Missing,
        },
        Primary::Paren(inner) => Value::Bool(eval_expr(inner, version, storage_name, now)?),
    })
}

fn compare(left: &Value, op: CmpOp, right: &Value, now: OffsetDateTime) -> Result<bool> {
    use std::cmp::Ordering;

    if op == CmpOp::Like {
        let (Value::Str(l), Value::Str(r)) = (left, right) else {
            return Err(invalid("'like' requires string operands"));
        };
        return Ok(like_match(l, r));
    }

    // Coerce a string operand to a date when the other side is a date.
    let coerced;
    let (left, right) = match (left, right) {
        (Value::Date(_), Value::Str(s)) => {
            coerced = Value::Date(parse_date_literal(s, now)?);
            (left, &coerced)
        }
        (Value::Str(s), Value::Date(_)) => {
            coerced = Value::Date(parse_date_literal(s, now)?);
            (&coerced, right)
        }
        _ => (left, right),
    };

    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Date(a), Value::Date(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => {
            return match op {
                CmpOp::Eq => Ok(a == b),
                CmpOp::Ne => Ok(a != b),
                _ => Err(invalid("booleans only support == and !=")),
            };
        }
        (Value::Missing, _) | (_, Value::Missing) => {
            // A missing label never matches, except for explicit !=.
            return Ok(op == CmpOp::Ne);
        }
        (a, b) => {
            return Err(invalid(format!(
                "cannot compare {:?} with {:?}",
                a, b
            )));
        }
    };
    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Like => unreachable!(),
    })
}

/// SQL-style `like`: `%` matches any run of characters, everything else is
/// literal. Anchored at both ends.
fn like_match(text: &str, pattern: &str) -> bool {
    fn inner(text: &[u8], pattern: &[u8]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some(b'%') => {
                (0..=text.len()).any(|skip| inner(&text[skip..], &pattern[1..]))
            }
            Some(&c) => text.first() == Some(&c) && inner(&text[1..], &pattern[1..]),
        }
    }
    inner(text.as_bytes(), pattern.as_bytes())
}

/// Parse a date literal: absolute RFC 3339 or relative English such as
/// `1 week ago`. Relative months count 30 days, years 365.
pub fn parse_date_literal(s: &str, now: OffsetDateTime) -> Result<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(parsed.to_offset(time::UtcOffset::UTC));
    }
    let parts: Vec<&str> = s.split_whitespace().collect();
    if let [amount, unit, "ago"] = parts.as_slice() {
        let amount: i64 = amount
            .parse()
            .map_err(|_| invalid(format!("invalid relative date {:?}", s)))?;
        let unit = unit.strip_suffix('s').unwrap_or(unit);
        let delta = match unit {
            "second" => Duration::seconds(amount),
            "minute" => Duration::minutes(amount),
            "hour" => Duration::hours(amount),
            "day" => Duration::days(amount),
            "week" => Duration::weeks(amount),
            "month" => Duration::days(30 * amount),
            "year" => Duration::days(365 * amount),
            _ => return Err(invalid(format!("unknown time unit in {:?}", s))),
        };
        return Ok(now - delta);
    }
    Err(invalid(format!("invalid date literal {:?}", s)))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use time::macros::datetime;

    use super::*;
    use crate::version::{VersionStatus, VersionUid};

    fn sample_version() -> Version {
        let mut labels = BTreeMap::new();
        labels.insert("env".to_owned(), "prod".to_owned());
        Version {
            uid: VersionUid(3),
            date: datetime!(2024-05-01 12:00:00 UTC),
            volume: "vm-disk".to_owned(),
            snapshot: "snap-1".to_owned(),
            size: 12 * 1024 * 1024,
            block_size: 4 * 1024 * 1024,
            storage_id: 1,
            status: VersionStatus::Valid,
            protected: false,
            bytes_read: 0,
            bytes_written: 0,
            bytes_deduplicated: 0,
            bytes_sparse: 0,
            duration: 0,
            labels,
        }
    }

    fn matches(expr: &str) -> bool {
        FilterExpression::parse_at(expr, datetime!(2024-06-01 00:00:00 UTC))
            .unwrap()
            .matches(&sample_version(), "local")
            .unwrap()
    }

    #[test]
    fn field_comparisons() {
        assert!(matches("volume == 'vm-disk'"));
        assert!(!matches("volume == 'other'"));
        assert!(matches("size > 1048576"));
        assert!(matches("status == 'valid' and not protected"));
        assert!(matches("uid == 'V0000000003'"));
        assert!(matches("storage == 'local'"));
    }

    #[test]
    fn label_lookup() {
        assert!(matches("labels['env'] == 'prod'"));
        assert!(matches("labels['env']"));
        assert!(!matches("labels['missing']"));
        assert!(matches("labels['missing'] != 'x'"));
        assert!(!matches("labels['missing'] == 'x'"));
    }

    #[test]
    fn like_wildcards() {
        assert!(matches("volume like 'vm-%'"));
        assert!(matches("volume like '%disk'"));
        assert!(matches("volume like '%m-d%'"));
        assert!(!matches("volume like 'vm'"));
        assert!(matches("volume like 'vm-disk'"));
    }

    #[test]
    fn date_literals() {
        assert!(matches("date < '2024-06-01T00:00:00Z'"));
        assert!(matches("date > '2024-01-01T00:00:00Z'"));
        assert!(matches("date > '2 months ago'"));
        assert!(!matches("date > '1 week ago'"));
    }

    #[test]
    fn boolean_structure() {
        assert!(matches("(volume == 'x') or (size > 0)"));
        assert!(matches("not (volume == 'x')"));
        assert!(matches("True"));
        assert!(!matches("False"));
    }

    #[test]
    fn rejects_unknown_identifiers() {
        assert!(FilterExpression::parse("hostname == 'x'").is_err());
        assert!(FilterExpression::parse("volume = 'x'").is_err());
        assert!(FilterExpression::parse("volume == ").is_err());
        assert!(FilterExpression::parse("").is_err());
        assert!(FilterExpression::parse("volume == 'x' extra").is_err());
    }
}
