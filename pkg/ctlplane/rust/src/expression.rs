// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! Default condition language.
//!
//! A deliberately small grammar: quoted strings, numbers, `true`/`false`/`null`,
//! parameter names, comparisons (`== != < <= > >=`), `&&`, `||`, `!` and
//! parentheses. Unset parameters evaluate to `null`.

use crate::condition::{ConditionContext, EvaluationError, ExpressionEvaluator};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, map, opt, recognize, value},
    multi::many0,
    number::complete::double,
    sequence::{delimited, pair, preceded},
};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Param(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// Evaluator for the built-in condition language.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

impl ExpressionEvaluator for BasicEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        context: &ConditionContext,
    ) -> Result<bool, EvaluationError> {
        let expr = parse(expression)?;
        Ok(eval(&expr, context).truthy())
    }
}

fn parse(expression: &str) -> Result<Expr, EvaluationError> {
    match all_consuming(ws(or_expr)).parse(expression) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            let offset = expression.len() - e.input.len();
            Err(EvaluationError::Syntax(format!(
                "unexpected input at offset {offset}: {:?}",
                e.input.chars().take(16).collect::<String>()
            )))
        }
        Err(nom::Err::Incomplete(_)) => {
            Err(EvaluationError::Syntax("incomplete expression".to_string()))
        }
    }
}

fn ws<'a, O, F>(inner: F) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>
where
    F: Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
{
    delimited(multispace0, inner, multispace0)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("||")), and_expr)).parse(input)?;
    let expr = rest
        .into_iter()
        .fold(first, |acc, e| Expr::Or(Box::new(acc), Box::new(e)));
    Ok((input, expr))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("&&")), unary_expr)).parse(input)?;
    let expr = rest
        .into_iter()
        .fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e)));
    Ok((input, expr))
}

fn unary_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), unary_expr), |e| Expr::Not(Box::new(e))),
        comparison,
    ))
    .parse(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = primary(input)?;
    let (input, tail) = opt(pair(ws(compare_op), primary)).parse(input)?;
    let expr = match tail {
        Some((op, rhs)) => Expr::Compare(op, Box::new(lhs), Box::new(rhs)),
        None => lhs,
    };
    Ok((input, expr))
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
    ))
    .parse(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), or_expr, ws(char(')'))),
        map(string_literal, |s| Expr::Literal(Value::Str(s))),
        name_or_keyword,
        number,
    )))
    .parse(input)
}

fn string_literal(input: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
            delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        )),
        |s: &str| s.to_string(),
    )
    .parse(input)
}

fn name_or_keyword(input: &str) -> IResult<&str, Expr> {
    map(
        recognize(pair(
            take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
        )),
        |name: &str| match name {
            "true" => Expr::Literal(Value::Bool(true)),
            "false" => Expr::Literal(Value::Bool(false)),
            "null" => Expr::Literal(Value::Null),
            _ => Expr::Param(name.to_string()),
        },
    )
    .parse(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map(double, |n| Expr::Literal(Value::Num(n))).parse(input)
}

fn eval(expr: &Expr, context: &ConditionContext) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Param(name) => context
            .get(name)
            .map(|v| Value::Str(v.to_string()))
            .unwrap_or(Value::Null),
        Expr::Not(inner) => Value::Bool(!eval(inner, context).truthy()),
        Expr::And(lhs, rhs) => {
            Value::Bool(eval(lhs, context).truthy() && eval(rhs, context).truthy())
        }
        Expr::Or(lhs, rhs) => {
            Value::Bool(eval(lhs, context).truthy() || eval(rhs, context).truthy())
        }
        Expr::Compare(op, lhs, rhs) => {
            Value::Bool(compare(*op, &eval(lhs, context), &eval(rhs, context)))
        }
    }
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(lhs, rhs),
        CompareOp::Ne => !loosely_equal(lhs, rhs),
        CompareOp::Lt => ordering(lhs, rhs) == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => ordering(lhs, rhs) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            ordering(lhs, rhs),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    }
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(b), other) | (other, Value::Bool(b)) => other.as_bool() == Some(*b),
        _ => match (lhs.as_number(), rhs.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => lhs.as_text() == rhs.as_text(),
        },
    }
}

fn ordering(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    if matches!(lhs, Value::Null) || matches!(rhs, Value::Null) {
        return None;
    }
    match (lhs.as_number(), rhs.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(lhs.as_text().cmp(&rhs.as_text())),
    }
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => {
                let s = s.trim();
                !s.is_empty() && !s.eq_ignore_ascii_case("false") && s != "0"
            }
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Str(s) if s.trim().eq_ignore_ascii_case("true") => Some(true),
            Value::Str(s) if s.trim().eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            // "nan" and "inf" stay text.
            Value::Str(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => n.to_string(),
            Value::Str(s) => s.clone(),
        }
    }
}
