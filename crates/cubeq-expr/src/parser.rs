//! Pest-based parser for value expressions

use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::ast::*;
use crate::constants::fold_constants;

#[derive(Parser)]
#[grammar = "expr.pest"]
pub struct ExprParser;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Pest error: {0}")]
    Pest(#[from] Box<pest::error::Error<Rule>>),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Function {func} takes {min}..={max} arguments, got {got}")]
    Arity {
        func: &'static str,
        min: usize,
        max: usize,
        got: usize,
    },
}

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        PrattParser::new()
            .op(Op::infix(Rule::or, Assoc::Left))
            .op(Op::infix(Rule::and, Assoc::Left))
            .op(Op::infix(Rule::eq, Assoc::Left) | Op::infix(Rule::ne, Assoc::Left))
            .op(Op::infix(Rule::lt, Assoc::Left)
                | Op::infix(Rule::le, Assoc::Left)
                | Op::infix(Rule::gt, Assoc::Left)
                | Op::infix(Rule::ge, Assoc::Left))
            .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
            .op(Op::infix(Rule::mul, Assoc::Left)
                | Op::infix(Rule::div, Assoc::Left)
                | Op::infix(Rule::rem, Assoc::Left))
            .op(Op::prefix(Rule::neg) | Op::prefix(Rule::not))
    })
}

/// Parse expression source text into an AST
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let mut pairs = ExprParser::parse(Rule::program, source).map_err(Box::new)?;
    let expr = pairs
        .next()
        .filter(|p| p.as_rule() == Rule::expr)
        .ok_or_else(|| ParseError::Syntax("Empty expression".to_string()))?;
    parse_expr(expr.into_inner())
}

/// Parse after substituting named constants
pub fn parse_with_constants(
    source: &str,
    constants: &BTreeMap<String, Value>,
) -> Result<Expr, ParseError> {
    if constants.is_empty() {
        return parse(source);
    }
    parse(&fold_constants(source, constants))
}

fn parse_expr(pairs: Pairs<Rule>) -> Result<Expr, ParseError> {
    pratt()
        .map_primary(parse_primary)
        .map_prefix(|op, rhs| {
            let op = match op.as_rule() {
                Rule::neg => UnOp::Neg,
                _ => UnOp::Not,
            };
            Ok(Expr::Unary {
                op,
                expr: Box::new(rhs?),
            })
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::or => BinOp::Or,
                Rule::and => BinOp::And,
                Rule::eq => BinOp::Eq,
                Rule::ne => BinOp::Ne,
                Rule::lt => BinOp::Lt,
                Rule::le => BinOp::Le,
                Rule::gt => BinOp::Gt,
                Rule::ge => BinOp::Ge,
                Rule::add => BinOp::Add,
                Rule::sub => BinOp::Sub,
                Rule::mul => BinOp::Mul,
                Rule::div => BinOp::Div,
                Rule::rem => BinOp::Rem,
                other => return Err(ParseError::Syntax(format!("Unknown operator: {other:?}"))),
            };
            Ok(Expr::Binary {
                op,
                left: Box::new(lhs?),
                right: Box::new(rhs?),
            })
        })
        .parse(pairs)
}

fn parse_primary(pair: Pair<Rule>) -> Result<Expr, ParseError> {
    match pair.as_rule() {
        Rule::number => {
            let n: f64 = pair
                .as_str()
                .parse()
                .map_err(|_| ParseError::Syntax(format!("Invalid number: {}", pair.as_str())))?;
            Ok(Expr::Literal(cubeq_ir::number(n)))
        }
        Rule::string => {
            let inner = pair
                .into_inner()
                .next()
                .map(|p| p.as_str())
                .unwrap_or_default();
            Ok(Expr::Literal(Value::String(unescape(inner))))
        }
        Rule::boolean => Ok(Expr::Literal(Value::Bool(pair.as_str() == "true"))),
        Rule::null => Ok(Expr::Literal(Value::Null)),
        Rule::path => Ok(Expr::Field(pair.as_str().to_string())),
        Rule::call => parse_call(pair),
        Rule::expr => parse_expr(pair.into_inner()),
        other => Err(ParseError::Syntax(format!("Invalid primary: {other:?}"))),
    }
}

fn parse_call(pair: Pair<Rule>) -> Result<Expr, ParseError> {
    let mut inner = pair.into_inner();
    let name = inner
        .next()
        .map(|p| p.as_str().to_string())
        .ok_or_else(|| ParseError::Syntax("Missing function name".to_string()))?;
    let func = Function::from_name(&name).ok_or(ParseError::UnknownFunction(name))?;

    let args = inner
        .map(|arg| parse_expr(arg.into_inner()))
        .collect::<Result<Vec<_>, _>>()?;

    let (min, max) = func.arity();
    if args.len() < min || args.len() > max {
        return Err(ParseError::Arity {
            func: func.name(),
            min,
            max,
            got: args.len(),
        });
    }
    Ok(Expr::Call { func, args })
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
