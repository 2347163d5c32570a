//! Evaluation of value expressions against JSON records

use chrono::Utc;
use cubeq_ir::{as_f64, canonical_key, compare_values, from_millis, is_truthy, millis_to_value, number, parse_time, to_millis};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

use crate::ast::*;
use crate::interval::Interval;

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("Invalid interval for floor(): {0}")]
    BadInterval(Value),
}

/// Value at a dotted path.
///
/// Objects are walked key by key; an array met along the way maps the rest
/// of the path over its elements and flattens the results. A key that
/// contains the dots literally (already-flattened records) wins over the
/// walk.
pub fn lookup_path(record: &Value, path: &str) -> Value {
    if let Some(direct) = record.get(path) {
        return direct.clone();
    }
    let mut parts = path.split('.');
    match parts.next() {
        Some(first) => walk(record, first, parts.collect::<Vec<_>>().as_slice()),
        None => Value::Null,
    }
}

fn walk(value: &Value, key: &str, rest: &[&str]) -> Value {
    match value {
        Value::Object(obj) => {
            let Some(child) = obj.get(key) else {
                return Value::Null;
            };
            match rest.split_first() {
                None => child.clone(),
                Some((next, rest)) => walk(child, next, rest),
            }
        }
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match walk(item, key, rest) {
                    Value::Null => {}
                    Value::Array(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            if out.is_empty() {
                Value::Null
            } else {
                Value::Array(out)
            }
        }
        _ => Value::Null,
    }
}

/// Loose equality: numbers compare numerically (numeric strings included),
/// everything else by canonical key
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => canonical_key(a) == canonical_key(b),
    }
}

/// Ordering for comparison operators; `None` when either side is null
pub(crate) fn loose_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if a.is_number() || b.is_number() {
        if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
            return x.partial_cmp(&y);
        }
        if let (Some(x), Some(y)) = (to_millis(a), to_millis(b)) {
            return Some(x.cmp(&y));
        }
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        if let (Some(x), Some(y)) = (parse_time(x), parse_time(y)) {
            return Some(x.cmp(&y));
        }
    }
    Some(compare_values(a, b))
}

impl Expr {
    /// Evaluate against one record
    pub fn eval(&self, record: &Value) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Field(path) => Ok(lookup_path(record, path)),
            Expr::Unary { op, expr } => {
                let value = expr.eval(record)?;
                Ok(match op {
                    UnOp::Neg => as_f64(&value).map(|n| number(-n)).unwrap_or(Value::Null),
                    UnOp::Not => Value::Bool(!is_truthy(&value)),
                })
            }
            Expr::Binary { op, left, right } => {
                // && and || short-circuit
                match op {
                    BinOp::And => {
                        let l = is_truthy(&left.eval(record)?);
                        return Ok(Value::Bool(l && is_truthy(&right.eval(record)?)));
                    }
                    BinOp::Or => {
                        let l = is_truthy(&left.eval(record)?);
                        return Ok(Value::Bool(l || is_truthy(&right.eval(record)?)));
                    }
                    _ => {}
                }
                let l = left.eval(record)?;
                let r = right.eval(record)?;
                Ok(binary(*op, &l, &r))
            }
            Expr::Call { func, args } => {
                let values = args
                    .iter()
                    .map(|a| a.eval(record))
                    .collect::<Result<Vec<_>, _>>()?;
                call(*func, values)
            }
        }
    }
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Value {
    match op {
        BinOp::Eq => Value::Bool(loose_eq(l, r)),
        BinOp::Ne => Value::Bool(!loose_eq(l, r)),
        BinOp::Lt => Value::Bool(loose_cmp(l, r) == Some(Ordering::Less)),
        BinOp::Le => Value::Bool(matches!(loose_cmp(l, r), Some(Ordering::Less | Ordering::Equal))),
        BinOp::Gt => Value::Bool(loose_cmp(l, r) == Some(Ordering::Greater)),
        BinOp::Ge => Value::Bool(matches!(loose_cmp(l, r), Some(Ordering::Greater | Ordering::Equal))),
        BinOp::Add => match (l, r) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (Value::String(_), _) | (_, Value::String(_)) => {
                Value::String(format!("{}{}", canonical_key(l), canonical_key(r)))
            }
            _ => arithmetic(l, r, |x, y| Some(x + y)),
        },
        BinOp::Sub => {
            // Difference of two timestamps is a duration in milliseconds
            if let (Value::String(a), Value::String(b)) = (l, r) {
                if let (Some(a), Some(b)) = (parse_time(a), parse_time(b)) {
                    return number((a - b).num_milliseconds() as f64);
                }
            }
            arithmetic(l, r, |x, y| Some(x - y))
        }
        BinOp::Mul => arithmetic(l, r, |x, y| Some(x * y)),
        BinOp::Div => arithmetic(l, r, |x, y| (y != 0.0).then(|| x / y)),
        BinOp::Rem => arithmetic(l, r, |x, y| (y != 0.0).then(|| x % y)),
        // short-circuited by the caller
        BinOp::And => Value::Bool(is_truthy(l) && is_truthy(r)),
        BinOp::Or => Value::Bool(is_truthy(l) || is_truthy(r)),
    }
}

fn arithmetic(l: &Value, r: &Value, f: impl Fn(f64, f64) -> Option<f64>) -> Value {
    match (as_f64(l), as_f64(r)) {
        (Some(x), Some(y)) => f(x, y).map(number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn call(func: Function, args: Vec<Value>) -> Result<Value, EvalError> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    Ok(match func {
        Function::Coalesce => args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null),
        Function::Min | Function::Max => {
            let (a, b) = (arg(0), arg(1));
            match (a.is_null(), b.is_null()) {
                (true, _) => b,
                (_, true) => a,
                _ => {
                    let ord = loose_cmp(&a, &b).unwrap_or(Ordering::Equal);
                    let take_a = match func {
                        Function::Min => ord != Ordering::Greater,
                        _ => ord != Ordering::Less,
                    };
                    if take_a {
                        a
                    } else {
                        b
                    }
                }
            }
        }
        Function::Floor => match args.get(1) {
            None => as_f64(&arg(0)).map(|n| number(n.floor())).unwrap_or(Value::Null),
            Some(interval) => floor_by(&arg(0), interval)?,
        },
        Function::Concat => Value::String(
            args.iter()
                .filter(|v| !v.is_null())
                .map(canonical_key)
                .collect::<String>(),
        ),
        Function::Length => match arg(0) {
            Value::String(s) => Value::from(s.chars().count()),
            Value::Array(items) => Value::from(items.len()),
            _ => Value::Null,
        },
        Function::IsNumeric => Value::Bool(as_f64(&arg(0)).is_some()),
        Function::YearMonth => to_millis(&arg(0))
            .and_then(from_millis)
            .map(|t| Value::String(t.format("%Y-%m").to_string()))
            .unwrap_or(Value::Null),
        Function::Now => Value::from(Utc::now().timestamp_millis()),
    })
}

fn floor_by(value: &Value, interval: &Value) -> Result<Value, EvalError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if let (Value::Number(_), Some(width)) = (interval, as_f64(interval)) {
        if width <= 0.0 {
            return Err(EvalError::BadInterval(interval.clone()));
        }
        if let Some(n) = as_f64(value) {
            return Ok(number((n / width).floor() * width));
        }
    }
    let width = Interval::parse(interval).ok_or_else(|| EvalError::BadInterval(interval.clone()))?;
    Ok(match (value, to_millis(value)) {
        (Value::String(_), Some(millis)) => millis_to_value(width.floor(millis)),
        (_, Some(millis)) => Value::from(width.floor(millis)),
        (_, None) => Value::Null,
    })
}
