//! Packing several edge values into one facet term
//!
//! A terms facet groups by a single string, so multi-edge queries group by
//! all their edge values joined with `|`. Inside a token `\` is written
//! `\\` and `|` is written `\p`; a missing value is the token `\0`.

use cubeq_domain::DomainKind;
use cubeq_engine::{CompiledEdge, CompiledQuery, EdgeValue};
use cubeq_expr::{Helper, Interval, ScriptCompiler};
use cubeq_ir::{as_f64, format_number, ColumnType, Schema};
use serde_json::Value;
use thiserror::Error;

use crate::EsError;

pub const NULL_TOKEN: &str = "\\0";

#[derive(Debug, Error, PartialEq)]
pub enum PackError {
    #[error("Term {0:?} ends inside an escape")]
    DanglingEscape(String),

    #[error("Term {term:?} has unknown escape \\{escape}")]
    UnknownEscape { term: String, escape: char },

    #[error("Term {0:?} mixes a missing-value token with text")]
    MalformedNull(String),

    #[error("Term {term:?} has {got} values, expected {expected}")]
    Arity { term: String, got: usize, expected: usize },
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('|', "\\p")
}

/// Join values into one term
pub fn pack(values: &[Option<String>]) -> String {
    values
        .iter()
        .map(|v| match v {
            Some(text) => escape(text),
            None => NULL_TOKEN.to_string(),
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Split a term back into its values
pub fn unpack(term: &str) -> Result<Vec<Option<String>>, PackError> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut null = false;
    let mut chars = term.chars();

    let finish = |current: &mut String, null: &mut bool| -> Result<Option<String>, PackError> {
        let token = match (*null, current.is_empty()) {
            (true, true) => None,
            (true, false) => return Err(PackError::MalformedNull(term.to_string())),
            (false, _) => Some(std::mem::take(current)),
        };
        *null = false;
        Ok(token)
    };

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') if !null => current.push('\\'),
                Some('p') if !null => current.push('|'),
                Some('0') if !null && current.is_empty() => null = true,
                Some('\\' | 'p' | '0') => return Err(PackError::MalformedNull(term.to_string())),
                Some(other) => {
                    return Err(PackError::UnknownEscape {
                        term: term.to_string(),
                        escape: other,
                    })
                }
                None => return Err(PackError::DanglingEscape(term.to_string())),
            },
            '|' => out.push(finish(&mut current, &mut null)?),
            c => current.push(c),
        }
    }
    out.push(finish(&mut current, &mut null)?);
    Ok(out)
}

/// As [`unpack`], checking the value count
pub fn unpack_n(term: &str, expected: usize) -> Result<Vec<Option<String>>, PackError> {
    let values = unpack(term)?;
    if values.len() != expected {
        return Err(PackError::Arity {
            term: term.to_string(),
            got: values.len(),
            expected,
        });
    }
    Ok(values)
}

/// Script computing the packed term of every edge of `cq`
///
/// Bucketed edges are floored to their bucket start in the script when the
/// buckets line up with zero, which keeps the number of distinct terms down;
/// otherwise the raw value is sent and bucketed while decoding.
pub fn packed_script(cq: &CompiledQuery, schema: &Schema) -> Result<String, EsError> {
    let mut compiler = ScriptCompiler::new(schema);
    compiler.require(Helper::Value2Pipe);
    let mut parts = Vec::with_capacity(cq.edges.len());
    for edge in &cq.edges {
        let EdgeValue::Expr(expr) = &edge.value else {
            return Err(EsError::Unsupported(format!("edge {} has no single value", edge.name)));
        };
        let value = compiler.compile_expr(expr)?;
        let value = match aligned_width(edge) {
            Some(width) => {
                compiler.require(Helper::FloorInterval);
                format!("floorInterval({value}, {width})")
            }
            None => value,
        };
        parts.push(format!("Value2Pipe({value})"));
    }
    Ok(compiler.finish(parts.join(" + \"|\" + ")))
}

/// Bucket width when every bucket start is a multiple of it
fn aligned_width(edge: &CompiledEdge) -> Option<String> {
    use cubeq_domain::Bucketing;
    match edge.domain.bucketing()? {
        Bucketing::Calendar {
            origin,
            interval: Interval::Millis(width),
        } if origin.rem_euclid(width) == 0 => Some(width.to_string()),
        Bucketing::Numeric { origin, width }
            if width.fract() == 0.0 && width >= 1.0 && origin.rem_euclid(width) == 0.0 =>
        {
            Some(format_number(width))
        }
        _ => None,
    }
}

/// Value an edge token stands for, typed the way the in-memory engine
/// would have read it
pub fn token_value(edge: &CompiledEdge, schema: &Schema, token: Option<String>) -> Value {
    let Some(text) = token else {
        return Value::Null;
    };
    let column = edge.field().map(|f| schema.column_type(f)).unwrap_or(ColumnType::Unknown);
    let bucketed = edge.domain.kind().is_bucketed();
    if bucketed || matches!(column, ColumnType::Number | ColumnType::Time) {
        if let Some(n) = as_f64(&Value::String(text.clone())) {
            // discovered time values read back as timestamps, not epoch millis
            if column == ColumnType::Time && !bucketed && edge.domain.kind() != DomainKind::Duration {
                return cubeq_ir::millis_to_value(n as i64);
            }
            return cubeq_ir::number(n);
        }
    }
    match (column, text.as_str()) {
        (ColumnType::Boolean, "true" | "T") => Value::Bool(true),
        (ColumnType::Boolean, "false" | "F") => Value::Bool(false),
        _ => Value::String(text),
    }
}
