//! Textual substitution of named constants

use serde_json::Value;
use std::collections::BTreeMap;

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Replace every whole token naming a constant with its literal text.
///
/// Tokens are runs of identifier characters (dots included), so `a.b` is a
/// single token and `LIMIT` is not replaced inside `LIMITS` or `x.LIMIT`.
/// Quoted string literals are copied untouched.
pub fn fold_constants(source: &str, constants: &BTreeMap<String, Value>) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if c == '"' || c == '\'' {
            out.push(c);
            let mut escaped = false;
            for (_, next) in chars.by_ref() {
                out.push(next);
                if escaped {
                    escaped = false;
                } else if next == '\\' {
                    escaped = true;
                } else if next == c {
                    break;
                }
            }
            continue;
        }

        if !is_token_char(c) {
            out.push(c);
            continue;
        }

        let mut end = start + c.len_utf8();
        while let Some(&(i, next)) = chars.peek() {
            if !is_token_char(next) {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }
        let token = &source[start..end];
        match constants.get(token) {
            Some(value) => out.push_str(&literal(value)),
            None => out.push_str(token),
        }
    }
    out
}

fn literal(value: &Value) -> String {
    match value {
        Value::Number(n) => cubeq_ir::format_number(n.as_f64().unwrap_or(f64::NAN)),
        // JSON string syntax is valid expression syntax
        other => other.to_string(),
    }
}
