//! Backend script generation
//!
//! Filters compile to boolean script expressions and value expressions to
//! value scripts. Fields under a nested document path are reached through a
//! generated loop function over the nested array; the loop variables form a
//! scope stack so inner references resolve against the innermost enclosing
//! loop first.

mod helpers;

use cubeq_ir::{canonical_key, format_number, to_millis, ColumnType, Filter, RangeBounds, Schema};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::ast::*;
use crate::interval::Interval;
use crate::parser::{parse, ParseError};

pub use helpers::{resolve as resolve_helpers, Helper};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Field {0} lives in a nested document and needs an enclosing filter")]
    NestedFieldOutsideScope(String),

    #[error("Cannot script {0}")]
    Unsupported(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone)]
struct NestedScope {
    path: String,
    var: String,
}

/// Accumulates the helpers and loop functions one script needs
pub struct ScriptCompiler<'s> {
    schema: &'s Schema,
    scopes: Vec<NestedScope>,
    helpers: Vec<Helper>,
    defs: Vec<String>,
    next_var: usize,
}

impl<'s> ScriptCompiler<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            scopes: Vec::new(),
            helpers: Vec::new(),
            defs: Vec::new(),
            next_var: 0,
        }
    }

    pub fn require(&mut self, helper: Helper) {
        if !self.helpers.contains(&helper) {
            self.helpers.push(helper);
        }
    }

    /// Prepend helpers (dependencies first) and loop functions to `body`
    pub fn finish(self, body: String) -> String {
        let mut parts: Vec<String> = resolve_helpers(&self.helpers)
            .into_iter()
            .map(|h| h.source().to_string())
            .collect();
        parts.extend(self.defs);
        parts.push(body);
        let script = parts.join("\n");
        debug!(script = %script, "Generated backend script");
        script
    }

    /// Script text reading `field` in the current scope
    pub fn field(&mut self, field: &str) -> Result<String, ScriptError> {
        for scope in self.scopes.iter().rev() {
            if let Some(rest) = strip_path(field, &scope.path) {
                return Ok(format!("{}{}", scope.var, subscripts(rest)));
            }
        }
        if self.schema.nested_path_of(field).is_some() {
            return Err(ScriptError::NestedFieldOutsideScope(field.to_string()));
        }
        let use_source = self
            .schema
            .find_column(field)
            .map(|c| c.use_source)
            .unwrap_or(false);
        if use_source {
            return Ok(format!("_source{}", subscripts(field)));
        }
        self.require(Helper::GetDocValue);
        Ok(format!("getDocValue({})", quote(field)))
    }

    pub fn compile_filter(&mut self, filter: &Filter) -> Result<String, ScriptError> {
        if let Some(field) = filter_field(filter) {
            if let Some(level) = self.next_nested_level(field) {
                return self.nested_loop(&level, filter);
            }
        }

        Ok(match filter {
            Filter::And(children) => self.join(children, " && ", "true")?,
            Filter::Or(children) => self.join(children, " || ", "false")?,
            Filter::Not(inner) => format!("!({})", self.compile_filter(inner)?),
            Filter::Term { field, value } => {
                let access = self.field(field)?;
                format!("{access} == {}", self.literal_for(field, value))
            }
            Filter::Terms { field, values } => {
                if values.is_empty() {
                    return Ok("false".to_string());
                }
                let access = self.field(field)?;
                let checks: Vec<String> = values
                    .iter()
                    .map(|v| format!("{access} == {}", self.literal_for(field, v)))
                    .collect();
                format!("({})", checks.join(" || "))
            }
            Filter::Range { field, bounds } => self.range(field, bounds)?,
            Filter::Exists { field } => format!("{} != null", self.field(field)?),
            Filter::Missing { field } => format!("{} == null", self.field(field)?),
            Filter::Prefix { field, prefix } => {
                let access = self.field(field)?;
                format!("({access} != null && {access}.startsWith({}))", quote(prefix))
            }
            Filter::MatchAll => "true".to_string(),
            Filter::Script { script } => format!("({script})"),
        })
    }

    fn join(&mut self, children: &[Filter], op: &str, empty: &str) -> Result<String, ScriptError> {
        match children {
            [] => Ok(empty.to_string()),
            [only] => self.compile_filter(only),
            _ => {
                let parts = children
                    .iter()
                    .map(|c| self.compile_filter(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", parts.join(op)))
            }
        }
    }

    fn range(&mut self, field: &str, bounds: &RangeBounds) -> Result<String, ScriptError> {
        let access = self.field(field)?;
        let mut checks = vec![format!("{access} != null")];
        for (op, bound) in [(">", &bounds.gt), (">=", &bounds.gte), ("<", &bounds.lt), ("<=", &bounds.lte)] {
            if let Some(bound) = bound {
                checks.push(format!("{access} {op} {}", self.literal_for(field, bound)));
            }
        }
        Ok(format!("({})", checks.join(" && ")))
    }

    /// Literal compared against `field`; times become epoch milliseconds
    fn literal_for(&self, field: &str, value: &Value) -> String {
        if self.schema.column_type(field) == ColumnType::Time {
            if let Some(millis) = to_millis(value) {
                return millis.to_string();
            }
        }
        literal(value)
    }

    /// The shallowest nested path holding `field` that is not yet entered
    fn next_nested_level(&self, field: &str) -> Option<String> {
        let target = self.schema.nested_path_of(field)?;
        let current = self.scopes.last().map(|s| s.path.as_str());
        if current == Some(target) {
            return None;
        }
        // walk outward from the target to the level right below the current scope
        let mut level = target;
        while let Some(parent) = self.schema.nested_path_of(level) {
            if Some(parent) == current {
                break;
            }
            level = parent;
        }
        Some(level.to_string())
    }

    fn nested_loop(&mut self, path: &str, filter: &Filter) -> Result<String, ScriptError> {
        let list = match self.scopes.iter().rev().find_map(|s| strip_path(path, &s.path).map(|rest| (s, rest))) {
            Some((scope, rest)) => format!("{}{}", scope.var, subscripts(rest)),
            None => format!("_source{}", subscripts(path)),
        };
        let id = self.next_var;
        self.next_var += 1;
        let var = format!("v{id}");

        self.scopes.push(NestedScope {
            path: path.to_string(),
            var: var.clone(),
        });
        let inner = self.compile_filter(filter);
        self.scopes.pop();
        let inner = inner?;

        self.defs.push(format!(
            "def nested{id}(list) {{ if (list == null) return false; for ({var} : list) {{ if ({inner}) return true; }} return false; }}"
        ));
        Ok(format!("nested{id}({list})"))
    }

    pub fn compile_expr(&mut self, expr: &Expr) -> Result<String, ScriptError> {
        Ok(match expr {
            Expr::Literal(value) => literal(value),
            Expr::Field(name) => self.field(name)?,
            Expr::Unary { op: UnOp::Neg, expr } => format!("(-{})", self.compile_expr(expr)?),
            Expr::Unary { op: UnOp::Not, expr } => format!("!({})", self.compile_expr(expr)?),
            Expr::Binary { op, left, right } => format!(
                "({} {} {})",
                self.compile_expr(left)?,
                op.symbol(),
                self.compile_expr(right)?
            ),
            Expr::Call { func, args } => self.compile_call(*func, args)?,
        })
    }

    fn compile_call(&mut self, func: Function, args: &[Expr]) -> Result<String, ScriptError> {
        let mut compiled = args
            .iter()
            .map(|a| self.compile_expr(a))
            .collect::<Result<Vec<_>, _>>()?;

        let binary_helper = |helper: Helper, compiled: Vec<String>| {
            compiled
                .into_iter()
                .reduce(|acc, next| format!("{}({acc}, {next})", helper.name()))
                .unwrap_or_else(|| "null".to_string())
        };

        Ok(match func {
            Function::Coalesce => {
                self.require(Helper::Coalesce);
                // right fold keeps the first non-null
                compiled
                    .into_iter()
                    .rev()
                    .reduce(|acc, next| format!("coalesce({next}, {acc})"))
                    .unwrap_or_else(|| "null".to_string())
            }
            Function::Min => {
                self.require(Helper::Minimum);
                binary_helper(Helper::Minimum, compiled)
            }
            Function::Max => {
                self.require(Helper::Maximum);
                binary_helper(Helper::Maximum, compiled)
            }
            Function::Floor if args.len() == 1 => format!("Math.floor({})", compiled.remove(0)),
            Function::Floor => {
                let width = match &args[1] {
                    Expr::Literal(Value::Number(n)) => n.as_f64().map(format_number),
                    Expr::Literal(interval) => match Interval::parse(interval) {
                        Some(Interval::Millis(ms)) => Some(ms.to_string()),
                        _ => None,
                    },
                    _ => None,
                }
                .ok_or_else(|| ScriptError::Unsupported("floor() without a fixed literal interval".to_string()))?;
                self.require(Helper::FloorInterval);
                format!("floorInterval({}, {width})", compiled.remove(0))
            }
            Function::Concat => {
                self.require(Helper::Coalesce);
                let parts: Vec<String> = compiled
                    .into_iter()
                    .map(|c| format!("coalesce({c}, \"\")"))
                    .collect();
                format!("(\"\" + {})", parts.join(" + "))
            }
            Function::Length => {
                let value = compiled.remove(0);
                format!("({value} == null ? null : {value}.length())")
            }
            Function::IsNumeric => {
                self.require(Helper::IsNumeric);
                format!("isNumeric({})", compiled.remove(0))
            }
            Function::YearMonth => {
                self.require(Helper::Date2YearMonth);
                format!("Date2YearMonth({})", compiled.remove(0))
            }
            Function::Now => "time()".to_string(),
        })
    }
}

/// Boolean script for a filter
pub fn filter_script(filter: &Filter, schema: &Schema) -> Result<String, ScriptError> {
    let mut compiler = ScriptCompiler::new(schema);
    let body = compiler.compile_filter(filter)?;
    Ok(compiler.finish(body))
}

/// Value script for expression source
pub fn value_script(source: &str, schema: &Schema) -> Result<String, ScriptError> {
    let expr = parse(source)?;
    let mut compiler = ScriptCompiler::new(schema);
    let body = compiler.compile_expr(&expr)?;
    Ok(compiler.finish(body))
}

/// Script literal for a JSON value
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(_) => canonical_key(value),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn subscripts(path: &str) -> String {
    path.split('.').map(|part| format!("[{}]", quote(part))).collect()
}

fn strip_path<'f>(field: &'f str, prefix: &str) -> Option<&'f str> {
    field.strip_prefix(prefix)?.strip_prefix('.')
}

/// Field of a leaf filter node
fn filter_field(filter: &Filter) -> Option<&str> {
    match filter {
        Filter::Term { field, .. }
        | Filter::Terms { field, .. }
        | Filter::Range { field, .. }
        | Filter::Exists { field }
        | Filter::Missing { field }
        | Filter::Prefix { field, .. } => Some(field),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubeq_ir::Column;
    use serde_json::json;

    fn schema() -> Schema {
        let comments = Column::new("comments", ColumnType::Nested);
        let mut author = Column::new("comments.author", ColumnType::String);
        author.nested_path = Some("comments".to_string());
        let mut body = Column::new("body", ColumnType::String);
        body.use_source = true;
        Schema::new(
            "bugs",
            vec![
                Column::new("status", ColumnType::String),
                Column::new("size", ColumnType::Number),
                Column::new("opened", ColumnType::Time),
                comments,
                author,
                body,
            ],
        )
    }

    fn compile(filter: Value) -> String {
        filter_script(&Filter::from_json(&filter).unwrap(), &schema()).unwrap()
    }

    #[test]
    fn test_single_child_short_circuits() {
        let script = compile(json!({"and": [{"term": {"status": "open"}}]}));
        assert!(script.ends_with(r#"getDocValue("status") == "open""#));
        assert!(script.starts_with("def getDocValue(name)"));
    }

    #[test]
    fn test_boolean_structure() {
        let script = compile(json!({"or": [
            {"term": {"size": 3}},
            {"not": {"missing": {"field": "status"}}}
        ]}));
        let body = script.lines().last().unwrap();
        assert_eq!(
            body,
            r#"(getDocValue("size") == 3 || !(getDocValue("status") == null))"#
        );
        assert_eq!(script.matches("def getDocValue").count(), 1);
    }

    #[test]
    fn test_time_range_in_millis() {
        let script = compile(json!({"range": {"opened": {"gte": "1970-01-02"}}}));
        assert!(script.ends_with(r#"(getDocValue("opened") != null && getDocValue("opened") >= 86400000)"#));
    }

    #[test]
    fn test_nested_field_generates_loop() {
        let script = compile(json!({"and": [
            {"term": {"status": "open"}},
            {"term": {"comments.author": "k"}}
        ]}));
        assert!(script.contains(r#"def nested0(list) { if (list == null) return false; for (v0 : list) { if (v0["author"] == "k") return true; } return false; }"#));
        assert!(script.ends_with(r#"(getDocValue("status") == "open" && nested0(_source["comments"]))"#));
    }

    #[test]
    fn test_source_fields_and_scripts() {
        let script = compile(json!({"and": [
            {"prefix": {"body": "crash"}},
            {"script": "doc[\"size\"].value > 2"}
        ]}));
        assert!(script.contains(r#"_source["body"].startsWith("crash")"#));
        assert!(script.ends_with(r#"(doc["size"].value > 2))"#));
    }

    #[test]
    fn test_nested_field_outside_filter_is_rejected() {
        let err = value_script("comments.author", &schema()).unwrap_err();
        assert!(matches!(err, ScriptError::NestedFieldOutsideScope(f) if f == "comments.author"));
    }

    #[test]
    fn test_value_script_helpers_in_dependency_order() {
        let script = value_script("min(size, 10) + coalesce(size, 0)", &schema()).unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert!(lines[0].starts_with("def getDocValue"));
        assert!(lines[1].starts_with("def coalesce"));
        assert!(lines[2].starts_with("def minimum"));
        assert_eq!(
            *lines.last().unwrap(),
            r#"(minimum(getDocValue("size"), 10) + coalesce(getDocValue("size"), 0))"#
        );
    }

    #[test]
    fn test_floor_by_duration() {
        let script = value_script("floor(opened, 'day')", &schema()).unwrap();
        assert!(script.ends_with(r#"floorInterval(getDocValue("opened"), 86400000)"#));
        assert!(value_script("floor(opened, 'month')", &schema()).is_err());
    }
}
