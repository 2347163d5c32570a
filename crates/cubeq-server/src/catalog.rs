//! Index schema rendering for the schema endpoint

use cubeq_ir::{ColumnType, Schema};

fn type_name(t: ColumnType) -> &'static str {
    match t {
        ColumnType::String => "string",
        ColumnType::Number => "number",
        ColumnType::Boolean => "boolean",
        ColumnType::Time => "time",
        ColumnType::Object => "object",
        ColumnType::Nested => "nested",
        ColumnType::Unknown => "unknown",
    }
}

/// Format an index schema as a markdown table
pub fn to_markdown(schema: &Schema) -> String {
    let mut md = String::new();

    md.push_str(&format!("## Index: `{}`\n\n", schema.name));
    md.push_str(&format!("**Columns:** {}\n\n", schema.columns.len()));

    md.push_str("| Column | Type | Nested Path | Source |\n");
    md.push_str("|--------|------|-------------|--------|\n");

    for col in &schema.columns {
        let nested = col
            .nested_path
            .as_deref()
            .map(|p| format!("`{p}`"))
            .unwrap_or_default();
        let source = if col.use_source { "✓" } else { "" };
        md.push_str(&format!(
            "| `{}` | {} | {} | {} |\n",
            col.name,
            type_name(col.column_type),
            nested,
            source
        ));
    }

    md
}

/// Markdown catalog of several schemas, sorted by index name
pub fn catalog_markdown(schemas: &[std::sync::Arc<Schema>]) -> String {
    let mut sorted: Vec<&Schema> = schemas.iter().map(|s| s.as_ref()).collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut md = String::from("# Index Catalog\n\n");
    md.push_str(&format!("**Indexes:** {}\n\n", sorted.len()));
    for schema in sorted {
        md.push_str(&to_markdown(schema));
        md.push('\n');
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubeq_ir::Column;
    use std::sync::Arc;

    fn bugs() -> Schema {
        let mut comment = Column::new("comments.text", ColumnType::String);
        comment.nested_path = Some("comments".to_string());
        let mut blob = Column::new("blob", ColumnType::String);
        blob.use_source = true;
        Schema::new(
            "bugs",
            vec![
                Column::new("bug_id", ColumnType::Number),
                Column::new("comments", ColumnType::Nested),
                comment,
                blob,
            ],
        )
    }

    #[test]
    fn test_markdown_table() {
        let md = to_markdown(&bugs());
        assert!(md.starts_with("## Index: `bugs`"));
        assert!(md.contains("**Columns:** 4"));
        assert!(md.contains("| `bug_id` | number |  |  |"));
        assert!(md.contains("| `comments.text` | string | `comments` |  |"));
        assert!(md.contains("| `blob` | string |  | ✓ |"));
    }

    #[test]
    fn test_catalog_sorted() {
        let md = catalog_markdown(&[Arc::new(bugs()), Arc::new(Schema::new("alerts", Vec::new()))]);
        let alerts = md.find("`alerts`").unwrap();
        let bugs = md.find("`bugs`").unwrap();
        assert!(alerts < bugs);
        assert!(md.contains("**Indexes:** 2"));
    }
}
