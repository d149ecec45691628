//! Shared prompt-rendering and completion-parsing helpers used by both
//! strategies. Workers are asked for a fenced ` ```sql ` block, optionally
//! preceded by a `-- transforms: a, b` comment line declaring intent; a raw
//! SQL statement with no fence is also accepted, since exploration workers
//! are explicitly permitted to answer free-form.

use serde::Deserialize;

use crate::knowledge::GoldExample;
use crate::sql::TransformId;

/// A worker completion parsed into its rewrite SQL and any transform IDs it
/// declared.
pub struct WorkerRewrite {
    pub sql: String,
    pub declared_transforms: Vec<TransformId>,
}

#[derive(Debug, Deserialize)]
struct StructuredRewrite {
    sql: String,
    #[serde(default)]
    transforms: Vec<String>,
}

/// Parses a worker's completion content. Tries, in order: a JSON object with
/// `sql`/`transforms` fields, a fenced ` ```sql ` block with an optional
/// leading `-- transforms: ...` comment, then falls back to treating the
/// entire trimmed content as raw SQL.
pub fn extract_rewrite(content: &str) -> WorkerRewrite {
    let trimmed = content.trim();

    if let Ok(structured) = serde_json::from_str::<StructuredRewrite>(trimmed) {
        return WorkerRewrite {
            sql: structured.sql,
            declared_transforms: structured.transforms.into_iter().map(TransformId::new).collect(),
        };
    }

    let fenced = extract_fenced_sql(trimmed).unwrap_or(trimmed);
    let (declared_transforms, sql) = split_transform_comment(fenced);
    WorkerRewrite {
        sql: sql.trim().to_string(),
        declared_transforms,
    }
}

fn extract_fenced_sql(text: &str) -> Option<&str> {
    let start = text.find("```sql").map(|i| i + 6).or_else(|| text.find("```").map(|i| i + 3))?;
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

fn split_transform_comment(sql: &str) -> (Vec<TransformId>, &str) {
    let sql = sql.trim_start();
    if let Some(rest) = sql.strip_prefix("-- transforms:") {
        if let Some(newline) = rest.find('\n') {
            let (declared, remainder) = rest.split_at(newline);
            let ids = declared
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(TransformId::new)
                .collect();
            return (ids, remainder.trim_start_matches('\n'));
        }
    }
    (Vec::new(), sql)
}

/// Renders one gold example for injection into a worker prompt, including
/// its four-part explanation so a worker sees not just the rewrite but
/// when the example's author says to use it and when not to.
pub fn render_example(example: &GoldExample) -> String {
    let mut rendered = format!(
        "\nExample ({}):\nOriginal: {}\nRewritten: {}\n",
        example.id, example.original_sql, example.rewritten_sql
    );
    let explanation = &example.explanation;
    if !explanation.what_transformed.is_empty() {
        rendered.push_str(&format!("What changed: {}\n", explanation.what_transformed));
    }
    if !explanation.why_it_helps.is_empty() {
        rendered.push_str(&format!("Why it helps: {}\n", explanation.why_it_helps));
    }
    if !explanation.when_to_apply.is_empty() {
        rendered.push_str(&format!("When to apply: {}\n", explanation.when_to_apply));
    }
    if !explanation.when_not_to_apply.is_empty() {
        rendered.push_str(&format!("When NOT to apply: {}\n", explanation.when_not_to_apply));
    }
    if example.validated_at_scale {
        rendered.push_str(&format!("Validated at scale, measured speedup {:.2}x\n", example.outcome_speedup));
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_sql() {
        let rewrite = extract_rewrite("```sql\nSELECT 1\n```");
        assert_eq!(rewrite.sql, "SELECT 1");
    }

    #[test]
    fn extracts_raw_sql_without_fence() {
        let rewrite = extract_rewrite("SELECT 1");
        assert_eq!(rewrite.sql, "SELECT 1");
    }

    #[test]
    fn parses_declared_transforms_comment() {
        let rewrite = extract_rewrite("```sql\n-- transforms: cte_extraction, predicate_pushdown\nSELECT 1\n```");
        assert_eq!(rewrite.sql, "SELECT 1");
        assert_eq!(rewrite.declared_transforms.len(), 2);
    }

    #[test]
    fn parses_structured_json_rewrite() {
        let rewrite = extract_rewrite(r#"{"sql": "SELECT 1", "transforms": ["column_pruning"]}"#);
        assert_eq!(rewrite.sql, "SELECT 1");
        assert_eq!(rewrite.declared_transforms, vec![TransformId::new("column_pruning")]);
    }
}
