//! SQL parsing, canonicalization, and structural feature extraction.
//!
//! The crate treats the SQL grammar itself as a parsing *library* concern,
//! not a provider/executor collaborator, so a default implementation built
//! on [`sqlparser`] ships alongside the trait (unlike the LLM and executor
//! collaborators in [`crate::llm`] and [`crate::executor`], which are
//! trait-only).

pub mod features;
pub mod transforms;

use std::fmt;
use std::sync::Arc;

use sqlparser::ast::Statement;
use sqlparser::dialect::{
    AnsiDialect, Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::parser::Parser;

use crate::error::{Error, Result};

pub use features::FeatureVector;
pub use transforms::{diff_transforms, TransformId};

/// A parsed, dialect-tagged statement. Kept deliberately thin: callers that
/// need the raw AST can match on [`ParsedStatement::statement`] directly.
#[derive(Debug, Clone)]
pub struct ParsedStatement {
    pub dialect: String,
    pub statement: Statement,
}

impl fmt::Display for ParsedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.statement)
    }
}

/// Parses, canonicalizes, and inspects SQL text for a given dialect.
///
/// Canonicalization and feature extraction are pure functions of the
/// parsed AST so candidate deduplication ([`crate::candidate::normalize`])
/// and the static validation gate can both be driven from the same parse.
pub trait SqlDialectParser: Send + Sync {
    /// Parse `sql` under `dialect`, returning the first statement. Multiple
    /// statements in one string is treated as a [`Error::Parse`] since a
    /// candidate is always a single query.
    fn parse(&self, sql: &str, dialect: &str) -> Result<ParsedStatement>;

    /// Render a parsed statement back to a normalized textual form,
    /// suitable for hashing into `candidate_id`. Whitespace, keyword case,
    /// and a stable clause ordering are the only things canonicalization
    /// controls; it never changes semantics.
    fn canonicalize(&self, parsed: &ParsedStatement) -> String {
        parsed.statement.to_string()
    }

    /// Extract the structural feature vector used for example matching and
    /// gap/strength detection.
    fn features(&self, parsed: &ParsedStatement) -> FeatureVector {
        features::extract(&parsed.statement)
    }

    /// Whether `parsed`'s top-level query has an `ORDER BY` and/or `LIMIT`,
    /// used by the static gate's structural-preservation check.
    fn top_level_ordering(&self, parsed: &ParsedStatement) -> (bool, bool) {
        features::top_level_ordering(&parsed.statement)
    }

    /// Constructs present in `parsed` that appear in `forbidden`. Each
    /// entry in `forbidden` is a construct name as used in
    /// [`FeatureVector`] (`"cross_join"`, `"select_star"`, ...).
    fn forbidden_constructs(&self, parsed: &ParsedStatement, forbidden: &[String]) -> Vec<String> {
        let present = self.features(parsed);
        forbidden
            .iter()
            .filter(|name| present.has_construct(name))
            .cloned()
            .collect()
    }
}

/// Default [`SqlDialectParser`] backed by the `sqlparser` crate, supporting
/// the dialect names the knowledge layer's engine profiles use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlparserDialectParser;

impl SqlparserDialectParser {
    pub fn new() -> Self {
        Self
    }

    fn dialect_for(name: &str) -> Result<Box<dyn Dialect>> {
        match name.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Box::new(PostgreSqlDialect {})),
            "mysql" => Ok(Box::new(MySqlDialect {})),
            "sqlite" => Ok(Box::new(SQLiteDialect {})),
            "ansi" => Ok(Box::new(AnsiDialect {})),
            "generic" | "" => Ok(Box::new(GenericDialect {})),
            other => Err(Error::parse(
                other,
                format!("unknown SQL dialect '{other}'"),
            )),
        }
    }
}

impl SqlDialectParser for SqlparserDialectParser {
    fn parse(&self, sql: &str, dialect: &str) -> Result<ParsedStatement> {
        let dialect_impl = Self::dialect_for(dialect)?;
        let mut statements = Parser::parse_sql(dialect_impl.as_ref(), sql)
            .map_err(|e| Error::parse(dialect, e.to_string()))?;

        if statements.is_empty() {
            return Err(Error::parse(dialect, "no statement found"));
        }
        if statements.len() > 1 {
            return Err(Error::parse(
                dialect,
                "a candidate must be a single statement",
            ));
        }

        Ok(ParsedStatement {
            dialect: dialect.to_string(),
            statement: statements.remove(0),
        })
    }
}

/// Shared handle to a [`SqlDialectParser`], cheaply cloned across workers.
pub type SharedSqlParser = Arc<dyn SqlDialectParser>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_select_under_generic_dialect() {
        let parser = SqlparserDialectParser::new();
        let parsed = parser.parse("SELECT id FROM orders WHERE id = 1", "generic").unwrap();
        assert!(matches!(parsed.statement, Statement::Query(_)));
    }

    #[test]
    fn rejects_multiple_statements() {
        let parser = SqlparserDialectParser::new();
        let err = parser
            .parse("SELECT 1; SELECT 2;", "generic")
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn rejects_unknown_dialect() {
        let parser = SqlparserDialectParser::new();
        let err = parser.parse("SELECT 1", "oracle-legacy").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn canonicalize_is_stable_across_whitespace_variants() {
        let parser = SqlparserDialectParser::new();
        let a = parser.parse("select id from orders where id=1", "generic").unwrap();
        let b = parser
            .parse("SELECT   id\nFROM orders\nWHERE id = 1", "generic")
            .unwrap();
        assert_eq!(parser.canonicalize(&a), parser.canonicalize(&b));
    }
}
