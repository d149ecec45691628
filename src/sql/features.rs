//! Structural feature extraction over a parsed statement.
//!
//! The feature vector is deliberately coarse: it captures the shape
//! decisions (join style, subquery nesting, CTE use, aggregation) that the
//! knowledge layer's gap/strength predicates and the static gate's
//! forbidden-construct scan both key off of, without attempting a full
//! cost-model analysis -- that belongs to the executor's `EXPLAIN` output,
//! not to static structure.

use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, GroupByExpr, Join, JoinOperator, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins,
};

/// Structural shape of a statement, used for example matching, gap/strength
/// detection, and forbidden-construct checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub table_count: u32,
    pub subquery_count: u32,
    pub cte_count: u32,
    pub join_count: u32,
    pub inner_join_count: u32,
    pub outer_join_count: u32,
    pub cross_join_count: u32,
    pub has_select_star: bool,
    pub has_aggregate: bool,
    pub has_window_function: bool,
    pub has_group_by: bool,
    pub has_having: bool,
    pub has_order_by: bool,
    pub has_distinct: bool,
    pub has_union: bool,
    pub predicate_count: u32,
    /// Table names referenced in `FROM`/`JOIN` clauses, used by the static
    /// gate's bind check. Not considered for construct/overlap purposes.
    pub table_names: Vec<String>,
    /// Column identifiers referenced in the projection, `WHERE`, `GROUP BY`,
    /// and `HAVING` clauses (qualified references reduced to their final
    /// segment), used by the static gate's bind check. Not considered for
    /// construct/overlap purposes.
    pub column_names: Vec<String>,
    /// Coarse statement-kind tag (`"query"`, `"drop"`, `"delete"`,
    /// `"insert"`, `"update"`, `"grant"`, ...), used by the static gate to
    /// reject anything that isn't a read-only query regardless of the
    /// caller-supplied forbidden-constructs policy. Not considered for
    /// example-matching overlap.
    pub statement_kind: String,
}

impl FeatureVector {
    /// True when this feature vector shows the named construct. Construct
    /// names are the snake_case field/derived names used across knowledge
    /// corpus entries and transform policies (`"cross_join"`,
    /// `"select_star"`, `"correlated_subquery"`, ...).
    pub fn has_construct(&self, name: &str) -> bool {
        match name {
            "cross_join" => self.cross_join_count > 0,
            "outer_join" => self.outer_join_count > 0,
            "select_star" => self.has_select_star,
            "subquery" => self.subquery_count > 0,
            "cte" => self.cte_count > 0,
            "window_function" => self.has_window_function,
            "aggregate" => self.has_aggregate,
            "group_by" => self.has_group_by,
            "having" => self.has_having,
            "union" => self.has_union,
            "distinct" => self.has_distinct,
            "drop" => self.statement_kind == "drop",
            "delete" => self.statement_kind == "delete",
            "insert" => self.statement_kind == "insert",
            "update" => self.statement_kind == "update",
            "grant" => self.statement_kind == "grant",
            "revoke" => self.statement_kind == "revoke",
            "truncate" => self.statement_kind == "truncate",
            "alter" => self.statement_kind == "alter",
            "create" => self.statement_kind == "create",
            _ => false,
        }
    }

    /// Jaccard-style overlap against another feature vector's present
    /// constructs, used by the knowledge layer's example matcher.
    pub fn construct_overlap(&self, other: &FeatureVector) -> f64 {
        const CONSTRUCTS: &[&str] = &[
            "cross_join",
            "outer_join",
            "select_star",
            "subquery",
            "cte",
            "window_function",
            "aggregate",
            "group_by",
            "having",
            "union",
            "distinct",
        ];

        let (mut union, mut intersection) = (0usize, 0usize);
        for name in CONSTRUCTS {
            let a = self.has_construct(name);
            let b = other.has_construct(name);
            if a || b {
                union += 1;
            }
            if a && b {
                intersection += 1;
            }
        }

        if union == 0 {
            1.0
        } else {
            intersection as f64 / union as f64
        }
    }
}

/// Whether the statement's *top-level* query carries an `ORDER BY` and/or
/// a `LIMIT`. Unlike [`FeatureVector::has_order_by`] (which also fires for
/// a CTE or subquery's own ordering), this only looks at the outermost
/// query -- the static gate's structural-preservation check cares whether
/// the result a caller receives is still ordered/capped the way the
/// original promised, not whether some inner clause happened to sort.
pub fn top_level_ordering(statement: &Statement) -> (bool, bool) {
    match statement {
        Statement::Query(query) => (!query.order_by.is_empty(), query.limit.is_some()),
        _ => (false, false),
    }
}

/// Walks a parsed statement and produces its [`FeatureVector`].
pub fn extract(statement: &Statement) -> FeatureVector {
    let mut features = FeatureVector::default();
    features.statement_kind = classify_statement_kind(statement).to_string();
    if let Statement::Query(query) = statement {
        walk_query(query, &mut features, false);
    }
    features
}

/// Coarse statement-kind classification the static gate's forbidden-kind
/// check keys off of. Deliberately sniffed off the canonical rendering's
/// leading keyword rather than matching every DML/DDL variant's field
/// shape -- the policy only ever denies a statement *kind*, never a
/// sub-clause of one, so the AST shape of a `DROP`/`DELETE`/... statement
/// is irrelevant here.
fn classify_statement_kind(statement: &Statement) -> &'static str {
    if matches!(statement, Statement::Query(_)) {
        return "query";
    }
    let rendered = statement.to_string();
    match rendered
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
        .as_str()
    {
        "DROP" => "drop",
        "DELETE" => "delete",
        "INSERT" => "insert",
        "UPDATE" => "update",
        "GRANT" => "grant",
        "REVOKE" => "revoke",
        "TRUNCATE" => "truncate",
        "ALTER" => "alter",
        "CREATE" => "create",
        _ => "other",
    }
}

fn walk_query(query: &Query, features: &mut FeatureVector, is_subquery: bool) {
    if is_subquery {
        features.subquery_count += 1;
    }
    if let Some(with) = &query.with {
        features.cte_count += with.cte_tables.len() as u32;
        for cte in &with.cte_tables {
            walk_query(&cte.query, features, false);
        }
    }
    if !query.order_by.is_empty() {
        features.has_order_by = true;
    }
    walk_set_expr(&query.body, features);
}

fn walk_set_expr(expr: &SetExpr, features: &mut FeatureVector) {
    match expr {
        SetExpr::Select(select) => walk_select(select, features),
        SetExpr::Query(inner) => walk_query(inner, features, false),
        SetExpr::SetOperation { left, right, .. } => {
            features.has_union = true;
            walk_set_expr(left, features);
            walk_set_expr(right, features);
        }
        _ => {}
    }
}

fn walk_select(select: &Select, features: &mut FeatureVector) {
    if select.distinct.is_some() {
        features.has_distinct = true;
    }
    if let Some(having) = &select.having {
        features.has_having = true;
        walk_expr(having, features);
    }
    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) if !exprs.is_empty() => {
            features.has_group_by = true;
            for expr in exprs {
                walk_expr(expr, features);
            }
        }
        GroupByExpr::All(_) => features.has_group_by = true,
        _ => {}
    }

    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                features.has_select_star = true;
            }
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                walk_expr(expr, features);
            }
        }
    }

    if let Some(selection) = &select.selection {
        count_predicates(selection, features);
        walk_expr(selection, features);
    }

    for twj in &select.from {
        walk_table_with_joins(twj, features);
    }
}

fn walk_table_with_joins(twj: &TableWithJoins, features: &mut FeatureVector) {
    walk_table_factor(&twj.relation, features);
    for join in &twj.joins {
        features.join_count += 1;
        classify_join(join, features);
        walk_table_factor(&join.relation, features);
    }
}

fn classify_join(join: &Join, features: &mut FeatureVector) {
    match &join.join_operator {
        JoinOperator::Inner(_) => features.inner_join_count += 1,
        JoinOperator::LeftOuter(_)
        | JoinOperator::RightOuter(_)
        | JoinOperator::FullOuter(_) => features.outer_join_count += 1,
        JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => {
            features.cross_join_count += 1;
        }
        _ => {}
    }
}

fn walk_table_factor(factor: &TableFactor, features: &mut FeatureVector) {
    match factor {
        TableFactor::Table { name, .. } => {
            features.table_count += 1;
            if let Some(ident) = name.0.last() {
                features.table_names.push(ident.value.clone());
            }
        }
        TableFactor::Derived { subquery, .. } => {
            walk_query(subquery, features, true);
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            walk_table_with_joins(table_with_joins, features);
        }
        _ => {}
    }
}

fn walk_expr(expr: &Expr, features: &mut FeatureVector) {
    match expr {
        Expr::Identifier(ident) => {
            features.column_names.push(ident.value.clone());
        }
        Expr::CompoundIdentifier(idents) => {
            if let Some(last) = idents.last() {
                features.column_names.push(last.value.clone());
            }
        }
        Expr::Function(func) => {
            let name = func.name.to_string().to_ascii_lowercase();
            if matches!(name.as_str(), "count" | "sum" | "avg" | "min" | "max") {
                features.has_aggregate = true;
            }
            if func.over.is_some() {
                features.has_window_function = true;
            }
        }
        Expr::Subquery(query) | Expr::InSubquery { subquery: query, .. } => {
            walk_query(query, features, true);
        }
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, features);
            walk_expr(right, features);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::IsNull(expr) => {
            walk_expr(expr, features);
        }
        _ => {}
    }
}

fn count_predicates(expr: &Expr, features: &mut FeatureVector) {
    match expr {
        Expr::BinaryOp { left, op, right } => {
            use sqlparser::ast::BinaryOperator::{And, Or};
            if matches!(op, And | Or) {
                count_predicates(left, features);
                count_predicates(right, features);
            } else {
                features.predicate_count += 1;
            }
        }
        _ => features.predicate_count += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{SqlDialectParser, SqlparserDialectParser};

    fn features_for(sql: &str) -> FeatureVector {
        let parser = SqlparserDialectParser::new();
        let parsed = parser.parse(sql, "generic").unwrap();
        extract(&parsed.statement)
    }

    #[test]
    fn detects_select_star() {
        let f = features_for("SELECT * FROM orders");
        assert!(f.has_select_star);
    }

    #[test]
    fn detects_cross_join() {
        let f = features_for("SELECT * FROM a CROSS JOIN b");
        assert_eq!(f.cross_join_count, 1);
    }

    #[test]
    fn detects_correlated_subquery() {
        let f = features_for(
            "SELECT id FROM orders o WHERE EXISTS (SELECT 1 FROM items i WHERE i.order_id = o.id)",
        );
        assert!(f.subquery_count >= 1);
    }

    #[test]
    fn detects_cte() {
        let f = features_for("WITH recent AS (SELECT * FROM orders) SELECT * FROM recent");
        assert_eq!(f.cte_count, 1);
    }

    #[test]
    fn counts_conjunctive_predicates_separately() {
        let f = features_for("SELECT * FROM orders WHERE a = 1 AND b = 2 AND c = 3");
        assert_eq!(f.predicate_count, 3);
    }

    #[test]
    fn extracts_referenced_column_names() {
        let f = features_for("SELECT id, total FROM orders o WHERE o.status = 1 GROUP BY id HAVING total > 0");
        assert!(f.column_names.contains(&"id".to_string()));
        assert!(f.column_names.contains(&"total".to_string()));
        assert!(f.column_names.contains(&"status".to_string()));
    }

    #[test]
    fn construct_overlap_is_one_for_identical_vectors() {
        let f = features_for("SELECT * FROM orders WHERE a = 1");
        assert_eq!(f.construct_overlap(&f), 1.0);
    }
}
