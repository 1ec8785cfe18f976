//! SQL fingerprinting: normalise a statement and hash it.
//!
//! Two log entries that differ only in literal values, whitespace, comments
//! or keyword casing must land on the same fingerprint; any change to
//! identifiers, join structure, projected columns or operators must produce
//! a different one. Normalisation therefore goes through the PostgreSQL
//! parser rather than string surgery:
//!
//! 1. parse with the PostgreSQL dialect,
//! 2. replace every literal with a typed placeholder (`:str`, `:num`,
//!    `:bool`, `:null`), collapsing all-constant `IN` lists to `:list`,
//! 3. re-emit the AST (single-line, comment-free, stable spacing),
//! 4. lowercase keywords over the token stream, leaving identifier case and
//!    quoting untouched,
//! 5. hash the result with SHA-256 (hex).
//!
//! Statements that carry no data flow — session settings, transaction
//! control, bare DDL, diagnostics — are rejected with a classified reason
//! before any of this happens and never become patterns.

use std::ops::ControlFlow;

use sha2::{Digest, Sha256};
use sqlparser::ast::{visit_expressions_mut, Expr, Statement, UnaryOperator, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::error::{RejectReason, RejectedStatement};

/// The shape of a statement we extract lineage from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Copy,
    CreateTableAs,
    CreateView,
    CreateMaterializedView,
}

impl StatementKind {
    /// Whether the statement writes into a target object.
    pub fn is_write(self) -> bool {
        !matches!(self, StatementKind::Select)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Merge => "MERGE",
            StatementKind::Copy => "COPY",
            StatementKind::CreateTableAs => "CREATE_TABLE_AS",
            StatementKind::CreateView => "CREATE_VIEW",
            StatementKind::CreateMaterializedView => "CREATE_MATERIALIZED_VIEW",
        }
    }
}

/// A normalised statement and its content-addressed hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub normalized_sql: String,
    /// Hex SHA-256 of `normalized_sql`. Never recomputed once a pattern row
    /// exists; the hash is the pattern's identity.
    pub sql_hash: String,
    pub kind: StatementKind,
}

/// Normalise and hash a raw SQL statement.
pub fn fingerprint(raw_sql: &str) -> Result<Fingerprint, RejectedStatement> {
    let trimmed = raw_sql.trim();
    if trimmed.is_empty() {
        return Err(RejectedStatement::new(RejectReason::Empty, "empty input"));
    }

    if let Some(reason) = reject_by_leading_keyword(trimmed) {
        return Err(RejectedStatement::new(reason, format!("{:.60}", trimmed)));
    }

    let dialect = PostgreSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, trimmed)
        .map_err(|e| RejectedStatement::new(RejectReason::ParseFailed, e.to_string()))?;

    let mut statement = match statements.len() {
        0 => {
            return Err(RejectedStatement::new(
                RejectReason::Empty,
                "no statement after comments",
            ))
        }
        1 => statements.remove(0),
        n => {
            return Err(RejectedStatement::new(
                RejectReason::MultipleStatements,
                format!("{n} statements in one entry"),
            ))
        }
    };

    let kind = classify(&statement)?;
    mask_literals(&mut statement);

    let normalized_sql = lowercase_keywords(&statement.to_string());
    let sql_hash = hash_normalized(&normalized_sql);

    Ok(Fingerprint {
        normalized_sql,
        sql_hash,
        kind,
    })
}

/// Hex SHA-256 of the normalised text.
pub fn hash_normalized(normalized_sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cheap pre-parse filter on the first keyword.
///
/// Mirrors the reject list for statements that can never carry column-level
/// data flow. Anything that survives still goes through the real parser and
/// [`classify`], so false negatives here only cost a parse.
fn reject_by_leading_keyword(sql: &str) -> Option<RejectReason> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize().ok()?;
    let first = tokens.iter().find_map(|t| match t {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_ascii_uppercase()),
        Token::Whitespace(_) => None,
        _ => Some(String::new()),
    })?;

    match first.as_str() {
        "SET" | "RESET" => Some(RejectReason::SessionSetting),
        "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "ABORT" | "END" => {
            Some(RejectReason::TransactionControl)
        }
        "VACUUM" | "ANALYZE" | "ANALYSE" | "TRUNCATE" | "REINDEX" | "CLUSTER" | "CHECKPOINT" => {
            Some(RejectReason::Maintenance)
        }
        "GRANT" | "REVOKE" => Some(RejectReason::Permission),
        "SHOW" | "EXPLAIN" => Some(RejectReason::Diagnostic),
        "COMMENT" | "LISTEN" | "NOTIFY" | "UNLISTEN" | "DISCARD" | "LOCK" | "DEALLOCATE"
        | "CLOSE" | "FETCH" => Some(RejectReason::NotDataFlow),
        _ => None,
    }
}

/// Decide whether a parsed statement is a data-flow statement, and which.
fn classify(statement: &Statement) -> Result<StatementKind, RejectedStatement> {
    match statement {
        Statement::Query(_) => Ok(StatementKind::Select),
        Statement::Insert(_) => Ok(StatementKind::Insert),
        Statement::Update { .. } => Ok(StatementKind::Update),
        Statement::Delete(_) => Ok(StatementKind::Delete),
        Statement::Merge { .. } => Ok(StatementKind::Merge),
        Statement::Copy { .. } => Ok(StatementKind::Copy),
        Statement::CreateTable(create) => {
            if create.query.is_some() {
                Ok(StatementKind::CreateTableAs)
            } else {
                Err(RejectedStatement::new(
                    RejectReason::DdlOnly,
                    "CREATE TABLE without AS SELECT",
                ))
            }
        }
        Statement::CreateView { materialized, .. } => {
            if *materialized {
                Ok(StatementKind::CreateMaterializedView)
            } else {
                Ok(StatementKind::CreateView)
            }
        }
        other => Err(RejectedStatement::new(
            RejectReason::NotDataFlow,
            format!("unsupported statement: {:.60}", other.to_string()),
        )),
    }
}

/// Replace every literal in the statement with a typed placeholder.
fn mask_literals(statement: &mut Statement) {
    let _ = visit_expressions_mut(statement, |expr: &mut Expr| {
        match expr {
            // `IN (1, 2, 3)` and `IN ('a', 'b')` collapse to `IN (:list)` so
            // the list length does not split the pattern.
            Expr::InList { list, .. } if !list.is_empty() && list.iter().all(is_constant) => {
                list.clear();
                list.push(Expr::Value(Value::Placeholder(":list".to_string()).into()));
            }
            Expr::Value(value) => {
                let placeholder = match &value.value {
                    Value::Placeholder(_) => None,
                    Value::Number(_, _) => Some(":num"),
                    Value::Boolean(_) => Some(":bool"),
                    Value::Null => Some(":null"),
                    // Every remaining variant is a flavour of string literal.
                    _ => Some(":str"),
                };
                if let Some(placeholder) = placeholder {
                    value.value = Value::Placeholder(placeholder.to_string());
                }
            }
            // `DATE '2024-01-01'`, `TIMESTAMP '...'` and similar typed
            // literals carry their value outside the expression tree.
            Expr::TypedString { .. } => {
                *expr = Expr::Value(Value::Placeholder(":str".to_string()).into());
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
}

/// Literal value, possibly under a unary sign. Placeholders do not count,
/// so an already-collapsed list is left alone.
fn is_constant(expr: &Expr) -> bool {
    match expr {
        Expr::Value(v) => !matches!(v.value, Value::Placeholder(_)),
        Expr::UnaryOp {
            op: UnaryOperator::Minus | UnaryOperator::Plus,
            expr,
        } => is_constant(expr),
        _ => false,
    }
}

/// Lowercase keywords over the token stream of the re-emitted SQL.
///
/// Quoted identifiers keep their quoting and case; unquoted identifiers that
/// happen to collide with a keyword fold to lowercase, which matches how
/// PostgreSQL itself resolves them.
fn lowercase_keywords(sql: &str) -> String {
    let dialect = PostgreSqlDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens,
        // The input is AST output; if it does not re-tokenize, keep it as-is
        // rather than lose the statement.
        Err(_) => return sql.to_string(),
    };

    let mut out = String::with_capacity(sql.len());
    for token in tokens {
        match &token {
            Token::Word(w) if w.quote_style.is_none() && w.keyword != Keyword::NoKeyword => {
                out.push_str(&w.value.to_lowercase());
            }
            other => out.push_str(&other.to_string()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(sql: &str) -> String {
        fingerprint(sql).expect("fingerprint").sql_hash
    }

    #[test]
    fn deterministic() {
        let sql = "INSERT INTO monthly_report (ym) SELECT TO_CHAR(d.d_date, 'YYYY-MM') FROM date_dim d";
        assert_eq!(hash_of(sql), hash_of(sql));
    }

    #[test]
    fn literals_whitespace_and_comments_do_not_split_patterns() {
        let base = hash_of("SELECT id FROM orders WHERE total > 100 AND region = 'emea'");
        assert_eq!(
            base,
            hash_of("SELECT id FROM orders WHERE total > 250 AND region = 'apac'")
        );
        assert_eq!(
            base,
            hash_of("select  id\nfrom orders\nwhere total > 9.5 and region = 'us' -- tail comment")
        );
        assert_eq!(
            base,
            hash_of("/* lead */ SELECT id FROM orders WHERE total > 1 AND region = 'x'")
        );
    }

    #[test]
    fn in_lists_collapse_regardless_of_length() {
        let two = hash_of("SELECT id FROM orders WHERE status IN ('a', 'b')");
        let five = hash_of("SELECT id FROM orders WHERE status IN ('a', 'b', 'c', 'd', 'e')");
        let nums = hash_of("SELECT id FROM orders WHERE status IN (1, 2, 3)");
        assert_eq!(two, five);
        // Typed placeholders are deliberately erased inside IN lists, so the
        // value type does not split the pattern either.
        assert_eq!(two, nums);
    }

    #[test]
    fn identifiers_structure_and_operators_discriminate() {
        let base = hash_of("SELECT id FROM orders WHERE total > 100");
        assert_ne!(base, hash_of("SELECT id FROM order_items WHERE total > 100"));
        assert_ne!(base, hash_of("SELECT id, total FROM orders WHERE total > 100"));
        assert_ne!(base, hash_of("SELECT id FROM orders WHERE total >= 100"));
        assert_ne!(
            base,
            hash_of("SELECT id FROM orders o JOIN customers c ON o.cid = c.id WHERE total > 100")
        );
    }

    #[test]
    fn normalized_text_masks_literals_and_lowercases_keywords() {
        let fp = fingerprint("SELECT Name FROM Users WHERE age > 30 AND active = TRUE").unwrap();
        assert!(fp.normalized_sql.contains(":num"), "{}", fp.normalized_sql);
        assert!(fp.normalized_sql.contains(":bool"), "{}", fp.normalized_sql);
        assert!(fp.normalized_sql.starts_with("select "), "{}", fp.normalized_sql);
        // Identifier case preserved.
        assert!(fp.normalized_sql.contains("Users"), "{}", fp.normalized_sql);
    }

    #[test]
    fn quoted_identifier_case_is_preserved() {
        let a = fingerprint(r#"SELECT "Total" FROM report"#).unwrap();
        let b = fingerprint(r#"SELECT "total" FROM report"#).unwrap();
        assert_ne!(a.sql_hash, b.sql_hash);
        assert!(a.normalized_sql.contains(r#""Total""#));
    }

    #[test]
    fn typed_date_literals_are_masked() {
        let a = hash_of("SELECT id FROM orders WHERE d = DATE '2024-01-01'");
        let b = hash_of("SELECT id FROM orders WHERE d = DATE '2025-06-30'");
        assert_eq!(a, b);
    }

    #[test]
    fn complex_shapes_survive_normalisation() {
        for sql in [
            "WITH recent AS (SELECT id FROM orders WHERE ts > '2024-01-01') SELECT * FROM recent",
            "WITH RECURSIVE t(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM t WHERE n < 10) SELECT n FROM t",
            "SELECT 'Store' AS channel FROM store_sales UNION ALL SELECT 'Web' FROM web_sales",
            "SELECT id, SUM(total) OVER (PARTITION BY region ORDER BY ts) FROM orders",
            "SELECT o.id FROM orders o, LATERAL (SELECT max(ts) FROM events e WHERE e.oid = o.id) m",
            "SELECT id FROM orders WHERE total > (SELECT avg(total) FROM orders)",
            "CREATE VIEW v_totals AS SELECT region, SUM(total) FROM orders GROUP BY region",
            "CREATE MATERIALIZED VIEW mv_totals AS SELECT region, SUM(total) FROM orders GROUP BY region",
            "CREATE TABLE report_copy AS SELECT * FROM monthly_report",
            "INSERT INTO audit (id, who) VALUES (1, 'svc') ON CONFLICT (id) DO UPDATE SET who = 'svc'",
        ] {
            let fp = fingerprint(sql).unwrap_or_else(|e| panic!("{sql}: {e}"));
            assert!(!fp.normalized_sql.is_empty());
            assert_eq!(fp.sql_hash.len(), 64);
        }
    }

    #[test]
    fn statement_kinds() {
        assert_eq!(fingerprint("SELECT 1").unwrap().kind, StatementKind::Select);
        assert_eq!(
            fingerprint("INSERT INTO t SELECT * FROM s").unwrap().kind,
            StatementKind::Insert
        );
        assert_eq!(
            fingerprint("UPDATE t SET a = 1 WHERE id = 2").unwrap().kind,
            StatementKind::Update
        );
        assert_eq!(
            fingerprint("CREATE MATERIALIZED VIEW m AS SELECT 1").unwrap().kind,
            StatementKind::CreateMaterializedView
        );
        assert!(StatementKind::Insert.is_write());
        assert!(!StatementKind::Select.is_write());
    }

    #[test]
    fn non_data_flow_statements_are_rejected_with_reasons() {
        let cases = [
            ("", RejectReason::Empty),
            ("   \n  ", RejectReason::Empty),
            ("SET search_path TO public", RejectReason::SessionSetting),
            ("SHOW work_mem", RejectReason::Diagnostic),
            ("VACUUM ANALYZE orders", RejectReason::Maintenance),
            ("ANALYZE orders", RejectReason::Maintenance),
            ("BEGIN", RejectReason::TransactionControl),
            ("COMMIT", RejectReason::TransactionControl),
            ("ROLLBACK", RejectReason::TransactionControl),
            ("GRANT SELECT ON orders TO reporting", RejectReason::Permission),
            ("TRUNCATE orders", RejectReason::Maintenance),
        ];
        for (sql, expected) in cases {
            let err = fingerprint(sql).expect_err(sql);
            assert_eq!(err.reason, expected, "{sql}");
        }
    }

    #[test]
    fn plain_ddl_is_rejected_after_parse() {
        let err = fingerprint("CREATE TABLE t (id bigint PRIMARY KEY)").unwrap_err();
        assert_eq!(err.reason, RejectReason::DdlOnly);
    }

    #[test]
    fn multiple_statements_are_rejected() {
        let err = fingerprint("SELECT 1; SELECT 2").unwrap_err();
        assert_eq!(err.reason, RejectReason::MultipleStatements);
    }

    #[test]
    fn garbage_is_a_parse_failure() {
        let err = fingerprint("SELECTT id FROMM").unwrap_err();
        assert_eq!(err.reason, RejectReason::ParseFailed);
        assert!(!err.detail.is_empty());
    }
}
