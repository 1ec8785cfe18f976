//! Object-reference extraction for prompt context assembly.
//!
//! Walks a parsed statement and returns every table/view the statement
//! touches, with a coarse relevance role: write targets rank above objects
//! in `FROM`/`JOIN`, which rank above objects that only appear inside
//! nested subqueries. The context assembler uses the ranking to trim the
//! least relevant objects first when the prompt budget is tight.
//!
//! CTE names are tracked and excluded — they are statement-local and have no
//! catalog metadata to fetch.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_relations, CopySource, FromTable, ObjectName, Query, SetExpr, Statement, TableFactor,
    TableWithJoins,
};

/// How an object participates in the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefRole {
    /// The statement writes into this object.
    WriteTarget,
    /// Appears in a top-level `FROM` or `JOIN`.
    From,
    /// Only appears inside a derived table or expression subquery.
    Nested,
}

impl RefRole {
    /// Higher is more relevant to the prompt.
    pub fn rank(self) -> u8 {
        match self {
            RefRole::WriteTarget => 2,
            RefRole::From => 1,
            RefRole::Nested => 0,
        }
    }
}

/// A deduplicated table/view reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Schema qualifier as written; `None` when the name was unqualified.
    pub schema: Option<String>,
    pub name: String,
    pub role: RefRole,
}

/// Collect every object the statement references, highest relevance first.
pub fn collect_object_refs(statement: &Statement) -> Vec<ObjectRef> {
    let mut collector = Collector::default();
    collector.statement(statement);

    // Catch references the structural walk does not reach (subqueries inside
    // WHERE/HAVING/CASE expressions) via the generic relation visitor.
    let _ = visit_relations(statement, |name: &ObjectName| {
        collector.record(name, RefRole::Nested);
        ControlFlow::<()>::Continue(())
    });

    let mut refs: Vec<ObjectRef> = collector
        .seen
        .into_iter()
        .map(|((schema, name), role)| ObjectRef { schema, name, role })
        .collect();
    refs.sort_by(|a, b| {
        b.role
            .rank()
            .cmp(&a.role.rank())
            .then_with(|| a.name.cmp(&b.name))
    });
    refs
}

#[derive(Default)]
struct Collector {
    seen: HashMap<(Option<String>, String), RefRole>,
    cte_names: HashSet<String>,
}

impl Collector {
    fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Query(query) => self.query(query, RefRole::From),
            Statement::Insert(insert) => {
                self.record_raw(&insert.table.to_string(), RefRole::WriteTarget);
                if let Some(source) = &insert.source {
                    self.query(source, RefRole::From);
                }
            }
            Statement::Update {
                table,
                from,
                selection: _,
                ..
            } => {
                self.table_factor(&table.relation, RefRole::WriteTarget);
                for join in &table.joins {
                    self.table_factor(&join.relation, RefRole::From);
                }
                if let Some(from) = from {
                    self.update_from(from);
                }
            }
            Statement::Delete(delete) => {
                let tables = match &delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => {
                        tables
                    }
                };
                for table in tables {
                    self.table_with_joins(table, RefRole::WriteTarget);
                }
                if let Some(using) = &delete.using {
                    for table in using {
                        self.table_with_joins(table, RefRole::From);
                    }
                }
            }
            Statement::Merge { table, source, .. } => {
                self.table_factor(table, RefRole::WriteTarget);
                self.table_factor(source, RefRole::From);
            }
            Statement::Copy { source, to, .. } => {
                if let CopySource::Table { table_name, .. } = source {
                    let role = if *to {
                        RefRole::From
                    } else {
                        RefRole::WriteTarget
                    };
                    self.record(table_name, role);
                }
            }
            Statement::CreateTable(create) => {
                self.record(&create.name, RefRole::WriteTarget);
                if let Some(query) = &create.query {
                    self.query(query, RefRole::From);
                }
            }
            Statement::CreateView { name, query, .. } => {
                self.record(name, RefRole::WriteTarget);
                self.query(query, RefRole::From);
            }
            _ => {}
        }
    }

    fn query(&mut self, query: &Query, role: RefRole) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.clone());
                self.query(&cte.query, RefRole::Nested);
            }
        }
        self.set_expr(&query.body, role);
    }

    fn set_expr(&mut self, body: &SetExpr, role: RefRole) {
        match body {
            SetExpr::Select(select) => {
                if let Some(into) = &select.into {
                    self.record(&into.name, RefRole::WriteTarget);
                }
                for table in &select.from {
                    self.table_with_joins(table, role);
                }
            }
            SetExpr::Query(query) => self.query(query, role),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left, role);
                self.set_expr(right, role);
            }
            _ => {}
        }
    }

    fn table_with_joins(&mut self, table: &TableWithJoins, role: RefRole) {
        self.table_factor(&table.relation, role);
        for join in &table.joins {
            self.table_factor(&join.relation, role);
        }
    }

    fn table_factor(&mut self, factor: &TableFactor, role: RefRole) {
        match factor {
            TableFactor::Table { name, .. } => self.record(name, role),
            TableFactor::Derived { subquery, .. } => self.query(subquery, RefRole::Nested),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins, role),
            _ => {}
        }
    }

    fn update_from(&mut self, from: &sqlparser::ast::UpdateTableFromKind) {
        use sqlparser::ast::UpdateTableFromKind;
        let tables = match from {
            UpdateTableFromKind::BeforeSet(tables) | UpdateTableFromKind::AfterSet(tables) => {
                tables
            }
        };
        for table in tables {
            self.table_with_joins(table, RefRole::From);
        }
    }

    fn record(&mut self, name: &ObjectName, role: RefRole) {
        let parts: Vec<String> = name
            .0
            .iter()
            .filter_map(|part| part.as_ident().map(|ident| ident.value.clone()))
            .collect();
        self.record_parts(parts, role);
    }

    /// For the rare spots where the AST only exposes a printable name.
    fn record_raw(&mut self, name: &str, role: RefRole) {
        let parts: Vec<String> = name
            .split('.')
            .map(|part| part.trim_matches('"').to_string())
            .collect();
        self.record_parts(parts, role);
    }

    fn record_parts(&mut self, mut parts: Vec<String>, role: RefRole) {
        let name = match parts.pop() {
            Some(name) if !name.is_empty() => name,
            _ => return,
        };
        let schema = parts.pop().filter(|s| !s.is_empty());

        // CTE references are not catalog objects.
        if schema.is_none() && self.cte_names.contains(&name) {
            return;
        }

        let key = (schema, name);
        let entry = self.seen.entry(key).or_insert(role);
        if role.rank() > entry.rank() {
            *entry = role;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn refs(sql: &str) -> Vec<ObjectRef> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).expect("parse");
        collect_object_refs(&statements[0])
    }

    fn find<'a>(refs: &'a [ObjectRef], name: &str) -> &'a ObjectRef {
        refs.iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("missing ref {name}"))
    }

    #[test]
    fn insert_select_separates_target_and_sources() {
        let refs = refs("INSERT INTO monthly_report (ym) SELECT TO_CHAR(d.d_date, 'YYYY-MM') FROM date_dim d");
        assert_eq!(find(&refs, "monthly_report").role, RefRole::WriteTarget);
        assert_eq!(find(&refs, "date_dim").role, RefRole::From);
        // Target sorts first.
        assert_eq!(refs[0].name, "monthly_report");
    }

    #[test]
    fn schema_qualification_is_preserved() {
        let refs = refs("INSERT INTO reporting.monthly_report SELECT * FROM staging.raw_orders");
        assert_eq!(
            find(&refs, "monthly_report").schema.as_deref(),
            Some("reporting")
        );
        assert_eq!(find(&refs, "raw_orders").schema.as_deref(), Some("staging"));
    }

    #[test]
    fn ctes_are_excluded_but_their_sources_are_kept() {
        let refs = refs(
            "WITH recent AS (SELECT * FROM orders WHERE ts > '2024-01-01') \
             SELECT * FROM recent JOIN customers c ON c.id = recent.cid",
        );
        assert!(refs.iter().all(|r| r.name != "recent"));
        assert_eq!(find(&refs, "orders").role, RefRole::Nested);
        assert_eq!(find(&refs, "customers").role, RefRole::From);
    }

    #[test]
    fn where_subquery_tables_rank_nested() {
        let refs =
            refs("SELECT id FROM orders WHERE total > (SELECT avg(total) FROM order_history)");
        assert_eq!(find(&refs, "orders").role, RefRole::From);
        assert_eq!(find(&refs, "order_history").role, RefRole::Nested);
    }

    #[test]
    fn update_with_from_clause() {
        let refs = refs("UPDATE report r SET total = s.total FROM staging_totals s WHERE s.id = r.id");
        assert_eq!(find(&refs, "report").role, RefRole::WriteTarget);
        assert_eq!(find(&refs, "staging_totals").role, RefRole::From);
    }

    #[test]
    fn union_branches_are_all_collected() {
        let refs = refs("SELECT 'Store' AS channel FROM store_sales UNION ALL SELECT 'Web' FROM web_sales");
        assert_eq!(find(&refs, "store_sales").role, RefRole::From);
        assert_eq!(find(&refs, "web_sales").role, RefRole::From);
    }

    #[test]
    fn create_table_as_and_view_targets() {
        let refs1 = refs("CREATE TABLE report_copy AS SELECT * FROM monthly_report");
        assert_eq!(find(&refs1, "report_copy").role, RefRole::WriteTarget);
        assert_eq!(find(&refs1, "monthly_report").role, RefRole::From);

        let refs2 = refs("CREATE VIEW v AS SELECT * FROM orders");
        assert_eq!(find(&refs2, "v").role, RefRole::WriteTarget);
    }

    #[test]
    fn duplicate_references_keep_highest_role() {
        // `report` is both written and read; WriteTarget wins.
        let refs = refs("INSERT INTO report SELECT * FROM report WHERE archived");
        let report: Vec<_> = refs.iter().filter(|r| r.name == "report").collect();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].role, RefRole::WriteTarget);
    }
}
