//! Fully-qualified names — the uniqueness keys of graph nodes.
//!
//! Both graph builders key every upsert on these strings, which is what lets
//! them converge on the same node without coordination. The formulae are
//! append-only: each level extends its parent with one dotted segment.

/// `{source_name}.{db_name}`
pub fn database_fqn(source_name: &str, database_name: &str) -> String {
    format!("{source_name}.{database_name}")
}

/// `{db_fqn}.{schema_name}`
pub fn schema_fqn(database_fqn: &str, schema_name: &str) -> String {
    format!("{database_fqn}.{schema_name}")
}

/// `{schema_fqn}.{object_name}` — tables, views, materialised views.
pub fn object_fqn(schema_fqn: &str, object_name: &str) -> String {
    format!("{schema_fqn}.{object_name}")
}

/// `{object_fqn}.{column_name}`
pub fn column_fqn(object_fqn: &str, column_name: &str) -> String {
    format!("{object_fqn}.{column_name}")
}

/// `{schema_fqn}.{fn_name}({param_type_list})`
///
/// The parameter type list disambiguates overloads, matching how PostgreSQL
/// itself identifies a function.
pub fn function_fqn(schema_fqn: &str, function_name: &str, parameter_types: &[String]) -> String {
    format!(
        "{schema_fqn}.{function_name}({})",
        parameter_types.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqn_levels_nest() {
        let db = database_fqn("prod_pg", "sales");
        let schema = schema_fqn(&db, "public");
        let object = object_fqn(&schema, "orders");
        let column = column_fqn(&object, "order_id");

        assert_eq!(db, "prod_pg.sales");
        assert_eq!(schema, "prod_pg.sales.public");
        assert_eq!(object, "prod_pg.sales.public.orders");
        assert_eq!(column, "prod_pg.sales.public.orders.order_id");
    }

    #[test]
    fn function_fqn_includes_parameter_types() {
        let schema = "prod_pg.sales.public";
        assert_eq!(
            function_fqn(schema, "to_report_month", &["date".into(), "text".into()]),
            "prod_pg.sales.public.to_report_month(date,text)"
        );
        assert_eq!(
            function_fqn(schema, "refresh_all", &[]),
            "prod_pg.sales.public.refresh_all()"
        );
    }
}
