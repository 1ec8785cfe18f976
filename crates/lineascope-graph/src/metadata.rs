//! The metadata graph builder: catalog snapshot → structural nodes.
//!
//! For every active data source, emits upserts in fixed containment order —
//! Database, Schemas, Objects, Columns, Functions, then FK edges — inside
//! one transaction per source. Each entity runs under a savepoint, so a
//! single rejected entity is counted and skipped while the rest of the
//! source still lands. This builder owns structural attributes and the
//! `label`, which is how stubs created by the lineage builder get upgraded
//! to their real kind on the next refresh.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use lineascope_core::{column_fqn, database_fqn, function_fqn, object_fqn, schema_fqn};
use lineascope_store::{
    ColumnMetadataRow, DataSource, FunctionMetadataRow, MetadataStore, ObjectMetadataRow,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::age::AgeClient;
use crate::cypher::{edge_upsert, labels, node_upsert, props, EdgeSpec, NodeSpec, UpsertPlan};
use crate::error::GraphError;

#[derive(Debug, Default, Clone)]
pub struct MetadataBuildReport {
    pub sources_processed: u64,
    pub sources_failed: u64,
    pub entities_processed: u64,
    pub entities_failed: u64,
}

/// One logical entity: its node plus the edges that anchor it.
#[derive(Debug, Clone)]
pub(crate) struct EntityPlan {
    pub description: String,
    pub plans: Vec<UpsertPlan>,
}

pub struct MetadataGraphBuilder {
    metadata: MetadataStore,
    age: AgeClient,
}

impl MetadataGraphBuilder {
    pub fn new(metadata: MetadataStore, age: AgeClient) -> Self {
        Self { metadata, age }
    }

    /// Refresh the structural graph from the current catalog snapshot.
    pub async fn run(&self) -> Result<MetadataBuildReport, GraphError> {
        let mut report = MetadataBuildReport::default();

        for source in self.metadata.active_sources().await? {
            match self.build_source(&source).await {
                Ok((processed, failed)) => {
                    report.sources_processed += 1;
                    report.entities_processed += processed;
                    report.entities_failed += failed;
                    info!(
                        source = %source.source_name,
                        processed,
                        failed,
                        "metadata graph refresh finished for source"
                    );
                }
                Err(graph_error) => {
                    // Transport-level trouble: the source's transaction is
                    // gone; it will be retried on the next scheduled run.
                    report.sources_failed += 1;
                    error!(
                        source = %source.source_name,
                        error = %graph_error,
                        "metadata graph refresh aborted for source"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn build_source(&self, source: &DataSource) -> Result<(u64, u64), GraphError> {
        let objects = self.metadata.objects_for_source(source.source_id).await?;
        let object_ids: Vec<i64> = objects.iter().map(|o| o.object_id).collect();
        let columns = self.metadata.columns_for_objects(&object_ids).await?;
        let functions = self.metadata.functions_for_source(source.source_id).await?;

        let now = Utc::now().to_rfc3339();
        let entities = plan_source_entities(source, &objects, &columns, &functions, &now);

        let mut tx = self.age.begin().await?;
        let mut processed = 0u64;
        let mut failed = 0u64;

        for entity in &entities {
            match tx.apply_isolated(&entity.plans).await {
                Ok(()) => processed += 1,
                Err(graph_error) if graph_error.is_transient() => return Err(graph_error),
                Err(graph_error) => {
                    failed += 1;
                    warn!(
                        entity = %entity.description,
                        error = %graph_error,
                        "skipped metadata entity"
                    );
                }
            }
        }

        tx.commit().await?;
        Ok((processed, failed))
    }
}

fn opt(value: &Option<String>) -> Value {
    value.as_ref().map(|v| json!(v)).unwrap_or(Value::Null)
}

/// Kind label for a catalog object type.
fn object_label(object_type: &str) -> &'static str {
    match object_type {
        "VIEW" => labels::VIEW,
        "MATERIALIZED VIEW" => labels::MATERIALIZED_VIEW,
        _ => labels::TABLE,
    }
}

/// Build the full, ordered entity list for one source.
///
/// Pure so the statement shapes are testable without a database.
pub(crate) fn plan_source_entities(
    source: &DataSource,
    objects: &[ObjectMetadataRow],
    columns: &[ColumnMetadataRow],
    functions: &[FunctionMetadataRow],
    now: &str,
) -> Vec<EntityPlan> {
    let mut entities = Vec::new();
    let db_fqn = database_fqn(&source.source_name, &source.database_name);

    // Database.
    entities.push(EntityPlan {
        description: format!("database {db_fqn}"),
        plans: vec![node_upsert(NodeSpec {
            fqn: db_fqn.clone(),
            label: labels::DATABASE.to_string(),
            create_props: props([("created_at", json!(now))]),
            set_props: props([
                ("label", json!(labels::DATABASE)),
                ("name", json!(source.database_name)),
                ("source_name", json!(source.source_name)),
                ("sourced_by", json!("metadata")),
                ("updated_at", json!(now)),
            ]),
        })],
    });

    // Schemas, from both objects and functions.
    let schema_names: BTreeSet<&str> = objects
        .iter()
        .map(|o| o.schema_name.as_str())
        .chain(functions.iter().map(|f| f.schema_name.as_str()))
        .collect();

    for schema_name in &schema_names {
        let fqn = schema_fqn(&db_fqn, schema_name);
        entities.push(EntityPlan {
            description: format!("schema {fqn}"),
            plans: vec![
                node_upsert(NodeSpec {
                    fqn: fqn.clone(),
                    label: labels::SCHEMA.to_string(),
                    create_props: props([("created_at", json!(now))]),
                    set_props: props([
                        ("label", json!(labels::SCHEMA)),
                        ("name", json!(schema_name)),
                        ("sourced_by", json!("metadata")),
                        ("updated_at", json!(now)),
                    ]),
                }),
                edge_upsert(EdgeSpec {
                    label: labels::HAS_SCHEMA.to_string(),
                    source_fqn: db_fqn.clone(),
                    target_fqn: fqn,
                    key_props: props([]),
                    create_props: props([("created_at", json!(now))]),
                    set_props: props([("updated_at", json!(now))]),
                }),
            ],
        });
    }

    // Objects.
    let mut object_fqns: HashMap<i64, (String, String)> = HashMap::new();
    for object in objects {
        let schema = schema_fqn(&db_fqn, &object.schema_name);
        let fqn = object_fqn(&schema, &object.object_name);
        object_fqns.insert(object.object_id, (fqn.clone(), schema.clone()));

        let kind = object_label(&object.object_type);
        entities.push(EntityPlan {
            description: format!("object {fqn}"),
            plans: vec![
                node_upsert(NodeSpec {
                    fqn: fqn.clone(),
                    label: kind.to_string(),
                    create_props: props([("created_at", json!(now))]),
                    set_props: props([
                        ("label", json!(kind)),
                        ("kind", json!(kind)),
                        ("name", json!(object.object_name)),
                        ("schema_name", json!(object.schema_name)),
                        ("database_name", json!(object.database_name)),
                        ("owner", opt(&object.owner)),
                        ("description", opt(&object.description)),
                        ("definition", opt(&object.definition)),
                        (
                            "row_count",
                            object.row_count.map(|n| json!(n)).unwrap_or(Value::Null),
                        ),
                        ("sourced_by", json!("metadata")),
                        ("updated_at", json!(now)),
                    ]),
                }),
                edge_upsert(EdgeSpec {
                    label: labels::HAS_OBJECT.to_string(),
                    source_fqn: schema,
                    target_fqn: fqn,
                    key_props: props([]),
                    create_props: props([("created_at", json!(now))]),
                    set_props: props([("updated_at", json!(now))]),
                }),
            ],
        });
    }

    // Columns.
    for column in columns {
        let Some((parent_fqn, _)) = object_fqns.get(&column.object_id) else {
            continue;
        };
        let fqn = column_fqn(parent_fqn, &column.column_name);
        entities.push(EntityPlan {
            description: format!("column {fqn}"),
            plans: vec![
                node_upsert(NodeSpec {
                    fqn: fqn.clone(),
                    label: labels::COLUMN.to_string(),
                    create_props: props([("created_at", json!(now))]),
                    set_props: props([
                        ("label", json!(labels::COLUMN)),
                        ("name", json!(column.column_name)),
                        ("ordinal_position", json!(column.ordinal_position)),
                        ("data_type", json!(column.data_type)),
                        ("is_nullable", json!(column.is_nullable)),
                        ("default_value", opt(&column.default_value)),
                        ("is_primary_key", json!(column.is_primary_key)),
                        ("is_unique", json!(column.is_unique)),
                        ("description", opt(&column.description)),
                        ("sourced_by", json!("metadata")),
                        ("updated_at", json!(now)),
                    ]),
                }),
                edge_upsert(EdgeSpec {
                    label: labels::HAS_COLUMN.to_string(),
                    source_fqn: parent_fqn.clone(),
                    target_fqn: fqn,
                    key_props: props([]),
                    create_props: props([("created_at", json!(now))]),
                    set_props: props([("updated_at", json!(now))]),
                }),
            ],
        });
    }

    // Functions.
    for function in functions {
        let schema = schema_fqn(&db_fqn, &function.schema_name);
        let fqn = function_fqn(&schema, &function.function_name, &function.parameter_types);
        entities.push(EntityPlan {
            description: format!("function {fqn}"),
            plans: vec![
                node_upsert(NodeSpec {
                    fqn: fqn.clone(),
                    label: labels::FUNCTION.to_string(),
                    create_props: props([("created_at", json!(now))]),
                    set_props: props([
                        ("label", json!(labels::FUNCTION)),
                        ("name", json!(function.function_name)),
                        ("function_type", json!(function.function_type)),
                        ("return_type", opt(&function.return_type)),
                        ("parameter_types", json!(function.parameter_types)),
                        ("language", opt(&function.language)),
                        ("owner", opt(&function.owner)),
                        ("description", opt(&function.description)),
                        ("definition", opt(&function.definition)),
                        ("sourced_by", json!("metadata")),
                        ("updated_at", json!(now)),
                    ]),
                }),
                edge_upsert(EdgeSpec {
                    label: labels::HAS_FUNCTION.to_string(),
                    source_fqn: schema,
                    target_fqn: fqn,
                    key_props: props([]),
                    create_props: props([("created_at", json!(now))]),
                    set_props: props([("updated_at", json!(now))]),
                }),
            ],
        });
    }

    // Foreign keys, last: both endpoints exist by now.
    for column in columns {
        let Some((parent_fqn, _)) = object_fqns.get(&column.object_id) else {
            continue;
        };
        let Some((fk_schema, fk_table, fk_column)) = column.fk_target() else {
            continue;
        };
        let source_column = column_fqn(parent_fqn, &column.column_name);
        let target_schema = schema_fqn(&db_fqn, fk_schema);
        let target_column = column_fqn(&object_fqn(&target_schema, fk_table), fk_column);
        let constraint = column
            .fk_constraint_name
            .clone()
            .unwrap_or_else(|| format!("fk_{}", column.column_name));

        entities.push(EntityPlan {
            description: format!("fk {source_column} -> {target_column}"),
            plans: vec![edge_upsert(EdgeSpec {
                label: labels::REFERENCES_COLUMN.to_string(),
                source_fqn: source_column,
                target_fqn: target_column,
                key_props: props([]),
                create_props: props([("created_at", json!(now))]),
                set_props: props([
                    ("constraint_name", json!(constraint)),
                    ("updated_at", json!(now)),
                ]),
            })],
        });
    }

    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixture() -> (
        DataSource,
        Vec<ObjectMetadataRow>,
        Vec<ColumnMetadataRow>,
        Vec<FunctionMetadataRow>,
    ) {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let source = DataSource {
            source_id: 1,
            source_name: "prod_pg".to_string(),
            database_name: "sales".to_string(),
            search_path: vec!["public".to_string()],
            is_active: true,
        };
        let objects = vec![
            ObjectMetadataRow {
                object_id: 10,
                source_id: 1,
                database_name: "sales".to_string(),
                schema_name: "public".to_string(),
                object_name: "orders".to_string(),
                object_type: "TABLE".to_string(),
                owner: Some("etl".to_string()),
                description: None,
                definition: None,
                row_count: Some(1000),
                updated_at: t0,
            },
            ObjectMetadataRow {
                object_id: 11,
                source_id: 1,
                database_name: "sales".to_string(),
                schema_name: "reporting".to_string(),
                object_name: "v_totals".to_string(),
                object_type: "VIEW".to_string(),
                owner: None,
                description: None,
                definition: Some("SELECT 1".to_string()),
                row_count: None,
                updated_at: t0,
            },
        ];
        let columns = vec![
            ColumnMetadataRow {
                object_id: 10,
                column_name: "id".to_string(),
                ordinal_position: 1,
                data_type: "bigint".to_string(),
                is_nullable: false,
                default_value: None,
                is_primary_key: true,
                is_unique: true,
                fk_target_schema: None,
                fk_target_table: None,
                fk_target_column: None,
                fk_constraint_name: None,
                description: None,
            },
            ColumnMetadataRow {
                object_id: 10,
                column_name: "customer_id".to_string(),
                ordinal_position: 2,
                data_type: "bigint".to_string(),
                is_nullable: true,
                default_value: None,
                is_primary_key: false,
                is_unique: false,
                fk_target_schema: Some("public".to_string()),
                fk_target_table: Some("customers".to_string()),
                fk_target_column: Some("id".to_string()),
                fk_constraint_name: Some("orders_customer_fk".to_string()),
                description: None,
            },
        ];
        let functions = vec![FunctionMetadataRow {
            function_id: 20,
            source_id: 1,
            database_name: "sales".to_string(),
            schema_name: "public".to_string(),
            function_name: "total_for".to_string(),
            function_type: "FUNCTION".to_string(),
            return_type: Some("numeric".to_string()),
            parameter_types: vec!["bigint".to_string()],
            definition: Some("SELECT sum(total) FROM orders WHERE customer_id = $1".to_string()),
            language: Some("sql".to_string()),
            owner: None,
            description: None,
            updated_at: t0,
        }];
        (source, objects, columns, functions)
    }

    fn plan() -> Vec<EntityPlan> {
        let (source, objects, columns, functions) = fixture();
        plan_source_entities(&source, &objects, &columns, &functions, "2024-06-01T00:00:00Z")
    }

    #[test]
    fn entities_come_out_in_containment_order() {
        let entities = plan();
        let descriptions: Vec<&str> = entities.iter().map(|e| e.description.as_str()).collect();

        let position = |needle: &str| {
            descriptions
                .iter()
                .position(|d| d.contains(needle))
                .unwrap_or_else(|| panic!("missing entity {needle}"))
        };

        assert!(position("database prod_pg.sales") < position("schema prod_pg.sales.public"));
        assert!(position("schema prod_pg.sales.public") < position("object prod_pg.sales.public.orders"));
        assert!(position("object prod_pg.sales.public.orders") < position("column prod_pg.sales.public.orders.id"));
        assert!(position("column prod_pg.sales.public.orders.id") < position("function prod_pg.sales.public.total_for(bigint)"));
        assert!(position("function prod_pg.sales.public.total_for(bigint)") < position("fk "));
    }

    #[test]
    fn both_schemas_are_discovered() {
        let entities = plan();
        assert!(entities.iter().any(|e| e.description == "schema prod_pg.sales.public"));
        assert!(entities.iter().any(|e| e.description == "schema prod_pg.sales.reporting"));
    }

    #[test]
    fn object_apply_carries_authoritative_label_and_attributes() {
        let entities = plan();
        let orders = entities
            .iter()
            .find(|e| e.description == "object prod_pg.sales.public.orders")
            .unwrap();
        let node = &orders.plans[0];

        assert!(node.apply.text.contains("n.label = $label"));
        assert_eq!(node.apply.params["label"], json!("Table"));
        assert_eq!(node.apply.params["owner"], json!("etl"));
        assert_eq!(node.apply.params["row_count"], json!(1000));
        assert_eq!(node.apply.params["sourced_by"], json!("metadata"));
        // created_at belongs to whoever created the node first.
        assert!(!node.apply.params.contains_key("created_at"));
        assert!(node.create.params.contains_key("created_at"));
    }

    #[test]
    fn view_gets_its_own_kind() {
        let entities = plan();
        let view = entities
            .iter()
            .find(|e| e.description == "object prod_pg.sales.reporting.v_totals")
            .unwrap();
        assert_eq!(view.plans[0].apply.params["label"], json!("View"));
        assert_eq!(view.plans[0].apply.params["definition"], json!("SELECT 1"));
    }

    #[test]
    fn fk_edge_connects_column_fqns_with_constraint_name() {
        let entities = plan();
        let fk = entities
            .iter()
            .find(|e| e.description.starts_with("fk "))
            .unwrap();
        let edge = &fk.plans[0];
        assert_eq!(
            edge.probe.params["src_fqn"],
            json!("prod_pg.sales.public.orders.customer_id")
        );
        assert_eq!(
            edge.probe.params["dst_fqn"],
            json!("prod_pg.sales.public.customers.id")
        );
        assert_eq!(edge.apply.params["constraint_name"], json!("orders_customer_fk"));
    }

    #[test]
    fn function_fqn_disambiguates_by_parameter_types() {
        let entities = plan();
        assert!(entities
            .iter()
            .any(|e| e.description == "function prod_pg.sales.public.total_for(bigint)"));
    }
}
