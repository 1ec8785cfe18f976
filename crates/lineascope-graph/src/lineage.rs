//! The lineage graph builder: validated documents → flow edges.
//!
//! Claims `COMPLETED_SUCCESS` patterns not yet loaded (row-locked,
//! skip-locked), turns each stored document into an ordered upsert plan and
//! applies it in one graph transaction. Endpoints are materialised before
//! any edge references them; endpoints created here are stubs — labelled
//! `TempTable`/`TempColumn`, marked `sourced_by = 'lineage'`, carrying the
//! document's claimed kind — for the metadata builder to upgrade on its next
//! refresh. Structural attributes are never written on match.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use lineascope_core::{
    column_fqn, database_fqn, object_fqn, schema_fqn, LineageDocument, ObjectKind,
};
use lineascope_store::{PatternStore, RetryPolicy, SqlPatternRow};
use serde_json::json;
use tracing::{error, info, warn};

use crate::age::AgeClient;
use crate::cypher::{edge_upsert, labels, node_upsert, props, EdgeSpec, NodeSpec, UpsertPlan};
use crate::error::GraphError;

#[derive(Debug, Default, Clone)]
pub struct LineageBuildReport {
    pub claimed: u64,
    pub loaded: u64,
    pub failed: u64,
}

pub struct LineageGraphBuilder {
    patterns: PatternStore,
    age: AgeClient,
    conflict_retry: RetryPolicy,
}

impl LineageGraphBuilder {
    pub fn new(patterns: PatternStore, age: AgeClient, conflict_retry: RetryPolicy) -> Self {
        Self {
            patterns,
            age,
            conflict_retry,
        }
    }

    /// Load one claimed batch. Every pattern either converges the graph and
    /// flips `loaded_to_graph`, or records its error and stays eligible.
    pub async fn run(&self, batch_size: i64) -> Result<LineageBuildReport, GraphError> {
        let mut claimed = self.patterns.claim_for_graph_load(batch_size).await?;
        let rows = claimed.rows.clone();
        let mut report = LineageBuildReport {
            claimed: rows.len() as u64,
            ..LineageBuildReport::default()
        };

        for row in &rows {
            match self.load_pattern(row).await {
                Ok(()) => {
                    claimed.mark_loaded(&row.sql_hash).await?;
                    report.loaded += 1;
                }
                Err(graph_error) => {
                    error!(
                        sql_hash = %row.sql_hash,
                        error = %graph_error,
                        "lineage graph load failed"
                    );
                    claimed
                        .mark_load_failed(&row.sql_hash, &graph_error.to_string())
                        .await?;
                    report.failed += 1;
                }
            }
        }

        claimed.commit().await?;
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                loaded = report.loaded,
                failed = report.failed,
                "lineage graph build finished"
            );
        }
        Ok(report)
    }

    async fn load_pattern(&self, row: &SqlPatternRow) -> Result<(), GraphError> {
        let document = row.document()?.ok_or_else(|| GraphError::MissingDocument {
            sql_hash: row.sql_hash.clone(),
        })?;

        let now = Utc::now().to_rfc3339();
        let plan = plan_pattern(row, &document, &now);

        let mut attempt = 0;
        loop {
            match self.apply_plan(&plan).await {
                Ok(()) => return Ok(()),
                Err(graph_error)
                    if graph_error.is_transient()
                        && attempt + 1 < self.conflict_retry.max_attempts =>
                {
                    let delay = self.conflict_retry.delay_for_attempt(attempt);
                    warn!(
                        sql_hash = %row.sql_hash,
                        attempt,
                        ?delay,
                        "graph transaction conflicted, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(graph_error) if graph_error.is_transient() => {
                    return Err(GraphError::RetriesExhausted {
                        sql_hash: row.sql_hash.clone(),
                        attempts: attempt + 1,
                        last_error: graph_error.to_string(),
                    })
                }
                Err(graph_error) => return Err(graph_error),
            }
        }
    }

    async fn apply_plan(&self, plan: &PatternPlan) -> Result<(), GraphError> {
        let mut tx = self.age.begin().await?;
        for upsert in plan.ordered() {
            tx.apply_upsert(upsert).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Ordered plan for one pattern; stages execute strictly in field order.
#[derive(Debug, Clone)]
pub struct PatternPlan {
    pub endpoints: Vec<UpsertPlan>,
    pub pattern_node: UpsertPlan,
    pub data_flows: Vec<UpsertPlan>,
    pub generates_flows: Vec<UpsertPlan>,
    pub object_refs: Vec<UpsertPlan>,
}

impl PatternPlan {
    pub fn ordered(&self) -> impl Iterator<Item = &UpsertPlan> {
        self.endpoints
            .iter()
            .chain(std::iter::once(&self.pattern_node))
            .chain(self.data_flows.iter())
            .chain(self.generates_flows.iter())
            .chain(self.object_refs.iter())
    }
}

/// Stub label for an endpoint the document claims this kind for.
///
/// Creation only happens when the FQN matched nothing, i.e. the object is
/// not (yet) metadata-sourced — so every object stub is a `TempTable` and
/// every column stub a `TempColumn`, with the claimed kind kept as a
/// property. The metadata builder rewrites the label once the catalog
/// confirms the object.
fn stub_kind(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Table => "TABLE",
        ObjectKind::View => "VIEW",
        ObjectKind::MaterializedView => "MATERIALIZED_VIEW",
        ObjectKind::TempTable => "TEMP_TABLE",
    }
}

/// Turn one stored document into an ordered upsert plan. Pure.
pub fn plan_pattern(row: &SqlPatternRow, document: &LineageDocument, now: &str) -> PatternPlan {
    let database = &row.source_database_name;
    let db_fqn = database_fqn(database, database);
    let last_seen = row.last_seen_at.to_rfc3339();

    let obj_fqn =
        |schema: &str, name: &str| object_fqn(&schema_fqn(&db_fqn, schema), name);

    // Gather every endpoint the edges will touch. BTree containers keep the
    // plan deterministic for a given document.
    let mut objects: BTreeMap<(String, String), ObjectKind> = BTreeMap::new();
    let mut columns: BTreeSet<(String, String, String)> = BTreeSet::new();

    let mut note_object = |schema: &str, name: &str, kind: ObjectKind| {
        objects
            .entry((schema.to_string(), name.to_string()))
            .and_modify(|existing| {
                if kind == ObjectKind::TempTable {
                    *existing = kind;
                }
            })
            .or_insert(kind);
    };

    if let Some(target) = &document.target_object {
        note_object(&target.schema, &target.name, target.kind);
    }
    for reference in &document.referenced_objects {
        note_object(&reference.schema, &reference.name, reference.kind);
    }
    for entry in &document.column_level_lineage {
        if let Some((schema, name)) = entry.resolved_target(document) {
            note_object(schema, name, ObjectKind::Table);
            columns.insert((
                schema.to_string(),
                name.to_string(),
                entry.target_column.clone(),
            ));
        }
        for source in &entry.sources {
            let source_object = &source.source_object;
            note_object(&source_object.schema, &source_object.name, source_object.kind);
            if let Some(column) = &source.source_column {
                columns.insert((
                    source_object.schema.clone(),
                    source_object.name.clone(),
                    column.clone(),
                ));
            }
        }
    }

    // 1. Endpoint materialisation: objects, then their columns.
    let mut endpoints = Vec::new();
    for ((schema, name), kind) in &objects {
        endpoints.push(node_upsert(NodeSpec {
            fqn: obj_fqn(schema, name),
            label: labels::TEMP_TABLE.to_string(),
            create_props: props([
                ("name", json!(name)),
                ("schema_name", json!(schema)),
                ("database_name", json!(database)),
                ("kind", json!(stub_kind(*kind))),
                ("sourced_by", json!("lineage")),
                ("created_at", json!(now)),
            ]),
            set_props: props([("last_seen_at", json!(last_seen))]),
        }));
    }
    for (schema, object, column) in &columns {
        let parent = obj_fqn(schema, object);
        let fqn = column_fqn(&parent, column);
        endpoints.push(node_upsert(NodeSpec {
            fqn: fqn.clone(),
            label: labels::TEMP_COLUMN.to_string(),
            create_props: props([
                ("name", json!(column)),
                ("database_name", json!(database)),
                ("sourced_by", json!("lineage")),
                ("created_at", json!(now)),
            ]),
            set_props: props([("last_seen_at", json!(last_seen))]),
        }));
        endpoints.push(edge_upsert(EdgeSpec {
            label: labels::HAS_COLUMN.to_string(),
            source_fqn: parent,
            target_fqn: fqn,
            key_props: props([]),
            create_props: props([("created_at", json!(now))]),
            set_props: props([("updated_at", json!(now))]),
        }));
    }

    // 2. The pattern node, keyed by hash.
    let pattern_node = node_upsert(NodeSpec {
        fqn: row.sql_hash.clone(),
        label: labels::SQL_PATTERN.to_string(),
        create_props: props([
            ("sql_hash", json!(row.sql_hash)),
            ("first_seen_at", json!(row.first_seen_at.to_rfc3339())),
            ("sourced_by", json!("lineage")),
            ("created_at", json!(now)),
        ]),
        set_props: props([
            ("normalized_sql", json!(row.normalized_sql_text)),
            ("sample_sql", json!(row.sample_raw_sql_text)),
            ("source_database_name", json!(database)),
            ("execution_count", json!(row.execution_count)),
            ("avg_duration_ms", json!(row.avg_duration_ms)),
            ("last_seen_at", json!(last_seen)),
            ("updated_at", json!(now)),
        ]),
    });

    // 3. DATA_FLOW edges; the source endpoint is the column when named, the
    // object itself for literals and source-less expressions.
    let mut data_flows = Vec::new();
    let mut generates_flows = Vec::new();
    for entry in &document.column_level_lineage {
        let Some((target_schema, target_name)) = entry.resolved_target(document) else {
            continue;
        };
        let target = column_fqn(&obj_fqn(target_schema, target_name), &entry.target_column);

        for source in &entry.sources {
            let source_object_fqn =
                obj_fqn(&source.source_object.schema, &source.source_object.name);
            let source_fqn = match &source.source_column {
                Some(column) => column_fqn(&source_object_fqn, column),
                None => source_object_fqn,
            };

            data_flows.push(edge_upsert(EdgeSpec {
                label: labels::DATA_FLOW.to_string(),
                source_fqn: source_fqn.clone(),
                target_fqn: target.clone(),
                key_props: props([("sql_hash", json!(row.sql_hash))]),
                create_props: props([("created_at", json!(now))]),
                set_props: props([
                    ("transformation_logic", json!(source.transformation_logic)),
                    ("derivation_type", json!(entry.derivation_type.as_str())),
                    ("last_seen_at", json!(last_seen)),
                ]),
            }));

            // 4. GENERATES_FLOW: a pattern cannot point at an edge, so it
            // points at the flow's target column and carries the flow key.
            generates_flows.push(edge_upsert(EdgeSpec {
                label: labels::GENERATES_FLOW.to_string(),
                source_fqn: row.sql_hash.clone(),
                target_fqn: target.clone(),
                key_props: props([
                    ("sql_hash", json!(row.sql_hash)),
                    ("flow_key", json!(format!("{source_fqn}->{target}"))),
                ]),
                create_props: props([("created_at", json!(now))]),
                set_props: props([("last_seen_at", json!(last_seen))]),
            }));
        }
    }

    // 5. READS_FROM / WRITES_TO.
    let mut object_refs = Vec::new();
    for reference in &document.referenced_objects {
        let target = obj_fqn(&reference.schema, &reference.name);
        let mut edge = |label: &str| {
            edge_upsert(EdgeSpec {
                label: label.to_string(),
                source_fqn: row.sql_hash.clone(),
                target_fqn: target.clone(),
                key_props: props([]),
                create_props: props([("created_at", json!(now))]),
                set_props: props([("last_seen_at", json!(last_seen))]),
            })
        };
        if reference.access_mode.reads() {
            object_refs.push(edge(labels::READS_FROM));
        }
        if reference.access_mode.writes() {
            object_refs.push(edge(labels::WRITES_TO));
        }
    }

    PatternPlan {
        endpoints,
        pattern_node,
        data_flows,
        generates_flows,
        object_refs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    fn pattern_row(hash: &str, document: Value) -> SqlPatternRow {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        SqlPatternRow {
            sql_hash: hash.to_string(),
            normalized_sql_text: "insert into monthly_report (ym) select ...".to_string(),
            sample_raw_sql_text:
                "INSERT INTO monthly_report(ym) SELECT TO_CHAR(d.d_date,'YYYY-MM') FROM date_dim d"
                    .to_string(),
            source_database_name: "tpcds".to_string(),
            first_seen_at: t0,
            last_seen_at: t1,
            execution_count: 7,
            total_duration_ms: 700,
            avg_duration_ms: 100.0,
            max_duration_ms: 200,
            min_duration_ms: 50,
            llm_status: "COMPLETED_SUCCESS".to_string(),
            llm_extracted_json: Some(document),
            llm_error_message: None,
            last_llm_analysis_at: Some(t1),
            loaded_to_graph: false,
            graph_load_error: None,
        }
    }

    fn function_call_document(hash: &str) -> Value {
        serde_json::json!({
            "sql_pattern_hash": hash,
            "source_database_name": "tpcds",
            "target_object": {"schema": "public", "name": "monthly_report", "type": "TABLE"},
            "column_level_lineage": [{
                "target_column": "ym",
                "sources": [{
                    "source_object": {"schema": "public", "name": "date_dim", "type": "TABLE"},
                    "source_column": "d_date",
                    "transformation_logic": "TO_CHAR(d.d_date, 'YYYY-MM')"
                }],
                "derivation_type": "FUNCTION_CALL"
            }],
            "referenced_objects": [
                {"schema": "public", "name": "date_dim", "type": "TABLE", "access_mode": "READ"},
                {"schema": "public", "name": "monthly_report", "type": "TABLE", "access_mode": "WRITE"}
            ],
            "parsing_confidence": 0.95
        })
    }

    fn plan_for(hash: &str, document: Value) -> (SqlPatternRow, PatternPlan) {
        let row = pattern_row(hash, document);
        let doc = row.document().unwrap().unwrap();
        let plan = plan_pattern(&row, &doc, "2024-06-01T00:00:00Z");
        (row, plan)
    }

    #[test]
    fn function_call_scenario_produces_expected_graph_shape() {
        let (_, plan) = plan_for("cafe", function_call_document("cafe"));

        // Objects: date_dim + monthly_report; columns: d_date + ym, each
        // column with its HAS_COLUMN anchor.
        assert_eq!(plan.endpoints.len(), 2 + 2 * 2);
        assert_eq!(plan.data_flows.len(), 1);
        assert_eq!(plan.generates_flows.len(), 1);
        assert_eq!(plan.object_refs.len(), 2);

        let flow = &plan.data_flows[0];
        assert_eq!(
            flow.probe.params["src_fqn"],
            json!("tpcds.tpcds.public.date_dim.d_date")
        );
        assert_eq!(
            flow.probe.params["dst_fqn"],
            json!("tpcds.tpcds.public.monthly_report.ym")
        );
        assert_eq!(flow.apply.params["derivation_type"], json!("FUNCTION_CALL"));
        assert!(flow.apply.params["transformation_logic"]
            .as_str()
            .unwrap()
            .contains("TO_CHAR"));

        let generates = &plan.generates_flows[0];
        assert_eq!(generates.probe.params["src_fqn"], json!("cafe"));
        assert_eq!(
            generates.probe.params["flow_key"],
            json!("tpcds.tpcds.public.date_dim.d_date->tpcds.tpcds.public.monthly_report.ym")
        );
    }

    #[test]
    fn endpoints_precede_pattern_and_edges_in_execution_order() {
        let (_, plan) = plan_for("cafe", function_call_document("cafe"));
        let ordered: Vec<_> = plan.ordered().collect();

        // Endpoint plans occupy the head of the sequence; every edge that
        // references a column comes after the column upsert.
        assert_eq!(ordered.len(), plan.endpoints.len() + 1 + 1 + 1 + 2);
        assert_eq!(ordered[plan.endpoints.len()], &plan.pattern_node);
        assert_eq!(*ordered.last().unwrap(), plan.object_refs.last().unwrap());
    }

    #[test]
    fn literal_sources_flow_from_the_object_node() {
        let document = serde_json::json!({
            "sql_pattern_hash": "beef",
            "source_database_name": "tpcds",
            "target_object": {"schema": "public", "name": "report", "type": "TABLE"},
            "column_level_lineage": [{
                "target_column": "channel",
                "sources": [
                    {
                        "source_object": {"schema": "public", "name": "store_sales", "type": "TABLE"},
                        "source_column": null,
                        "transformation_logic": "'Store'"
                    },
                    {
                        "source_object": {"schema": "public", "name": "web_sales", "type": "TABLE"},
                        "source_column": null,
                        "transformation_logic": "'Web'"
                    }
                ],
                "derivation_type": "UNION_MERGE"
            }],
            "referenced_objects": [
                {"schema": "public", "name": "store_sales", "type": "TABLE", "access_mode": "READ"},
                {"schema": "public", "name": "web_sales", "type": "TABLE", "access_mode": "READ"},
                {"schema": "public", "name": "report", "type": "TABLE", "access_mode": "WRITE"}
            ],
            "parsing_confidence": 0.9
        });
        let (_, plan) = plan_for("beef", document);

        assert_eq!(plan.data_flows.len(), 2);
        for flow in &plan.data_flows {
            let src = flow.probe.params["src_fqn"].as_str().unwrap();
            // Object endpoint, not a column: exactly four dotted segments.
            assert_eq!(src.split('.').count(), 4, "{src}");
            assert_eq!(
                flow.probe.params["dst_fqn"],
                json!("tpcds.tpcds.public.report.channel")
            );
        }
        assert_eq!(plan.apply_derivations(), vec!["UNION_MERGE", "UNION_MERGE"]);
    }

    #[test]
    fn temp_table_endpoints_become_temp_stubs() {
        let document = serde_json::json!({
            "sql_pattern_hash": "feed",
            "source_database_name": "tpcds",
            "target_object": {"schema": "pg_temp", "name": "scratch", "type": "TEMP_TABLE"},
            "column_level_lineage": [{
                "target_column": "col",
                "sources": [{
                    "source_object": {"schema": "public", "name": "orders", "type": "TABLE"},
                    "source_column": "id",
                    "transformation_logic": "direct_copy"
                }],
                "derivation_type": "DIRECT_MAPPING"
            }],
            "referenced_objects": [
                {"schema": "pg_temp", "name": "scratch", "type": "TEMP_TABLE", "access_mode": "WRITE"}
            ],
            "parsing_confidence": 0.8
        });
        let (_, plan) = plan_for("feed", document);

        let scratch = plan
            .endpoints
            .iter()
            .find(|p| p.probe.params["fqn"] == json!("tpcds.tpcds.pg_temp.scratch"))
            .expect("scratch endpoint");
        assert_eq!(scratch.create.params["label"], json!("TempTable"));
        assert_eq!(scratch.create.params["kind"], json!("TEMP_TABLE"));
        assert_eq!(scratch.create.params["sourced_by"], json!("lineage"));

        let scratch_col = plan
            .endpoints
            .iter()
            .find(|p| p.probe.params["fqn"] == json!("tpcds.tpcds.pg_temp.scratch.col"))
            .expect("scratch column endpoint");
        assert_eq!(scratch_col.create.params["label"], json!("TempColumn"));
    }

    #[test]
    fn stub_apply_never_touches_structural_attributes() {
        let (_, plan) = plan_for("cafe", function_call_document("cafe"));
        for endpoint in &plan.endpoints {
            for structural in ["label", "owner", "definition", "row_count", "created_at"] {
                assert!(
                    !endpoint.apply.params.contains_key(structural),
                    "stub apply writes {structural}"
                );
            }
        }
    }

    #[test]
    fn replanning_the_same_document_is_identical() {
        let (_, first) = plan_for("cafe", function_call_document("cafe"));
        let (_, second) = plan_for("cafe", function_call_document("cafe"));
        let a: Vec<_> = first.ordered().collect();
        let b: Vec<_> = second.ordered().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn read_write_reference_expands_to_both_edges() {
        let document = serde_json::json!({
            "sql_pattern_hash": "dead",
            "source_database_name": "db",
            "target_object": {"schema": "public", "name": "t", "type": "TABLE"},
            "column_level_lineage": [{
                "target_column": "c",
                "sources": [{
                    "source_object": {"schema": "public", "name": "t", "type": "TABLE"},
                    "source_column": "c",
                    "transformation_logic": "c + 1"
                }],
                "derivation_type": "EXPRESSION"
            }],
            "referenced_objects": [
                {"schema": "public", "name": "t", "type": "TABLE", "access_mode": "READ_WRITE"}
            ],
            "parsing_confidence": 1.0
        });
        let (_, plan) = plan_for("dead", document);

        let edge_labels: Vec<_> = plan
            .object_refs
            .iter()
            .map(|p| p.probe.params["label"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(edge_labels, vec!["READS_FROM", "WRITES_TO"]);
    }

    impl PatternPlan {
        fn apply_derivations(&self) -> Vec<String> {
            self.data_flows
                .iter()
                .map(|p| {
                    p.apply.params["derivation_type"]
                        .as_str()
                        .unwrap()
                        .to_string()
                })
                .collect()
        }
    }
}
