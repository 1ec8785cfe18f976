//! Cypher statement generation.
//!
//! Statements are data: text with `$name` parameter references plus a JSON
//! parameter map the executor binds through the host driver. No value is
//! ever spliced into statement text, which is what keeps identifiers with
//! quotes, backslashes and dollar signs from breaking anything.

use serde_json::{Map, Value};

/// Node and edge label values. Labels are plain properties in this engine,
/// so these are data, not syntax.
pub mod labels {
    pub const DATABASE: &str = "Database";
    pub const SCHEMA: &str = "Schema";
    pub const TABLE: &str = "Table";
    pub const VIEW: &str = "View";
    pub const MATERIALIZED_VIEW: &str = "MaterializedView";
    pub const COLUMN: &str = "Column";
    pub const FUNCTION: &str = "Function";
    pub const SQL_PATTERN: &str = "SqlPattern";
    pub const TEMP_TABLE: &str = "TempTable";
    pub const TEMP_COLUMN: &str = "TempColumn";

    pub const HAS_SCHEMA: &str = "HAS_SCHEMA";
    pub const HAS_OBJECT: &str = "HAS_OBJECT";
    pub const HAS_COLUMN: &str = "HAS_COLUMN";
    pub const HAS_FUNCTION: &str = "HAS_FUNCTION";
    pub const REFERENCES_COLUMN: &str = "REFERENCES_COLUMN";
    pub const DATA_FLOW: &str = "DATA_FLOW";
    pub const GENERATES_FLOW: &str = "GENERATES_FLOW";
    pub const READS_FROM: &str = "READS_FROM";
    pub const WRITES_TO: &str = "WRITES_TO";
}

pub type Props = Map<String, Value>;

/// One cypher statement plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CypherStatement {
    pub text: String,
    pub params: Props,
}

impl CypherStatement {
    fn new(text: String, params: Props) -> Self {
        debug_assert!(
            params.keys().all(|k| is_valid_param_name(k)),
            "invalid parameter name in {params:?}"
        );
        Self { text, params }
    }
}

/// Match / conditional-create / unconditional-set, one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPlan {
    /// Returns a row iff the entity already exists.
    pub probe: CypherStatement,
    /// Executed only when the probe came back empty.
    pub create: CypherStatement,
    /// Always executed; must not touch create-only attributes.
    pub apply: CypherStatement,
}

/// A node upsert keyed by FQN alone.
///
/// Matching ignores the label so the two producers converge on one node per
/// FQN: the metadata builder's `apply` carries the authoritative label and
/// thereby upgrades stubs the lineage builder created first.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub fqn: String,
    /// Label written on create (and by whoever owns it, on apply).
    pub label: String,
    pub create_props: Props,
    pub set_props: Props,
}

/// An edge upsert keyed by `(source_fqn, label [, key_props], target_fqn)`.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub label: String,
    pub source_fqn: String,
    pub target_fqn: String,
    /// Extra identity properties (e.g. `sql_hash` on `DATA_FLOW`).
    pub key_props: Props,
    pub create_props: Props,
    pub set_props: Props,
}

/// Convenience for building property maps.
pub fn props<const N: usize>(entries: [(&str, Value); N]) -> Props {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub fn node_upsert(spec: NodeSpec) -> UpsertPlan {
    let probe = CypherStatement::new(
        "MATCH (n {fqn: $fqn}) RETURN n.fqn".to_string(),
        props([("fqn", Value::String(spec.fqn.clone()))]),
    );

    let mut create_params = spec.create_props;
    create_params.insert("fqn".to_string(), Value::String(spec.fqn.clone()));
    create_params.insert("label".to_string(), Value::String(spec.label));
    let create = CypherStatement::new(
        format!("CREATE (n {{{}}})", property_map(&create_params)),
        create_params,
    );

    let mut apply_params = spec.set_props;
    let assignments = set_assignments("n", &apply_params);
    apply_params.insert("fqn".to_string(), Value::String(spec.fqn));
    let apply = CypherStatement::new(
        format!("MATCH (n {{fqn: $fqn}}) SET {assignments}"),
        apply_params,
    );

    UpsertPlan {
        probe,
        create,
        apply,
    }
}

pub fn edge_upsert(spec: EdgeSpec) -> UpsertPlan {
    let mut edge_key = spec.key_props.clone();
    edge_key.insert("label".to_string(), Value::String(spec.label.clone()));
    let edge_pattern = property_map(&edge_key);

    let mut probe_params = edge_key.clone();
    probe_params.insert("src_fqn".to_string(), Value::String(spec.source_fqn.clone()));
    probe_params.insert("dst_fqn".to_string(), Value::String(spec.target_fqn.clone()));
    let probe = CypherStatement::new(
        format!(
            "MATCH (a {{fqn: $src_fqn}})-[e {{{edge_pattern}}}]->(b {{fqn: $dst_fqn}}) RETURN e.label"
        ),
        probe_params,
    );

    let mut create_edge_props = edge_key.clone();
    for (key, value) in &spec.create_props {
        create_edge_props.insert(key.clone(), value.clone());
    }
    let create_pattern = property_map(&create_edge_props);
    let mut create_params = create_edge_props;
    create_params.insert("src_fqn".to_string(), Value::String(spec.source_fqn.clone()));
    create_params.insert("dst_fqn".to_string(), Value::String(spec.target_fqn.clone()));
    let create = CypherStatement::new(
        format!(
            "MATCH (a {{fqn: $src_fqn}}), (b {{fqn: $dst_fqn}}) \
             CREATE (a)-[e {{{create_pattern}}}]->(b)"
        ),
        create_params,
    );

    let mut apply_params = spec.set_props;
    let assignments = set_assignments("e", &apply_params);
    for (key, value) in edge_key {
        apply_params.insert(key, value);
    }
    apply_params.insert("src_fqn".to_string(), Value::String(spec.source_fqn));
    apply_params.insert("dst_fqn".to_string(), Value::String(spec.target_fqn));
    let apply = CypherStatement::new(
        format!(
            "MATCH (a {{fqn: $src_fqn}})-[e {{{edge_pattern}}}]->(b {{fqn: $dst_fqn}}) \
             SET {assignments}"
        ),
        apply_params,
    );

    UpsertPlan {
        probe,
        create,
        apply,
    }
}

/// `key: $key, other: $other` — every value is a parameter reference.
fn property_map(params: &Props) -> String {
    params
        .keys()
        .map(|key| format!("{key}: ${key}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `n.key = $key, n.other = $other`
fn set_assignments(var: &str, params: &Props) -> String {
    params
        .keys()
        .map(|key| format!("{var}.{key} = ${key}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_valid_param_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Dollar-quote `text` for embedding in the host SQL, choosing a tag that
/// does not collide with anything inside the statement (identifiers and
/// parameters may legitimately contain `$`).
pub fn dollar_quote(text: &str) -> String {
    let mut tag = "cypher".to_string();
    let mut counter = 0;
    while text.contains(&format!("${tag}$")) {
        counter += 1;
        tag = format!("cypher{counter}");
    }
    format!("${tag}$ {text} ${tag}$")
}

/// Escape a graph name for use as a SQL string literal.
pub fn quote_literal(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}
