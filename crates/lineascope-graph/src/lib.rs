//! The graph plane: Apache AGE access and the two builders that converge it.
//!
//! The engine in use stores node and edge labels as a `label` property (so
//! matches read `(n {label: 'Table', fqn: $fqn})`, never `(n:Table)`) and has
//! no native upsert clause. Every upsert is therefore decomposed into three
//! statements — probe, conditional create, unconditional set — executed
//! inside one transaction. Plans are pure data ([`cypher::UpsertPlan`]);
//! only [`age::AgeClient`] touches the database, which keeps the builders'
//! statement generation unit-testable.
//!
//! Two producers write here without coordinating: the metadata builder owns
//! structural attributes (and the `label`, so it can upgrade lineage stubs),
//! the lineage builder owns lineage edges and the `sourced_by` marker. Both
//! key every node on its FQN, which is the whole convergence story.

pub mod age;
pub mod cypher;
pub mod error;
pub mod lineage;
pub mod metadata;

pub use age::{AgeClient, AgeSettings};
pub use cypher::{labels, CypherStatement, EdgeSpec, NodeSpec, Props, UpsertPlan};
pub use error::GraphError;
pub use lineage::{LineageBuildReport, LineageGraphBuilder};
pub use metadata::{MetadataBuildReport, MetadataGraphBuilder};
