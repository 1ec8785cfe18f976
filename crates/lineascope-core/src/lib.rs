//! Core building blocks of the lineascope pipeline.
//!
//! Everything in this crate is pure CPU work: parsing SQL, normalising it
//! into a stable fingerprint, extracting object references for prompt
//! context, and modelling/validating the lineage document an LLM returns.
//! I/O (database, HTTP) lives in the sibling crates.

pub mod document;
pub mod error;
pub mod fingerprint;
pub mod fqn;
pub mod references;

pub use document::{
    AccessMode, ColumnLineage, DerivationType, LineageDocument, LineageSource, ObjectKind,
    ObjectRefDoc, ReferencedObject,
};
pub use error::{DocumentError, RejectReason, RejectedStatement};
pub use fingerprint::{fingerprint, Fingerprint, StatementKind};
pub use fqn::{column_fqn, database_fqn, function_fqn, object_fqn, schema_fqn};
pub use references::{collect_object_refs, ObjectRef, RefRole};
