//! CLI argument parsing using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// lineascope - PostgreSQL query logs to a column-level lineage graph
#[derive(Parser, Debug)]
#[command(name = "lineascope")]
#[command(about = "Fingerprint SQL logs, extract lineage with an LLM, build the graph", long_about = None)]
#[command(version)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "lineascope.toml", value_name = "FILE")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drain captured logs and metadata definitions into sql patterns
    Aggregate,

    /// Claim pending patterns and extract lineage with the LLM
    Analyze,

    /// Refresh structural graph nodes from the catalog snapshot
    GraphMetadata,

    /// Load completed lineage documents into the graph
    GraphLineage,

    /// Run all four stages once, in pipeline order
    Run,

    /// Reset stale IN_PROGRESS claims (and, on request, failed patterns)
    Sweep {
        /// Also reset FAILED_PARSE / FAILED_LLM patterns to PENDING
        #[arg(long)]
        reset_failed: bool,
    },

    /// Fingerprint SQL from a file (or stdin) and print the result
    Fingerprint {
        /// SQL file; reads stdin when omitted
        file: Option<PathBuf>,
    },
}
