//! Stages: metadata graph refresh and lineage graph load.

use anyhow::Result;
use lineascope_graph::{
    LineageBuildReport, LineageGraphBuilder, MetadataBuildReport, MetadataGraphBuilder,
};
use tracing::info;

pub async fn run_metadata(builder: &MetadataGraphBuilder) -> Result<MetadataBuildReport> {
    let report = builder.run().await?;
    info!(
        sources = report.sources_processed,
        sources_failed = report.sources_failed,
        entities = report.entities_processed,
        entities_failed = report.entities_failed,
        "metadata graph stage finished"
    );
    Ok(report)
}

pub async fn run_lineage(
    builder: &LineageGraphBuilder,
    batch_size: i64,
) -> Result<LineageBuildReport> {
    let report = builder.run(batch_size).await?;
    info!(
        claimed = report.claimed,
        loaded = report.loaded,
        failed = report.failed,
        "lineage graph stage finished"
    );
    Ok(report)
}
