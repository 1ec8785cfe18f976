//! Stage: claim hygiene.

use anyhow::Result;
use lineascope_store::PatternStore;
use tracing::info;

pub async fn run(
    patterns: &PatternStore,
    grace: chrono::Duration,
    reset_failed: bool,
) -> Result<()> {
    let stale = patterns.reset_stale_in_progress(grace).await?;
    info!(stale, "sweep reset stale claims");

    if reset_failed {
        let reset = patterns.reset_failed().await?;
        info!(reset, "sweep reset failed patterns to PENDING");
    }
    Ok(())
}
