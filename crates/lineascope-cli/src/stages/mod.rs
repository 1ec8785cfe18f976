//! Stage drivers: one async entry point per pipeline stage.
//!
//! An external scheduler (cron, systemd timers, an orchestrator) invokes
//! these through the CLI on whatever cadence fits; each driver processes one
//! batch and returns.

pub mod aggregate;
pub mod analyze;
pub mod graph;
pub mod sweep;
