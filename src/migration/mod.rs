//! Reconciliation of the scripts directory against the ledger, and the
//! engine that applies the result.

pub mod engine;
pub mod reconcile;

use serde::Serialize;

pub use engine::{Engine, Halt, RunReport, RunState};
pub use reconcile::{reconcile, OrphanedPair, PlanSummary, ReconcileError, Reconciliation};

/// Whether the engine runs scripts itself or leaves them for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run scripts through the external runner.
    Execute,
    /// Copy scripts to the staging area for manual execution.
    Stage,
}
