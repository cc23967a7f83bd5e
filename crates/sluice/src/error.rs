//! Engine error taxonomy.
//!
//! Configuration/validation errors are raised synchronously to the caller of
//! the mutating operation before any state change. A global failure flag
//! turns retry loops into fatal [`EngineError::EngineFailed`] aborts.
//! Operator shutdown errors during shrink/release are collected and logged,
//! never letting one failure abort the batch.

use thiserror::Error;

/// Errors surfaced by the engine. See the module docs for the recovery
/// policy per group.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("region {region_id} not found")]
    RegionNotFound { region_id: u32 },

    #[error("region {region_id} is already created")]
    RegionAlreadyExists { region_id: u32 },

    #[error("invalid region execution plan for region {region_id}: {reason}")]
    InvalidExecutionPlan { region_id: u32, reason: String },

    #[error("invalid pipeline ids to merge: {reason}")]
    InvalidMerge { reason: String },

    #[error("invalid split of pipeline {pipeline}: {reason}")]
    InvalidSplit { pipeline: String, reason: String },

    #[error("cannot rebalance region {region_id}: {reason}")]
    InvalidRebalance { region_id: u32, reason: String },

    #[error("{replica}: cannot {requested} while a {pending} command is pending")]
    CommandConflict {
        replica: String,
        requested: &'static str,
        pending: &'static str,
    },

    #[error("{replica}: cannot {requested} in status {status}")]
    IllegalCommand {
        replica: String,
        requested: &'static str,
        status: &'static str,
    },

    /// The global failure flag was observed while retrying a queue offer.
    /// Whatever set the flag is the root cause; this abort just stops the
    /// retry loop from spinning forever.
    #[error("engine failure flag is set, aborting downstream send")]
    EngineFailed,

    #[error("{replica} attempted to send downstream after it stopped sending")]
    SendAfterStopped { replica: String },

    #[error("operator {operator_id} failed: {cause}")]
    OperatorFailed {
        operator_id: String,
        cause: anyhow::Error,
    },

    #[error("{replica} terminated abnormally: {reason}")]
    AbnormalTermination { replica: String, reason: String },
}

/// One failed operator shutdown, reported by the best-effort teardown loops
/// of shrink and release.
#[derive(Debug)]
pub struct OperatorShutdownFailure {
    pub operator_id: String,
    pub error: anyhow::Error,
}
