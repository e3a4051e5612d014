//! Error taxonomy shared by the reconciler, planner, and finalizer.
//!
//! `ConfigError` lives in `batch-config`; adapter errors live in
//! `batch-scheduler`/`batch-artifacts`. This crate only owns the errors that
//! originate in the core fold itself.

use thiserror::Error;

use crate::model::Pu;

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("PU {0} is currently live ({1}); cancel or wait before submitting")]
    PuLive(Pu, &'static str),

    #[error("{0} running/pending/stalled job(s) remain; merge requires zero")]
    JobsStillLive(usize),

    #[error("un-merged result branch(es) exist for {0:?}; re-resolving the inclusion list would orphan provenance")]
    UnmergedBranches(Vec<Pu>),

    #[error("PU {0} already has results; resubmitting would discard provenance, delete results first")]
    AlreadySucceeded(Pu),

    #[error("PU {0} has results but no matching branch is visible in the artifact store")]
    MissingBranchForSucceeded(Pu),
}

/// Non-fatal observation surfaced to the operator but never aborting the
/// command that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyWarning {
    /// `PostMortem` could not retrieve an exit reason for a historical job.
    PostMortemUnavailable { job_id: crate::model::JobId },
    /// A branch for this PU exists but the log's last line was not `SUCCESS`.
    SuccessWithoutSentinel { pu: Pu },
    /// A job ID observed live in the scheduler queue has no ledger row
    /// referencing it; the operator must resolve this manually.
    OrphanedSubmission { job_id: crate::model::JobId },
}

impl std::fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyWarning::PostMortemUnavailable { job_id } => {
                write!(f, "post-mortem unavailable for job {job_id}")
            }
            ConsistencyWarning::SuccessWithoutSentinel { pu } => write!(
                f,
                "{pu} has a result branch but its log did not end with SUCCESS"
            ),
            ConsistencyWarning::OrphanedSubmission { job_id } => {
                write!(f, "job {job_id} is live in the queue but unknown to the ledger")
            }
        }
    }
}
