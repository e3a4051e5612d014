//! Finalizer (C8): preconditions and verification around the chunked
//! branch merge the artifact store adapter performs.

use tracing::{info, warn};

use crate::adapter::{AdapterError, ArtifactStore, MergeReport};
use crate::error::PreconditionError;
use crate::ledger::Ledger;
use crate::model::Pu;

pub const DEFAULT_CHUNK_SIZE: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Preconditions for finalizing: zero live jobs, and every `has_results` row
/// must have a matching branch visible in the store.
pub async fn check_preconditions(ledger: &Ledger, store: &dyn ArtifactStore) -> Result<(), FinalizeError> {
    let live_count = ledger
        .iter()
        .filter(|r| r.submitted && !r.has_results && matches!(r.state_category, Some(cat) if cat.as_str() != "unknown"))
        .count();
    if live_count > 0 {
        warn!(live_count, "refusing to finalize, jobs still live");
        return Err(PreconditionError::JobsStillLive(live_count).into());
    }

    for row in ledger.iter().filter(|r| r.has_results) {
        if !store.branch_exists_for(&row.pu).await? {
            warn!(pu = %row.pu, "refusing to finalize, succeeded PU has no matching branch");
            return Err(PreconditionError::MissingBranchForSucceeded(row.pu.clone()).into());
        }
    }
    Ok(())
}

/// Run the finalizer: check preconditions, delegate the chunked merge to
/// the artifact store, then verify mainline holds exactly one artifact per
/// succeeded PU. A partial merge failure is not an error — the adapter's
/// `MergeReport` carries `pending_branches` and the repository is left in
/// its last-good state for retry.
pub async fn finalize(
    ledger: &Ledger,
    store: &dyn ArtifactStore,
    chunk_size: usize,
) -> Result<MergeReport, FinalizeError> {
    check_preconditions(ledger, store).await?;

    info!(chunk_size, "merging result branches");
    let report = store.merge_branches(chunk_size).await?;

    if report.is_complete() {
        verify_one_artifact_per_succeeded_pu(ledger, store).await?;
        info!(chunks = report.merged_chunks.len(), "merge complete");
    } else {
        warn!(
            pending = report.pending_branches.len(),
            "merge left branches pending, repository left in last-good state for retry"
        );
    }

    Ok(report)
}

async fn verify_one_artifact_per_succeeded_pu(
    ledger: &Ledger,
    store: &dyn ArtifactStore,
) -> Result<(), FinalizeError> {
    let remaining_branches = store.list_result_branches().await?;
    let succeeded: Vec<&Pu> = ledger.iter().filter(|r| r.has_results).map(|r| &r.pu).collect();

    // After a complete merge, branches are deleted; any branch still naming
    // a succeeded PU indicates the merge didn't actually absorb it.
    for pu in &succeeded {
        let components = pu.components();
        if remaining_branches
            .iter()
            .any(|name| crate::adapter::parse_branch_components(name) == Some(components.clone()))
        {
            return Err(PreconditionError::MissingBranchForSucceeded((*pu).clone()).into());
        }
    }
    Ok(())
}
