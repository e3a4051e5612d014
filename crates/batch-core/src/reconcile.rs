//! Reconciler (C6): folds the ledger, the live scheduler queue, the
//! artifact store's branch namespace, and logs into an updated ledger and a
//! summary. Exact ordering of the fold is part of the contract.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, ArtifactStore, LiveJobInfo, SchedulerAdapter};
use crate::classifier::{self, ClassifyOutcome, LogPaths};
use crate::error::ConsistencyWarning;
use crate::ledger::Ledger;
use crate::model::{AlertCatalog, JobId, StateCategory};

/// Per-invocation knobs the reconciler needs but does not own: where logs
/// live, how many bytes to scan per file, and the owner tag used to filter
/// the bulk queue poll.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub log_dir: std::path::PathBuf,
    pub max_log_bytes: usize,
    pub owner: String,
    pub run_post_mortem: bool,
}

impl ReconcileOptions {
    pub fn new(log_dir: impl Into<std::path::PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            log_dir: log_dir.into(),
            max_log_bytes: classifier::DEFAULT_MAX_BYTES,
            owner: owner.into(),
            run_post_mortem: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusSummary {
    pub to_complete: usize,
    pub submitted: usize,
    pub succeeded: usize,
    pub pending: usize,
    pub running: usize,
    pub stalled: usize,
    pub failed: usize,
    pub unsubmitted: usize,
    /// Keyed by `alert_message` (or, within the "no alert found" bucket, by
    /// the post-mortem label) -> occurrence count.
    pub failure_histogram: HashMap<String, usize>,
    pub warnings: Vec<ConsistencyWarning>,
}

/// Run one reconciliation pass. Pure with respect to the cluster: only
/// reads scheduler/artifact-store/log state, only writes the ledger and
/// summary it returns. Does not submit or cancel anything.
pub async fn reconcile(
    mut ledger: Ledger,
    scheduler: &dyn SchedulerAdapter,
    store: &dyn ArtifactStore,
    fs: &dyn crate::adapter::Filesystem,
    catalog: &AlertCatalog,
    options: &ReconcileOptions,
) -> Result<(Ledger, StatusSummary), AdapterError> {
    debug!(owner = %options.owner, "polling scheduler queue");
    let live = scheduler.poll_all(&options.owner).await?;
    let branches = store.list_result_branches().await?;
    debug!(live = live.len(), branches = branches.len(), "reconciling against current queue/branch state");

    let mut summary = StatusSummary {
        to_complete: ledger.len(),
        ..Default::default()
    };

    let pus_in_list: Vec<_> = ledger.iter().map(|r| r.pu.clone()).collect();

    for pu in &pus_in_list {
        let row = ledger.get_mut(pu).expect("row was just enumerated from this ledger");

        if !row.submitted {
            summary.unsubmitted += 1;
            continue;
        }
        summary.submitted += 1;

        let has_branch = branches
            .iter()
            .any(|name| crate::adapter::parse_branch_components(name) == Some(pu.components()));

        if has_branch {
            row.clear_live_and_log_fields();
            row.has_results = true;
            row.is_failed = Some(false);

            let logs = classifier::resolve_log_paths(&options.log_dir, row.job_id, row.task_id);
            let classification = classifier::classify(fs, &logs, catalog, options.max_log_bytes);
            apply_classification(row, &logs, &classification);
            if !classifier::reached_success_sentinel(&classification.last_stdout_line) {
                warn!(%pu, "result branch present but log did not end with the success sentinel");
                summary.warnings.push(ConsistencyWarning::SuccessWithoutSentinel { pu: pu.clone() });
            }

            debug!(%pu, job_id = %row.job_id, "result branch found, marking succeeded");
            summary.succeeded += 1;
            continue;
        }

        if let Some(info) = live.get(&row.job_id) {
            copy_live_fields(row, info);
            row.has_results = false;
            row.is_failed = Some(false);

            if info.state_category == StateCategory::Running {
                let logs = classifier::resolve_log_paths(&options.log_dir, row.job_id, row.task_id);
                let classification = classifier::classify(fs, &logs, catalog, options.max_log_bytes);
                apply_classification(row, &logs, &classification);
            } else {
                row.alert_message = None;
            }

            debug!(%pu, job_id = %row.job_id, state = info.state_category.as_str(), "live in scheduler queue");
            match info.state_category {
                StateCategory::Pending => summary.pending += 1,
                StateCategory::Running => summary.running += 1,
                StateCategory::Stalled => summary.stalled += 1,
                StateCategory::Unknown => {}
            }
            continue;
        }

        // Submitted, not in queue, no branch: failed.
        row.is_failed = Some(true);
        row.clear_live_and_log_fields();

        let logs = classifier::resolve_log_paths(&options.log_dir, row.job_id, row.task_id);
        let classification = classifier::classify(fs, &logs, catalog, options.max_log_bytes);
        apply_classification(row, &logs, &classification);

        let histogram_key = match &classification.outcome {
            ClassifyOutcome::Matched(msg) => msg.clone(),
            ClassifyOutcome::NoAlertFound | ClassifyOutcome::NoLogsYet => {
                if options.run_post_mortem {
                    match scheduler.post_mortem(row.job_id).await {
                        Ok(label) => format!("no alert found ({label})"),
                        Err(_) => {
                            warn!(%pu, job_id = %row.job_id, "post-mortem unavailable for a failed job");
                            summary
                                .warnings
                                .push(ConsistencyWarning::PostMortemUnavailable { job_id: row.job_id });
                            "no alert found".to_string()
                        }
                    }
                } else {
                    "no alert found".to_string()
                }
            }
        };
        info!(%pu, job_id = %row.job_id, reason = %histogram_key, "job not in queue and no result branch, marking failed");
        *summary.failure_histogram.entry(histogram_key).or_insert(0) += 1;
        summary.failed += 1;
    }

    // Orphan detection: job IDs live in the queue that no ledger row claims.
    let claimed: std::collections::HashSet<JobId> = ledger
        .iter()
        .filter(|r| r.submitted)
        .map(|r| r.job_id)
        .collect();
    for job_id in live.keys() {
        if !claimed.contains(job_id) {
            warn!(job_id = %job_id, "job live in scheduler queue but not claimed by any ledger row");
            summary
                .warnings
                .push(ConsistencyWarning::OrphanedSubmission { job_id: *job_id });
        }
    }

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        running = summary.running,
        pending = summary.pending,
        stalled = summary.stalled,
        warnings = summary.warnings.len(),
        "reconciliation complete"
    );

    Ok((ledger, summary))
}

fn apply_classification(
    row: &mut crate::model::LedgerRow,
    logs: &LogPaths,
    classification: &classifier::ClassificationResult,
) {
    row.log_basename = Some(logs.basename.clone());
    row.last_stdout_line = classification.last_stdout_line.clone();
    row.alert_message = classification.outcome.as_message().filter(|_| {
        matches!(classification.outcome, ClassifyOutcome::Matched(_))
    });
}

fn copy_live_fields(row: &mut crate::model::LedgerRow, info: &LiveJobInfo) {
    row.state_category = Some(info.state_category);
    row.state_code = Some(info.state_code.clone());
    row.runtime = info.runtime;
    row.scheduler = info.scheduler.clone();
}

/// Resolve the on-disk log directory for classifier calls; kept as a small
/// helper so callers (CLI, tests) don't need to know the join convention.
pub fn log_dir_for(project_root: &Path) -> std::path::PathBuf {
    project_root.join("logs")
}
