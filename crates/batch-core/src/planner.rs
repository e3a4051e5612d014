//! Submission Planner (C7): decides what to (re)submit given policy and the
//! post-reconcile ledger state.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::adapter::{AdapterError, SchedulerAdapter, SubmissionTemplate};
use crate::error::PreconditionError;
use crate::ledger::Ledger;
use crate::model::{JobId, Pu, StateCategory, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResubmitPolicy {
    Failed,
    Pending,
}

#[derive(Debug, Clone)]
pub enum PlanMode {
    OneJob,
    CountN(usize),
    All { resubmit_policy: HashSet<ResubmitPolicy> },
    Explicit(Vec<Pu>),
    Resubmit { policy: HashSet<ResubmitPolicy>, explicit: Vec<Pu> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    SkippedRunning(Pu),
    ResubmittedStalled(Pu),
    SkippedHasResults(Pu),
}

/// What the planner decided, before calling the scheduler.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub candidates: Vec<Pu>,
    pub warnings: Vec<PlanWarning>,
}

fn live_category(row: &crate::model::LedgerRow) -> Option<StateCategory> {
    if !row.submitted || row.has_results {
        return None;
    }
    match row.state_category {
        Some(StateCategory::Pending) => Some(StateCategory::Pending),
        Some(StateCategory::Running) => Some(StateCategory::Running),
        Some(StateCategory::Stalled) => Some(StateCategory::Stalled),
        _ => None,
    }
}

/// Compute candidates for `mode` against `ledger`.
/// Does not check contention or talk to the scheduler; call
/// `check_contention` first.
pub fn plan(ledger: &Ledger, mode: &PlanMode) -> Result<Plan, PreconditionError> {
    let mut plan = Plan::default();

    match mode {
        PlanMode::OneJob => {
            if let Some(row) = ledger.iter().find(|r| !r.submitted) {
                plan.candidates.push(row.pu.clone());
            }
        }
        PlanMode::CountN(n) => {
            plan.candidates = ledger
                .iter()
                .filter(|r| !r.submitted)
                .take(*n)
                .map(|r| r.pu.clone())
                .collect();
        }
        PlanMode::All { resubmit_policy } => {
            for row in ledger.iter() {
                let eligible = !row.submitted
                    || row.is_failed == Some(true)
                    || (row.state_category == Some(StateCategory::Pending)
                        && resubmit_policy.contains(&ResubmitPolicy::Pending));
                if eligible && !row.has_results {
                    plan.candidates.push(row.pu.clone());
                } else if eligible && row.has_results {
                    return Err(PreconditionError::AlreadySucceeded(row.pu.clone()));
                }
            }
        }
        PlanMode::Explicit(pus) => {
            for pu in pus {
                let Some(row) = ledger.get(pu) else {
                    return Err(PreconditionError::PuLive(pu.clone(), "unknown PU"));
                };
                if row.has_results {
                    plan.warnings.push(PlanWarning::SkippedHasResults(pu.clone()));
                    continue;
                }
                match live_category(row) {
                    Some(StateCategory::Running) => {
                        plan.warnings.push(PlanWarning::SkippedRunning(pu.clone()));
                    }
                    Some(StateCategory::Stalled) => {
                        // Explicit mode is the one place a stalled PU can be
                        // resubmitted: never automatic, always allowed here,
                        // with a warning attached so the caller knows why.
                        plan.warnings.push(PlanWarning::ResubmittedStalled(pu.clone()));
                        plan.candidates.push(pu.clone());
                    }
                    _ => plan.candidates.push(pu.clone()),
                }
            }
        }
        PlanMode::Resubmit { policy, explicit } => {
            for row in ledger.iter() {
                let matches_policy = (row.is_failed == Some(true) && policy.contains(&ResubmitPolicy::Failed))
                    || (row.state_category == Some(StateCategory::Pending)
                        && policy.contains(&ResubmitPolicy::Pending));
                if matches_policy {
                    if row.has_results {
                        return Err(PreconditionError::AlreadySucceeded(row.pu.clone()));
                    }
                    plan.candidates.push(row.pu.clone());
                }
            }
            for pu in explicit {
                if !plan.candidates.contains(pu) {
                    plan.candidates.push(pu.clone());
                }
            }
        }
    }

    Ok(plan)
}

/// Refuse submission if any PU is currently live. `Explicit` mode is exempt:
/// it either targets PUs disjoint from the live set, or targets a live PU
/// directly (its own per-PU handling in `plan` decides whether that's a
/// skip-with-warning or, for a stalled PU, an allowed resubmission).
pub fn check_contention(ledger: &Ledger, mode: &PlanMode) -> Result<(), PreconditionError> {
    if matches!(mode, PlanMode::Explicit(_)) {
        return Ok(());
    }

    let live: Vec<(Pu, StateCategory)> = ledger
        .iter()
        .filter_map(|r| live_category(r).map(|cat| (r.pu.clone(), cat)))
        .collect();

    if live.is_empty() {
        return Ok(());
    }

    let (pu, cat) = &live[0];
    warn!(%pu, state = cat.as_str(), "refusing submission, a PU is already live");
    Err(PreconditionError::PuLive(pu.clone(), cat.as_str()))
}

/// Execute `plan`: submit candidates and write `(job_id, task_id)` back to
/// the ledger. Saves the ledger once, after submission returns.
pub async fn submit_plan(
    ledger: &mut Ledger,
    scheduler: &dyn SchedulerAdapter,
    template: &SubmissionTemplate,
    candidates: &[Pu],
) -> Result<Vec<(Pu, JobId, TaskId)>, AdapterError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    info!(count = candidates.len(), "submitting candidates to scheduler");
    let receipt = scheduler.submit(template, candidates).await?;
    for (pu, job_id, task_id) in &receipt.assignments {
        info!(%pu, job_id = %job_id, task_id = %task_id, "submitted");
        if let Some(row) = ledger.get_mut(pu) {
            row.submitted = true;
            row.job_id = *job_id;
            row.task_id = *task_id;
            row.has_results = false;
            row.is_failed = None;
            row.clear_live_and_log_fields();
        }
    }
    Ok(receipt.assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LedgerRow;

    fn ledger_with(rows: Vec<LedgerRow>) -> Ledger {
        let mut ledger = Ledger::default();
        for row in rows {
            ledger.upsert_row(row);
        }
        ledger
    }

    #[test]
    fn count_n_returns_first_n_unsubmitted_in_order() {
        let a = LedgerRow::declared(Pu::subject_only("a"));
        let mut b = LedgerRow::declared(Pu::subject_only("b"));
        b.submitted = true;
        b.job_id = JobId(1);
        let c = LedgerRow::declared(Pu::subject_only("c"));
        let d = LedgerRow::declared(Pu::subject_only("d"));
        let ledger = ledger_with(vec![a, b, c, d]);

        let plan = plan(&ledger, &PlanMode::CountN(2)).unwrap();
        assert_eq!(
            plan.candidates,
            vec![Pu::subject_only("a"), Pu::subject_only("c")]
        );
    }

    #[test]
    fn contention_refuses_all_mode_when_a_pu_is_running() {
        let mut running = LedgerRow::declared(Pu::subject_only("a"));
        running.submitted = true;
        running.job_id = JobId(1);
        running.state_category = Some(StateCategory::Running);
        let ledger = ledger_with(vec![running]);

        let err = check_contention(
            &ledger,
            &PlanMode::All {
                resubmit_policy: HashSet::new(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, PreconditionError::PuLive(_, "running")));
    }

    #[test]
    fn explicit_over_disjoint_pus_bypasses_contention() {
        let mut running = LedgerRow::declared(Pu::subject_only("a"));
        running.submitted = true;
        running.job_id = JobId(1);
        running.state_category = Some(StateCategory::Running);
        let unsubmitted = LedgerRow::declared(Pu::subject_only("b"));
        let ledger = ledger_with(vec![running, unsubmitted]);

        let mode = PlanMode::Explicit(vec![Pu::subject_only("b")]);
        assert!(check_contention(&ledger, &mode).is_ok());
    }

    #[test]
    fn explicit_skips_running_and_succeeded_but_resubmits_stalled() {
        let mut running = LedgerRow::declared(Pu::subject_only("running"));
        running.submitted = true;
        running.state_category = Some(StateCategory::Running);
        let mut stalled = LedgerRow::declared(Pu::subject_only("stalled"));
        stalled.submitted = true;
        stalled.state_category = Some(StateCategory::Stalled);
        let mut succeeded = LedgerRow::declared(Pu::subject_only("done"));
        succeeded.submitted = true;
        succeeded.has_results = true;
        let normal = LedgerRow::declared(Pu::subject_only("normal"));

        let ledger = ledger_with(vec![running, stalled, succeeded, normal]);
        let mode = PlanMode::Explicit(vec![
            Pu::subject_only("running"),
            Pu::subject_only("stalled"),
            Pu::subject_only("done"),
            Pu::subject_only("normal"),
        ]);
        let plan = plan(&ledger, &mode).unwrap();
        assert_eq!(
            plan.candidates,
            vec![Pu::subject_only("stalled"), Pu::subject_only("normal")]
        );
        assert_eq!(plan.warnings.len(), 3);
        assert!(plan
            .warnings
            .contains(&PlanWarning::ResubmittedStalled(Pu::subject_only("stalled"))));
    }

    #[test]
    fn all_mode_never_implicitly_resubmits_a_succeeded_pu() {
        // has_results rows are excluded from the "failed" catch because
        // is_failed is always None/false once has_results is true
        // (invariant 1); this test documents that guarantee holds for the
        // planner's own filter, not just the reconciler's.
        let mut succeeded = LedgerRow::declared(Pu::subject_only("done"));
        succeeded.submitted = true;
        succeeded.has_results = true;
        succeeded.is_failed = Some(false);
        let ledger = ledger_with(vec![succeeded]);

        let plan = plan(
            &ledger,
            &PlanMode::All {
                resubmit_policy: HashSet::new(),
            },
        )
        .unwrap();
        assert!(plan.candidates.is_empty());
    }
}
