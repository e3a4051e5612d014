//! End-to-end scenarios exercising the full submit -> reconcile -> merge
//! cycle against in-memory fakes, wired the same way a real scheduler and
//! artifact store would be.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use batch_core::adapter::{
    branch_name_for, AdapterError, ArtifactStore, Filesystem, LiveJobInfo, MergeReport,
    MergedChunk, SchedulerAdapter, SubmissionReceipt, SubmissionTemplate, TaskId,
};
use batch_core::error::PreconditionError;
use batch_core::finalize;
use batch_core::inclusion::{self, DatasetScanner};
use batch_core::ledger::Ledger;
use batch_core::model::{
    AlertCatalog, AlertEntry, DatasetKind, InputDataset, JobId, LedgerRow, ProcessingMode, Pu, StateCategory, Stream,
};
use batch_core::planner::{self, PlanMode};
use batch_core::reconcile::{self, ReconcileOptions};

struct FakeScheduler {
    next_job_id: Mutex<i64>,
    live: Mutex<HashMap<JobId, LiveJobInfo>>,
    post_mortems: Mutex<HashMap<JobId, String>>,
}

impl FakeScheduler {
    fn new() -> Self {
        Self {
            next_job_id: Mutex::new(100),
            live: Mutex::new(HashMap::new()),
            post_mortems: Mutex::new(HashMap::new()),
        }
    }

    fn set_running(&self, job_id: JobId) {
        self.live.lock().unwrap().insert(
            job_id,
            LiveJobInfo {
                state_category: StateCategory::Running,
                state_code: "R".to_string(),
                runtime: None,
                scheduler: Default::default(),
            },
        );
    }

    fn clear_queue(&self) {
        self.live.lock().unwrap().clear();
    }

}

#[async_trait]
impl SchedulerAdapter for FakeScheduler {
    async fn submit(&self, _template: &SubmissionTemplate, pus: &[Pu]) -> Result<SubmissionReceipt, AdapterError> {
        let mut next = self.next_job_id.lock().unwrap();
        let job_id = JobId(*next);
        *next += 1;
        let assignments: Vec<(Pu, JobId, TaskId)> = pus
            .iter()
            .enumerate()
            .map(|(i, pu)| (pu.clone(), job_id, TaskId((i + 1) as i32)))
            .collect();
        for (_, job_id, _) in &assignments {
            self.set_running(*job_id);
        }
        Ok(SubmissionReceipt { assignments })
    }

    async fn poll_all(&self, _owner: &str) -> Result<HashMap<JobId, LiveJobInfo>, AdapterError> {
        Ok(self.live.lock().unwrap().clone())
    }

    async fn poll_one(&self, job_id: JobId) -> Result<Option<LiveJobInfo>, AdapterError> {
        Ok(self.live.lock().unwrap().get(&job_id).cloned())
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), AdapterError> {
        self.live.lock().unwrap().remove(&job_id);
        Ok(())
    }

    async fn post_mortem(&self, job_id: JobId) -> Result<String, AdapterError> {
        self.post_mortems
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| AdapterError::Transient("no post-mortem recorded".to_string()))
    }
}

struct FakeStore {
    branches: Mutex<Vec<String>>,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            branches: Mutex::new(Vec::new()),
        }
    }

    fn add_branch(&self, name: impl Into<String>) {
        self.branches.lock().unwrap().push(name.into());
    }
}

#[async_trait]
impl ArtifactStore for FakeStore {
    async fn list_result_branches(&self) -> Result<Vec<String>, AdapterError> {
        Ok(self.branches.lock().unwrap().clone())
    }

    async fn merge_branches(&self, chunk_size: usize) -> Result<MergeReport, AdapterError> {
        let mut branches = self.branches.lock().unwrap();
        let mut sorted = branches.clone();
        sorted.sort();
        let merged_chunks = sorted
            .chunks(chunk_size)
            .map(|chunk| MergedChunk {
                commit_message: format!("merge {} result branches", chunk.len()),
                branches: chunk.to_vec(),
            })
            .collect();
        branches.clear();
        Ok(MergeReport {
            merged_chunks,
            pending_branches: vec![],
        })
    }

    async fn clone_for_sanity_check(&self, _dest: &Path) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn push_code(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn drop_local(&self, _branch: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeFs {
    files: Mutex<HashMap<PathBuf, String>>,
}

impl FakeFs {
    fn write(&self, path: &Path, content: &str) {
        self.files.lock().unwrap().insert(path.to_path_buf(), content.to_string());
    }
}

impl Filesystem for FakeFs {
    fn read_lines_from_start(&self, path: &Path, _max_bytes: usize) -> std::io::Result<Option<Vec<String>>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(path)
            .map(|content| content.lines().map(str::to_string).collect()))
    }

    fn last_nonempty_line(&self, path: &Path, _max_bytes: usize) -> std::io::Result<Option<String>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(path)
            .and_then(|content| content.lines().rev().find(|l| !l.is_empty()))
            .map(str::to_string))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }
}

fn alert_catalog() -> AlertCatalog {
    AlertCatalog::new(vec![AlertEntry {
        stream: Stream::Stderr,
        pattern: "Excessive topologic defect encountered".to_string(),
    }])
}

fn options() -> ReconcileOptions {
    let mut opts = ReconcileOptions::new(PathBuf::from("/proj/logs"), "researcher");
    opts.run_post_mortem = true;
    opts
}

/// S1 - happy path, single PU.
#[tokio::test]
async fn happy_path_single_pu() {
    let scheduler = FakeScheduler::new();
    let store = FakeStore::new();
    let fs = FakeFs::default();
    let mut ledger = Ledger::default();
    ledger.upsert_row(LedgerRow::declared(Pu::subject_only("sub-0001")));

    let plan = planner::plan(&ledger, &PlanMode::OneJob).unwrap();
    assert_eq!(plan.candidates.len(), 1);
    let template = SubmissionTemplate("#!/bin/bash\n".to_string());
    let assignments = planner::submit_plan(&mut ledger, &scheduler, &template, &plan.candidates)
        .await
        .unwrap();
    let (_, job_id, task_id) = assignments[0];
    assert_eq!(job_id, JobId(100));

    let (ledger, summary) = reconcile::reconcile(ledger, &scheduler, &store, &fs, &alert_catalog(), &options())
        .await
        .unwrap();
    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.running, 1);

    store.add_branch(branch_name_for(job_id, task_id, &Pu::subject_only("sub-0001")));
    let (ledger, summary) = reconcile::reconcile(ledger, &scheduler, &store, &fs, &alert_catalog(), &options())
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);

    let report = finalize::finalize(&ledger, &store, finalize::DEFAULT_CHUNK_SIZE).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.merged_chunks.len(), 1);
    assert_eq!(report.merged_chunks[0].branches.len(), 1);
}

/// S2 - array submission of three PUs, chunked merge.
#[tokio::test]
async fn array_submission_of_three_with_chunked_merge() {
    let scheduler = FakeScheduler::new();
    let store = FakeStore::new();
    let fs = FakeFs::default();
    let mut ledger = Ledger::default();
    let pus = vec![
        Pu::subject_session("sub-0001", "ses-01"),
        Pu::subject_session("sub-0001", "ses-02"),
        Pu::subject_session("sub-0002", "ses-01"),
    ];
    for pu in &pus {
        ledger.upsert_row(LedgerRow::declared(pu.clone()));
    }

    let plan = planner::plan(
        &ledger,
        &PlanMode::All {
            resubmit_policy: Default::default(),
        },
    )
    .unwrap();
    assert_eq!(plan.candidates, pus);

    let template = SubmissionTemplate("#!/bin/bash\n".to_string());
    let assignments = planner::submit_plan(&mut ledger, &scheduler, &template, &plan.candidates)
        .await
        .unwrap();
    for (i, (_, job_id, task_id)) in assignments.iter().enumerate() {
        assert_eq!(*job_id, JobId(100));
        assert_eq!(task_id.0, (i + 1) as i32);
    }

    for (pu, job_id, task_id) in &assignments {
        store.add_branch(branch_name_for(*job_id, *task_id, pu));
    }
    scheduler.clear_queue();

    let (ledger, summary) = reconcile::reconcile(ledger, &scheduler, &store, &fs, &alert_catalog(), &options())
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 3);

    let report = finalize::finalize(&ledger, &store, 2).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.merged_chunks.len(), 2);
    assert_eq!(report.merged_chunks[0].branches.len(), 2);
    assert_eq!(report.merged_chunks[1].branches.len(), 1);
}

/// S3 - failure with an alert message, then a successful resubmit.
#[tokio::test]
async fn failure_with_alert_message_then_resubmit() {
    let scheduler = FakeScheduler::new();
    let store = FakeStore::new();
    let fs = FakeFs::default();
    let pu = Pu::subject_session("sub-0003", "ses-01");
    let mut ledger = Ledger::default();
    ledger.upsert_row(LedgerRow::declared(pu.clone()));

    let template = SubmissionTemplate("#!/bin/bash\n".to_string());
    let plan = planner::plan(&ledger, &PlanMode::OneJob).unwrap();
    let assignments = planner::submit_plan(&mut ledger, &scheduler, &template, &plan.candidates)
        .await
        .unwrap();
    let (_, job_id, task_id) = assignments[0];

    let log_paths = reconcile::log_dir_for(Path::new("/proj"));
    fs.write(
        &log_paths.join(format!("job-{}-{}.err", job_id.0, task_id.0)),
        "Excessive topologic defect encountered",
    );
    scheduler.clear_queue();

    let mut opts = options();
    opts.log_dir = log_paths.clone();
    let (ledger, summary) = reconcile::reconcile(ledger, &scheduler, &store, &fs, &alert_catalog(), &opts)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
    let row = ledger.get(&pu).unwrap();
    assert_eq!(row.is_failed, Some(true));
    assert_eq!(row.alert_message.as_deref(), Some("stderr: Excessive topologic defect encountered"));

    let mut ledger = ledger;
    let plan = planner::plan(&ledger, &PlanMode::Explicit(vec![pu.clone()])).unwrap();
    assert_eq!(plan.candidates, vec![pu.clone()]);
    let assignments = planner::submit_plan(&mut ledger, &scheduler, &template, &plan.candidates)
        .await
        .unwrap();
    let (_, new_job_id, new_task_id) = assignments[0];
    assert_ne!(new_job_id, job_id);

    store.add_branch(branch_name_for(new_job_id, new_task_id, &pu));
    scheduler.clear_queue();
    let (ledger, summary) = reconcile::reconcile(ledger, &scheduler, &store, &fs, &alert_catalog(), &opts)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    let row = ledger.get(&pu).unwrap();
    assert!(row.has_results);
    assert_eq!(row.is_failed, Some(false));
}

struct FakeScanner {
    dirs: HashMap<PathBuf, Vec<String>>,
}

impl DatasetScanner for FakeScanner {
    fn list_dir_names(&self, dir: &Path) -> std::io::Result<Vec<String>> {
        Ok(self.dirs.get(dir).cloned().unwrap_or_default())
    }

    fn matches_any(&self, _base_dir: &Path, _pattern: &str) -> std::io::Result<bool> {
        Ok(true)
    }

    fn dir_exists(&self, dir: &Path) -> bool {
        self.dirs.contains_key(dir)
    }
}

fn bids_dataset() -> InputDataset {
    InputDataset {
        name: "bids_raw".to_string(),
        kind: DatasetKind::Raw,
        path_in_project: PathBuf::from("/proj/rawdata"),
        required_files: vec![],
    }
}

/// S4 - input-data update after a successful merge: a succeeded PU whose
/// input directory vanishes must survive the re-resolution (update
/// semantics clause (c)), a never-submitted PU whose directory vanishes
/// must not, and a newly appeared PU must be added as unsubmitted.
#[tokio::test]
async fn input_data_update_preserves_succeeded_rows_for_vanished_pus() {
    let root = PathBuf::from("/proj/rawdata");
    let scanner = FakeScanner {
        dirs: HashMap::from([(
            root.clone(),
            vec!["sub-0001".to_string(), "sub-0002".to_string()],
        )]),
    };
    let report = inclusion::resolve(&scanner, ProcessingMode::Subject, &[bids_dataset()], None).unwrap();

    let mut ledger = Ledger::default();
    for pu in report.list.iter() {
        ledger.upsert_row(LedgerRow::declared(pu.clone()));
    }
    if let Some(row) = ledger.get_mut(&Pu::subject_only("sub-0001")) {
        row.submitted = true;
        row.job_id = JobId(100);
        row.has_results = true;
        row.is_failed = Some(false);
    }

    // sub-0001 (succeeded) and sub-0002 (never submitted) both vanish from
    // the re-scanned inputs; sub-0003 is newly discovered.
    let scanner = FakeScanner {
        dirs: HashMap::from([(root, vec!["sub-0003".to_string()])]),
    };
    let report = inclusion::resolve(&scanner, ProcessingMode::Subject, &[bids_dataset()], None).unwrap();
    ledger.apply_inclusion_update(report.list.as_slice());

    let succeeded = ledger.get(&Pu::subject_only("sub-0001")).expect("succeeded PU must survive");
    assert!(succeeded.has_results);
    assert!(ledger.get(&Pu::subject_only("sub-0002")).is_none());
    assert!(ledger.get(&Pu::subject_only("sub-0003")).is_some());
    assert_eq!(ledger.len(), 2);

    let plan = planner::plan(&ledger, &PlanMode::OneJob).unwrap();
    assert_eq!(plan.candidates, vec![Pu::subject_only("sub-0003")]);
}

/// S5 - contention refusal when a PU is running.
#[tokio::test]
async fn contention_refusal_leaves_ledger_untouched() {
    let mut ledger = Ledger::default();
    let mut running = LedgerRow::declared(Pu::subject_only("sub-0001"));
    running.submitted = true;
    running.job_id = JobId(100);
    running.state_category = Some(StateCategory::Running);
    ledger.upsert_row(running.clone());
    ledger.upsert_row(LedgerRow::declared(Pu::subject_only("sub-0002")));

    let before = ledger.clone().into_rows();
    let err = planner::check_contention(
        &ledger,
        &PlanMode::All {
            resubmit_policy: Default::default(),
        },
    )
    .unwrap_err();
    assert!(matches!(err, PreconditionError::PuLive(pu, "running") if pu == Pu::subject_only("sub-0001")));
    assert_eq!(ledger.into_rows(), before);
}

/// S6 - orphaned job recovery: a live job no ledger row claims.
#[tokio::test]
async fn orphaned_job_recovered_as_warning_not_auto_claimed() {
    let scheduler = FakeScheduler::new();
    let store = FakeStore::new();
    let fs = FakeFs::default();
    let ledger = Ledger::default();

    scheduler.set_running(JobId(999));

    let (_ledger, summary) = reconcile::reconcile(ledger, &scheduler, &store, &fs, &alert_catalog(), &options())
        .await
        .unwrap();

    assert_eq!(summary.to_complete, 0);
    assert!(summary.warnings.iter().any(|w| format!("{w:?}").contains("999")));
}
