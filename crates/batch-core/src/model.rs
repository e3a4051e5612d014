//! Core data model: processing units, ledger rows, and the alert catalog.

use std::fmt;
use std::time::Duration;

/// Sentinel recorded on disk and in memory for a PU that has never been submitted.
pub const UNSUBMITTED_JOB_ID: i64 = -1;
/// Sentinel for a job that is not part of an array job.
pub const NO_TASK_ID: i32 = -1;

/// A cluster job identifier. Wraps the `-1` sentinel so call sites read as
/// intent ("is this PU submitted?") rather than a magic-number comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub i64);

impl JobId {
    pub const UNSUBMITTED: JobId = JobId(UNSUBMITTED_JOB_ID);

    pub fn is_submitted(&self) -> bool {
        self.0 != UNSUBMITTED_JOB_ID
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task index within an array job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub i32);

impl TaskId {
    pub const NONE: TaskId = TaskId(NO_TASK_ID);

    pub fn is_array_task(&self) -> bool {
        self.0 != NO_TASK_ID
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing mode fixed per project: one PU per subject, or one per
/// (subject, session) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Subject,
    Session,
}

/// Identifier of a single unit of work.
///
/// Two PUs compare equal iff all identifier components match. In
/// `ProcessingMode::Subject`, `session` is always `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pu {
    pub subject: String,
    pub session: Option<String>,
}

impl Pu {
    pub fn subject_only(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: None,
        }
    }

    pub fn subject_session(subject: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: Some(session.into()),
        }
    }

    /// The PU-components segment used in branch names and directory paths:
    /// `sub-0001` or `sub-0001-ses-01`.
    pub fn components(&self) -> String {
        match &self.session {
            Some(session) => format!("{}-{}", self.subject, session),
            None => self.subject.clone(),
        }
    }
}

impl fmt::Display for Pu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components())
    }
}

/// Normalized scheduler state, independent of backend vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCategory {
    Pending,
    Running,
    Stalled,
    Unknown,
}

impl StateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateCategory::Pending => "pending",
            StateCategory::Running => "running",
            StateCategory::Stalled => "stalled",
            StateCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StateCategory::Pending),
            "running" => Some(StateCategory::Running),
            "stalled" => Some(StateCategory::Stalled),
            "unknown" => Some(StateCategory::Unknown),
            _ => None,
        }
    }
}

/// Scheduler-exposed resource fields, copied verbatim from `LiveJobInfo` into
/// the ledger row when a job is observed live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerFields {
    pub time_limit: Option<String>,
    pub nodes: Option<String>,
    pub cpus: Option<String>,
    pub partition: Option<String>,
    pub name: Option<String>,
}

/// One row of the persistent per-PU ledger. Field meanings are exactly as
/// documented alongside the ledger header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub pu: Pu,
    pub submitted: bool,
    pub job_id: JobId,
    pub task_id: TaskId,
    pub state_category: Option<StateCategory>,
    pub state_code: Option<String>,
    pub runtime: Option<Duration>,
    pub has_results: bool,
    pub is_failed: Option<bool>,
    pub log_basename: Option<String>,
    pub last_stdout_line: Option<String>,
    pub alert_message: Option<String>,
    pub scheduler: SchedulerFields,
}

impl LedgerRow {
    /// A freshly declared row for a PU that has not yet been submitted.
    pub fn declared(pu: Pu) -> Self {
        Self {
            pu,
            submitted: false,
            job_id: JobId::UNSUBMITTED,
            task_id: TaskId::NONE,
            state_category: None,
            state_code: None,
            runtime: None,
            has_results: false,
            is_failed: None,
            log_basename: None,
            last_stdout_line: None,
            alert_message: None,
            scheduler: SchedulerFields::default(),
        }
    }

    /// Clear every field derived from the live queue or logs, leaving
    /// `submitted`/`job_id`/`task_id` untouched. Used before copying in a
    /// fresh observation so stale fields from a prior state never linger.
    pub fn clear_live_and_log_fields(&mut self) {
        self.state_category = None;
        self.state_code = None;
        self.runtime = None;
        self.log_basename = None;
        self.last_stdout_line = None;
        self.alert_message = None;
        self.scheduler = SchedulerFields::default();
    }

    /// Invariant 1 & 2 check: does this row's observed state count as a
    /// completed success for summary purposes?
    pub fn counts_as_succeeded(&self) -> bool {
        self.has_results
    }
}

/// Which standard stream an alert pattern is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// One `(stream, pattern)` entry in the alert catalog.
#[derive(Debug, Clone)]
pub struct AlertEntry {
    pub stream: Stream,
    pub pattern: String,
}

/// Ordered list of alert entries. Order is significant: streams are checked
/// in declaration order, and patterns within a stream in declaration order;
/// first match wins. Deliberately a `Vec`, never a map, so that ordering
/// cannot be lost to implementation.
#[derive(Debug, Clone, Default)]
pub struct AlertCatalog {
    entries: Vec<AlertEntry>,
}

impl AlertCatalog {
    pub fn new(entries: Vec<AlertEntry>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlertEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether an input dataset's files live unzipped on disk or are trusted
/// zip archives (required-file checks only run against
/// unzipped datasets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Raw,
    Zipped,
}

/// One declared input dataset.
#[derive(Debug, Clone)]
pub struct InputDataset {
    pub name: String,
    pub kind: DatasetKind,
    pub path_in_project: std::path::PathBuf,
    /// Glob patterns checked relative to each PU's directory within this
    /// dataset; a PU is dropped if any pattern has no match.
    pub required_files: Vec<String>,
}

/// The canonical, ordered, duplicate-free set of PUs to process. Order
/// defines submission priority and is preserved across runs.
#[derive(Debug, Clone, Default)]
pub struct InclusionList {
    pus: Vec<Pu>,
}

impl InclusionList {
    pub fn new(pus: Vec<Pu>) -> Self {
        Self { pus }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pu> {
        self.pus.iter()
    }

    pub fn len(&self) -> usize {
        self.pus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pus.is_empty()
    }

    pub fn contains(&self, pu: &Pu) -> bool {
        self.pus.iter().any(|p| p == pu)
    }

    pub fn as_slice(&self) -> &[Pu] {
        &self.pus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pu_components_single_level() {
        let pu = Pu::subject_only("sub-0001");
        assert_eq!(pu.components(), "sub-0001");
    }

    #[test]
    fn pu_components_two_level() {
        let pu = Pu::subject_session("sub-0001", "ses-01");
        assert_eq!(pu.components(), "sub-0001-ses-01");
    }

    #[test]
    fn job_id_sentinel() {
        assert!(!JobId::UNSUBMITTED.is_submitted());
        assert!(JobId(100).is_submitted());
    }
}
