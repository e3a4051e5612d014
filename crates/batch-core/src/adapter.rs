//! Trait boundaries the reconciler, planner, and finalizer are coded
//! against. Concrete backends (Slurm, git) live in their own crates and
//! implement these traits; the fakes used by this crate's own test suite do
//! too, so the core never needs a real cluster to exercise its tests.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{JobId, Pu, SchedulerFields, StateCategory};

/// Transient cluster/IO failure. Polling call sites retry with bounded
/// backoff; submission and merge do not.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

/// Opaque submission template string; the core never interprets
/// placeholders, it only hands the template to the adapter.
#[derive(Debug, Clone)]
pub struct SubmissionTemplate(pub String);

/// Maps each submitted PU to the `(job_id, task_id)` pair the scheduler
/// assigned it, in Inclusion-List order.
#[derive(Debug, Clone, Default)]
pub struct SubmissionReceipt {
    pub assignments: Vec<(Pu, JobId, TaskId)>,
}

pub use crate::model::TaskId;

/// A live queue observation for one job, as returned by `PollAll`/`PollOne`.
#[derive(Debug, Clone)]
pub struct LiveJobInfo {
    pub state_category: StateCategory,
    pub state_code: String,
    pub runtime: Option<std::time::Duration>,
    pub scheduler: SchedulerFields,
}

/// Abstracts submit / poll / cancel / post-mortem over a scheduler backend.
/// One implementation per backend tag, chosen once at project init.
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    /// Submit one or more jobs covering `pus`. The adapter may batch as a
    /// single array job or one job per PU; callers must not depend on the
    /// choice, only on the receipt. Inclusion-List order is preserved in any
    /// generated array so `task_id` mapping stays reproducible.
    async fn submit(
        &self,
        template: &SubmissionTemplate,
        pus: &[Pu],
    ) -> Result<SubmissionReceipt, AdapterError>;

    /// One cheap bulk query per reconciliation.
    async fn poll_all(&self, owner: &str) -> Result<HashMap<JobId, LiveJobInfo>, AdapterError>;

    async fn poll_one(&self, job_id: JobId) -> Result<Option<LiveJobInfo>, AdapterError>;

    /// Idempotent.
    async fn cancel(&self, job_id: JobId) -> Result<(), AdapterError>;

    /// Best-effort retrieval of exit reason for a job no longer in the live
    /// queue. Failure here is benign (a `ConsistencyWarning`, not an error).
    async fn post_mortem(&self, job_id: JobId) -> Result<String, AdapterError>;
}

/// Outcome of a chunked finalizer merge.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub merged_chunks: Vec<MergedChunk>,
    /// Branches left unmerged because a later chunk failed; empty on full
    /// success.
    pub pending_branches: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MergedChunk {
    pub commit_message: String,
    pub branches: Vec<String>,
}

impl MergeReport {
    pub fn is_complete(&self) -> bool {
        self.pending_branches.is_empty()
    }
}

/// Operations over the artifact store's branch namespace. Branch naming is
/// part of the contract: a result branch for a PU is named
/// `job-<job_id>-<task_id>-<pu_components>`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Cheap: O(branches) text output, never branch contents.
    async fn list_result_branches(&self) -> Result<Vec<String>, AdapterError>;

    /// Membership test over `list_result_branches`. Any branch whose
    /// PU-components segment equals `pu` counts, even if the `job_id` in the
    /// name differs from the ledger's current value (legacy scheme
    /// tolerance for legacy branch-naming schemes).
    async fn branch_exists_for(&self, pu: &Pu) -> Result<bool, AdapterError> {
        let components = pu.components();
        Ok(self
            .list_result_branches()
            .await?
            .iter()
            .any(|name| parse_branch_components(name) == Some(components.clone())))
    }

    async fn merge_branches(&self, chunk_size: usize) -> Result<MergeReport, AdapterError>;

    async fn clone_for_sanity_check(&self, dest: &Path) -> Result<(), AdapterError>;

    async fn push_code(&self) -> Result<(), AdapterError>;

    async fn drop_local(&self, branch: &str) -> Result<(), AdapterError>;
}

/// Build a result branch name per the documented scheme: always
/// `job-<job_id>-<task_id>-<components>`, regardless of whether the
/// submission was array-batched (a lone PU's task id may still be the
/// `NONE` sentinel; the scheme does not special-case it).
pub fn branch_name_for(job_id: JobId, task_id: TaskId, pu: &Pu) -> String {
    format!("job-{}-{}-{}", job_id.0, task_id.0, pu.components())
}

/// Consume a leading (possibly negative) integer token, returning it and
/// the remainder of the string after it.
fn take_int_token(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    if bytes.first() == Some(&b'-') {
        i += 1;
    }
    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == digits_start {
        return None;
    }
    Some((&s[..i], &s[i..]))
}

/// Parse a branch name back to its PU-components segment (Testable
/// Property 4: branch-name round trip). Returns `None` if the name doesn't
/// match the `job-<job_id>-<task_id>-<components>` scheme. Job/task id
/// tokens may be negative (the `NONE` sentinel), so splitting on plain `-`
/// is not enough.
pub fn parse_branch_components(name: &str) -> Option<String> {
    let rest = name.strip_prefix("job-")?;
    let (_job_id, rest) = take_int_token(rest)?;
    let rest = rest.strip_prefix('-')?;
    let (_task_id, rest) = take_int_token(rest)?;
    let components = rest.strip_prefix('-')?;
    if components.is_empty() {
        None
    } else {
        Some(components.to_string())
    }
}

/// Abstracts reading job log files so the classifier is testable without a
/// real filesystem (external-process/IO
/// wrapped behind interfaces).
pub trait Filesystem: Send + Sync {
    /// Read up to `max_bytes` from the start of `path`, split into lines.
    /// Returns `Ok(None)` if the file does not exist yet ("no logs yet").
    fn read_lines_from_start(&self, path: &Path, max_bytes: usize) -> std::io::Result<Option<Vec<String>>>;

    /// Read up to `max_bytes` from the end of `path` to locate the last
    /// non-empty line without loading the whole file.
    fn last_nonempty_line(&self, path: &Path, max_bytes: usize) -> std::io::Result<Option<String>>;

    fn exists(&self, path: &Path) -> bool;
}

/// `std::fs`-backed filesystem for real project log directories.
pub struct RealFilesystem;

impl Filesystem for RealFilesystem {
    fn read_lines_from_start(&self, path: &Path, max_bytes: usize) -> std::io::Result<Option<Vec<String>>> {
        use std::io::Read;

        if !path.exists() {
            return Ok(None);
        }
        let mut file = std::fs::File::open(path)?;
        let mut buf = vec![0u8; max_bytes];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        let text = String::from_utf8_lossy(&buf);
        Ok(Some(text.lines().map(str::to_string).collect()))
    }

    fn last_nonempty_line(&self, path: &Path, max_bytes: usize) -> std::io::Result<Option<String>> {
        use std::io::{Read, Seek, SeekFrom};

        if !path.exists() {
            return Ok(None);
        }
        let mut file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        let read_len = len.min(max_bytes as u64);
        file.seek(SeekFrom::End(-(read_len as i64)))?;
        let mut buf = vec![0u8; read_len as usize];
        file.read_exact(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        Ok(text.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
