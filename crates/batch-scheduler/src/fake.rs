//! In-memory scheduler backend: never shells out, used by this repo's test
//! suites and by the CLI's dry-run mode.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use batch_core::adapter::{AdapterError, LiveJobInfo, SchedulerAdapter, SubmissionReceipt, SubmissionTemplate};
use batch_core::{JobId, Pu, TaskId};

/// Assigns sequential job ids starting at 1; array-batches (task ids
/// `1..=N`) whenever more than one PU is submitted at once, matching the
/// real `SlurmAdapter`'s array-vs-individual split in spirit without
/// needing a configurable threshold of its own.
pub struct InMemoryScheduler {
    next_job_id: Mutex<i64>,
    live: Mutex<HashMap<JobId, LiveJobInfo>>,
    post_mortems: Mutex<HashMap<JobId, String>>,
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self {
            next_job_id: Mutex::new(1),
            live: Mutex::new(HashMap::new()),
            post_mortems: Mutex::new(HashMap::new()),
        }
    }
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a job into the live queue, as if a prior `poll_all` had
    /// observed it. Used to set up CLI dry-run fixtures and tests.
    pub fn set_live(&self, job_id: JobId, info: LiveJobInfo) {
        self.live.lock().unwrap().insert(job_id, info);
    }

    pub fn remove_live(&self, job_id: JobId) {
        self.live.lock().unwrap().remove(&job_id);
    }

    pub fn set_post_mortem(&self, job_id: JobId, label: impl Into<String>) {
        self.post_mortems.lock().unwrap().insert(job_id, label.into());
    }
}

#[async_trait]
impl SchedulerAdapter for InMemoryScheduler {
    async fn submit(&self, _template: &SubmissionTemplate, pus: &[Pu]) -> Result<SubmissionReceipt, AdapterError> {
        let mut next = self.next_job_id.lock().unwrap();
        let array = pus.len() > 1;
        let assignments: Vec<(Pu, JobId, TaskId)> = pus
            .iter()
            .enumerate()
            .map(|(i, pu)| {
                let job_id = JobId(*next);
                *next += 1;
                let task_id = if array { TaskId((i + 1) as i32) } else { TaskId::NONE };
                (pu.clone(), job_id, task_id)
            })
            .collect();
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
