//! Slurm backend for the Scheduler Adapter: shells out to `sbatch`,
//! `squeue`, `scancel`, and `sacct`, parsing only the narrow tabular output
//! requested via `--format`/`-o` flags this module controls itself.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use batch_core::adapter::{AdapterError, LiveJobInfo, SchedulerAdapter, SubmissionReceipt, SubmissionTemplate};
use batch_core::model::{SchedulerFields, StateCategory};
use batch_core::{JobId, Pu, TaskId};

const SQUEUE_FORMAT: &str = "%i|%T|%M|%l|%D|%C|%P|%j";

/// `JobId` values this adapter hands back are `raw_slurm_job_id *
/// TASK_ENCODING_FACTOR + array_task_index` (task index `0` for a
/// non-array job), so that two tasks of the same Slurm array job never
/// collide in the `HashMap<JobId, _>` that `poll_all` returns. Sized well
/// past any array Slurm actually allows (`MaxArraySize` defaults to 1001).
const TASK_ENCODING_FACTOR: i64 = 100_000;

fn encode_job_id(raw_job_id: i64, array_task: Option<i32>) -> JobId {
    JobId(raw_job_id * TASK_ENCODING_FACTOR + array_task.unwrap_or(0) as i64)
}

fn decode_job_id(job_id: JobId) -> (i64, TaskId) {
    let raw = job_id.0 / TASK_ENCODING_FACTOR;
    let task = (job_id.0 % TASK_ENCODING_FACTOR) as i32;
    if task == 0 {
        (raw, TaskId::NONE)
    } else {
        (raw, TaskId(task))
    }
}

fn slurm_target(raw_job_id: i64, task_id: TaskId) -> String {
    if task_id.is_array_task() {
        format!("{raw_job_id}_{}", task_id.0)
    } else {
        raw_job_id.to_string()
    }
}

/// Shells out to the real Slurm client tools. One `sbatch` call per PU
/// below `array_threshold`, a single `sbatch --array` call at or above it.
pub struct SlurmAdapter {
    array_threshold: usize,
    script_dir: PathBuf,
}

impl SlurmAdapter {
    pub fn new(array_threshold: usize, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            array_threshold,
            script_dir: script_dir.into(),
        }
    }

    async fn sbatch(&self, script: &str, array_range: Option<&str>) -> Result<i64, AdapterError> {
        let script_path = self
            .script_dir
            .join(format!("submit-{}-{}.sh", std::process::id(), fastrand_suffix()));
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| AdapterError::Transient(format!("writing submission script: {e}")))?;

        let mut cmd = Command::new("sbatch");
        if let Some(range) = array_range {
            cmd.arg(format!("--array={range}"));
        }
        cmd.arg(&script_path);

        debug!(script = %script_path.display(), array_range, "sbatch");
        let output = cmd
            .output()
            .await
            .map_err(|e| AdapterError::Transient(format!("spawning sbatch: {e}")))?;
        if !output.status.success() {
            return Err(AdapterError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_sbatch_job_id(&stdout)
            .ok_or_else(|| AdapterError::Rejected(format!("could not parse sbatch output: {stdout}")))
    }

    async fn submit_individually(
        &self,
        template: &SubmissionTemplate,
        pus: &[Pu],
    ) -> Result<SubmissionReceipt, AdapterError> {
        let mut assignments = Vec::with_capacity(pus.len());
        for pu in pus {
            let script = template.0.replace("{PU}", &pu.components());
            let raw_id = self.sbatch(&script, None).await?;
            assignments.push((pu.clone(), encode_job_id(raw_id, None), TaskId::NONE));
        }
        Ok(SubmissionReceipt { assignments })
    }

    async fn submit_array(
        &self,
        template: &SubmissionTemplate,
        pus: &[Pu],
    ) -> Result<SubmissionReceipt, AdapterError> {
        let manifest_path = self
            .script_dir
            .join(format!("pu-manifest-{}-{}.txt", std::process::id(), fastrand_suffix()));
        let manifest = pus.iter().map(|p| p.components()).collect::<Vec<_>>().join("\n");
        tokio::fs::write(&manifest_path, manifest)
            .await
            .map_err(|e| AdapterError::Transient(format!("writing PU manifest: {e}")))?;

        let script = template.0.replace("{PU_LIST_FILE}", &manifest_path.display().to_string());
        let array_range = format!("1-{}", pus.len());
        let raw_id = self.sbatch(&script, Some(&array_range)).await?;

        let assignments = pus
            .iter()
            .enumerate()
            .map(|(i, pu)| {
                let task = (i + 1) as i32;
                (pu.clone(), encode_job_id(raw_id, Some(task)), TaskId(task))
            })
            .collect();
        Ok(SubmissionReceipt { assignments })
    }
}

/// Cheap process-local jitter so concurrent submissions from the same PID
/// don't race each other for the same script path.
fn fastrand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos() as u64).unwrap_or(0)
}

#[async_trait]
impl SchedulerAdapter for SlurmAdapter {
    async fn submit(&self, template: &SubmissionTemplate, pus: &[Pu]) -> Result<SubmissionReceipt, AdapterError> {
        if pus.is_empty() {
            return Ok(SubmissionReceipt::default());
        }
        info!(count = pus.len(), threshold = self.array_threshold, "submit");
        if pus.len() >= self.array_threshold {
            self.submit_array(template, pus).await
        } else {
            self.submit_individually(template, pus).await
        }
    }

    async fn poll_all(&self, owner: &str) -> Result<HashMap<JobId, LiveJobInfo>, AdapterError> {
        let output = Command::new("squeue")
            .arg("-h")
            .arg("-u")
            .arg(owner)
            .arg("--format")
            .arg(SQUEUE_FORMAT)
            .output()
            .await
            .map_err(|e| AdapterError::Transient(format!("spawning squeue: {e}")))?;
        if !output.status.success() {
            return Err(AdapterError::Transient(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_squeue_output(&stdout))
    }

    async fn poll_one(&self, job_id: JobId) -> Result<Option<LiveJobInfo>, AdapterError> {
        let (raw, _task) = decode_job_id(job_id);
        let output = Command::new("squeue")
            .arg("-h")
            .arg("-j")
            .arg(raw.to_string())
            .arg("--format")
            .arg(SQUEUE_FORMAT)
            .output()
            .await
            .map_err(|e| AdapterError::Transient(format!("spawning squeue: {e}")))?;
        if !output.status.success() {
            // squeue exits non-zero once a job id has left the queue entirely.
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_squeue_output(&stdout).remove(&job_id))
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), AdapterError> {
        let (raw, task) = decode_job_id(job_id);
        let target = slurm_target(raw, task);
        debug!(target = %target, "scancel");
        let output = Command::new("scancel")
            .arg(&target)
            .output()
            .await
            .map_err(|e| AdapterError::Transient(format!("spawning scancel: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AdapterError::Transient(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn post_mortem(&self, job_id: JobId) -> Result<String, AdapterError> {
        let (raw, task) = decode_job_id(job_id);
        let target = slurm_target(raw, task);
        let output = Command::new("sacct")
            .arg("-j")
            .arg(&target)
            .arg("--format=State,ExitCode")
            .arg("-n")
            .arg("-P")
            .output()
            .await
            .map_err(|e| AdapterError::Transient(format!("spawning sacct: {e}")))?;
        if !output.status.success() {
            return Err(AdapterError::Transient(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_sacct_post_mortem(&stdout) {
            Some(label) => Ok(label),
            None => {
                warn!(target = %target, "sacct returned no rows");
                Err(AdapterError::Rejected("sacct returned no rows".to_string()))
            }
        }
    }
}

fn parse_sbatch_job_id(stdout: &str) -> Option<i64> {
    stdout.split_whitespace().last()?.parse().ok()
}

fn parse_sacct_post_mortem(stdout: &str) -> Option<String> {
    stdout.lines().find(|l| !l.trim().is_empty()).map(|l| l.trim().to_string())
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() || s == "N/A" {
        None
    } else {
        Some(s.to_string())
    }
}

fn map_slurm_state(code: &str) -> StateCategory {
    match code {
        "PENDING" => StateCategory::Pending,
        "RUNNING" | "COMPLETING" | "CONFIGURING" => StateCategory::Running,
        "SUSPENDED" => StateCategory::Stalled,
        _ => StateCategory::Unknown,
    }
}

/// Slurm's `%M` time-used field: `[D-]HH:MM:SS`, `MM:SS`, or bare seconds.
fn parse_slurm_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() || s == "N/A" {
        return None;
    }
    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, s),
    };
    let parts: Vec<&str> = rest.split(':').collect();
    let (h, m, sec): (u64, u64, u64) = match parts.as_slice() {
        [h, m, s] => (h.parse().ok()?, m.parse().ok()?, s.parse().ok()?),
        [m, s] => (0, m.parse().ok()?, s.parse().ok()?),
        [s] => (0, 0, s.parse().ok()?),
        _ => return None,
    };
    Some(Duration::from_secs(days * 86_400 + h * 3_600 + m * 60 + sec))
}

/// The `%i` field: a bare job id (`12345`), a single array task
/// (`12345_7`), or a compressed pending-array range (`12345_[3-8,10]`).
fn parse_squeue_job_id_field(field: &str) -> (i64, Vec<Option<i32>>) {
    match field.split_once('_') {
        None => (field.parse().unwrap_or(0), vec![None]),
        Some((base, task_part)) => {
            let base_id = base.parse().unwrap_or(0);
            let tasks = match task_part.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                Some(inner) => expand_task_ranges(inner),
                None => task_part.parse().ok().into_iter().collect(),
            };
            (base_id, tasks.into_iter().map(Some).collect())
        }
    }
}

fn expand_task_ranges(spec: &str) -> Vec<i32> {
    let mut out = Vec::new();
    for part in spec.split(',') {
        // Slurm may append a "%stride" throttle suffix; step is always 1 here.
        let part = part.split('%').next().unwrap_or(part);
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<i32>(), hi.parse::<i32>()) {
                out.extend(lo..=hi);
            }
        } else if let Ok(n) = part.parse::<i32>() {
            out.push(n);
        }
    }
    out
}

fn parse_squeue_output(text: &str) -> HashMap<JobId, LiveJobInfo> {
    let mut map = HashMap::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != 8 {
            warn!(line, "squeue line did not match expected field count, skipping");
            continue;
        }
        let (raw_id, tasks) = parse_squeue_job_id_field(fields[0]);
        let state_category = map_slurm_state(fields[1]);
        let runtime = parse_slurm_duration(fields[2]);
        let scheduler = SchedulerFields {
            time_limit: non_empty(fields[3]),
            nodes: non_empty(fields[4]),
            cpus: non_empty(fields[5]),
            partition: non_empty(fields[6]),
            name: non_empty(fields[7]),
        };
        let info = LiveJobInfo {
            state_category,
            state_code: fields[1].to_string(),
            runtime,
            scheduler,
        };
        for task in tasks {
            map.insert(encode_job_id(raw_id, task), info.clone());
        }
    }
    map
}
