//! Log Classifier (C5): scans stdout/stderr for configured alert patterns.
//!
//! Matching is case-sensitive substring, first match wins in
//! `(stream order, pattern order)`. No regex, no backtracking — preserving
//! the "failure-classifier ordering is semantically significant" note in
//! No partial-match heuristics.

use std::path::{Path, PathBuf};

use crate::adapter::Filesystem;
use crate::model::{AlertCatalog, Stream};

/// Bytes read per file by default; bounds the worst-case classifier cost per
/// PU.
pub const DEFAULT_MAX_BYTES: usize = 4 * 1024 * 1024;

pub const SUCCESS_SENTINEL: &str = "SUCCESS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifyOutcome {
    /// `"<stream>: <pattern>"` of the first matching alert.
    Matched(String),
    /// Logs exist but no configured pattern matched.
    NoAlertFound,
    /// Neither log file exists yet.
    NoLogsYet,
}

impl ClassifyOutcome {
    pub fn as_message(&self) -> Option<String> {
        match self {
            ClassifyOutcome::Matched(msg) => Some(msg.clone()),
            ClassifyOutcome::NoAlertFound => Some("no alert found".to_string()),
            ClassifyOutcome::NoLogsYet => Some("no logs yet".to_string()),
        }
    }
}

/// The two resolved log paths for a PU's current submission.
#[derive(Debug, Clone)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub basename: String,
}

/// Result of running the classifier once: the alert classification plus the
/// independently-extracted last stdout line.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub outcome: ClassifyOutcome,
    pub last_stdout_line: Option<String>,
}

/// Classify a PU's logs against the alert catalog.
pub fn classify(
    fs: &dyn Filesystem,
    logs: &LogPaths,
    catalog: &AlertCatalog,
    max_bytes: usize,
) -> ClassificationResult {
    let last_stdout_line = fs
        .last_nonempty_line(&logs.stdout, max_bytes)
        .ok()
        .flatten();

    if !fs.exists(&logs.stdout) && !fs.exists(&logs.stderr) {
        return ClassificationResult {
            outcome: ClassifyOutcome::NoLogsYet,
            last_stdout_line,
        };
    }

    for entry in catalog.iter() {
        let path = match entry.stream {
            Stream::Stdout => &logs.stdout,
            Stream::Stderr => &logs.stderr,
        };
        let Ok(Some(lines)) = fs.read_lines_from_start(path, max_bytes) else {
            continue;
        };
        if lines.iter().any(|line| line.contains(&entry.pattern)) {
            return ClassificationResult {
                outcome: ClassifyOutcome::Matched(format!(
                    "{}: {}",
                    entry.stream.as_str(),
                    entry.pattern
                )),
                last_stdout_line,
            };
        }
    }

    ClassificationResult {
        outcome: ClassifyOutcome::NoAlertFound,
        last_stdout_line,
    }
}

/// Whether the log reached its wrapper's end-of-run sentinel, independent of
/// whether a result branch has appeared yet.
pub fn reached_success_sentinel(last_stdout_line: &Option<String>) -> bool {
    last_stdout_line.as_deref() == Some(SUCCESS_SENTINEL)
}

/// Resolve the on-disk stdout/stderr paths for a PU's current submission.
/// `log_dir` is the project's configured log directory; the basename
/// encodes job/task so reruns never collide.
pub fn resolve_log_paths(log_dir: &Path, job_id: crate::model::JobId, task_id: crate::model::TaskId) -> LogPaths {
    let basename = if task_id.is_array_task() {
        format!("job-{}-{}", job_id.0, task_id.0)
    } else {
        format!("job-{}", job_id.0)
    };
    LogPaths {
        stdout: log_dir.join(format!("{basename}.out")),
        stderr: log_dir.join(format!("{basename}.err")),
        basename,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertEntry;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFs {
        files: Mutex<HashMap<PathBuf, String>>,
    }

    impl FakeFs {
        fn with(files: &[(&str, &str)]) -> Self {
            let fs = FakeFs::default();
            for (path, content) in files {
                fs.files
                    .lock()
                    .unwrap()
                    .insert(PathBuf::from(path), content.to_string());
            }
            fs
        }
    }

    impl Filesystem for FakeFs {
        fn read_lines_from_start(
            &self,
            path: &Path,
            _max_bytes: usize,
        ) -> std::io::Result<Option<Vec<String>>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(path)
                .map(|content| content.lines().map(|l| l.to_string()).collect()))
        }

        fn last_nonempty_line(&self, path: &Path, _max_bytes: usize) -> std::io::Result<Option<String>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(path)
                .and_then(|content| content.lines().rev().find(|l| !l.is_empty()))
                .map(|l| l.to_string()))
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.lock().unwrap().contains_key(path)
        }
    }

    fn catalog() -> AlertCatalog {
        AlertCatalog::new(vec![
            AlertEntry {
                stream: Stream::Stdout,
                pattern: "CUDA out of memory".to_string(),
            },
            AlertEntry {
                stream: Stream::Stderr,
                pattern: "Excessive topologic defect encountered".to_string(),
            },
        ])
    }

    #[test]
    fn no_logs_yet_when_neither_file_exists() {
        let fs = FakeFs::default();
        let logs = LogPaths {
            stdout: PathBuf::from("out.log"),
            stderr: PathBuf::from("err.log"),
            basename: "job-1".to_string(),
        };
        let result = classify(&fs, &logs, &catalog(), DEFAULT_MAX_BYTES);
        assert_eq!(result.outcome, ClassifyOutcome::NoLogsYet);
    }

    #[test]
    fn first_match_wins_in_stream_then_pattern_order() {
        let fs = FakeFs::with(&[
            ("out.log", "starting\nCUDA out of memory\nline3"),
            ("err.log", "Excessive topologic defect encountered"),
        ]);
        let logs = LogPaths {
            stdout: PathBuf::from("out.log"),
            stderr: PathBuf::from("err.log"),
            basename: "job-1".to_string(),
        };
        let result = classify(&fs, &logs, &catalog(), DEFAULT_MAX_BYTES);
        assert_eq!(
            result.outcome,
            ClassifyOutcome::Matched("stdout: CUDA out of memory".to_string())
        );
    }

    #[test]
    fn falls_through_to_stderr_pattern_when_stdout_does_not_match() {
        let fs = FakeFs::with(&[
            ("out.log", "all good here"),
            ("err.log", "Excessive topologic defect encountered"),
        ]);
        let logs = LogPaths {
            stdout: PathBuf::from("out.log"),
            stderr: PathBuf::from("err.log"),
            basename: "job-1".to_string(),
        };
        let result = classify(&fs, &logs, &catalog(), DEFAULT_MAX_BYTES);
        assert_eq!(
            result.outcome,
            ClassifyOutcome::Matched("stderr: Excessive topologic defect encountered".to_string())
        );
    }

    #[test]
    fn no_alert_found_when_logs_exist_but_nothing_matches() {
        let fs = FakeFs::with(&[("out.log", "job finished\nSUCCESS"), ("err.log", "")]);
        let logs = LogPaths {
            stdout: PathBuf::from("out.log"),
            stderr: PathBuf::from("err.log"),
            basename: "job-1".to_string(),
        };
        let result = classify(&fs, &logs, &catalog(), DEFAULT_MAX_BYTES);
        assert_eq!(result.outcome, ClassifyOutcome::NoAlertFound);
        assert_eq!(result.last_stdout_line.as_deref(), Some("SUCCESS"));
        assert!(reached_success_sentinel(&result.last_stdout_line));
    }

    #[test]
    fn classifier_is_a_pure_function_of_its_inputs() {
        let fs = FakeFs::with(&[("out.log", "CUDA out of memory"), ("err.log", "")]);
        let logs = LogPaths {
            stdout: PathBuf::from("out.log"),
            stderr: PathBuf::from("err.log"),
            basename: "job-1".to_string(),
        };
        let a = classify(&fs, &logs, &catalog(), DEFAULT_MAX_BYTES);
        let b = classify(&fs, &logs, &catalog(), DEFAULT_MAX_BYTES);
        assert_eq!(a.outcome, b.outcome);
        assert_eq!(a.last_stdout_line, b.last_stdout_line);
    }
}
