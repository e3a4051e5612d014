//! Project Configuration schema: the on-disk YAML shape of a project's
//! nested key/value configuration document.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level Project Configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub processing_level: ProcessingLevel,

    pub queue: QueueBackend,

    /// Declared input datasets, keyed by name.
    pub input_datasets: BTreeMap<String, InputDatasetConfig>,

    /// Arguments passed verbatim to the BIDS App entry point.
    #[serde(default)]
    pub bids_app_args: Vec<String>,

    /// Output folder name -> version tag, used to name result zips.
    #[serde(default)]
    pub zip_foldernames: BTreeMap<String, String>,

    /// Whether all of `zip_foldernames` are bundled into a single
    /// per-PU zip rather than one zip per folder.
    #[serde(default)]
    pub all_results_in_one_zip: bool,

    /// Opaque scheduler resource request string (e.g. `--mem=8G --cpus-per-task=4`).
    pub cluster_resources: String,

    /// Shell lines prepended to every generated submission script, before
    /// the BIDS App invocation (module loads, `source activate`, ...).
    #[serde(default)]
    pub script_preamble: Vec<String>,

    /// Per-job scratch/work directory, referenced by submission templates
    /// via a placeholder; the core never interprets this path.
    pub job_compute_space: PathBuf,

    /// Stdout/stderr substring patterns used to populate `alert_message`
    /// on a ledger row when a job's log is classified.
    #[serde(default)]
    pub alert_log_messages: Option<AlertLogMessages>,

    /// Extra files copied into the per-job compute space before the BIDS
    /// App runs (license files, template assets).
    #[serde(default)]
    pub imported_files: Vec<ImportedFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingLevel {
    Subject,
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Slurm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetOrigin {
    Raw,
    Zipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDatasetConfig {
    pub origin: DatasetOrigin,
    #[serde(default)]
    pub is_zipped: bool,
    #[serde(default)]
    pub required_files: Vec<String>,
    pub path_in_project: PathBuf,
}

/// Stdout/stderr pattern lists, checked in declaration order with
/// stdout before stderr, matching the Log Classifier's stream-then-pattern
/// ordering contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertLogMessages {
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedFile {
    pub source: PathBuf,
    pub dest_name: String,
}
