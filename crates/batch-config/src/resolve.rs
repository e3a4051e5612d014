//! Maps a parsed `ProjectConfig` onto the types `batch-core` operates on:
//! `ProcessingMode`, `InputDataset`, `AlertCatalog`, and a rendered
//! submission template. The core never parses YAML itself; this is the
//! seam where the on-disk document becomes the in-memory model.

use batch_core::adapter::SubmissionTemplate;
use batch_core::model::{AlertCatalog, AlertEntry, DatasetKind, InputDataset, ProcessingMode, Stream};

use crate::schema::{DatasetOrigin, ProcessingLevel, ProjectConfig};

pub fn to_processing_mode(config: &ProjectConfig) -> ProcessingMode {
    match config.processing_level {
        ProcessingLevel::Subject => ProcessingMode::Subject,
        ProcessingLevel::Session => ProcessingMode::Session,
    }
}

pub fn to_input_datasets(config: &ProjectConfig) -> Vec<InputDataset> {
    config
        .input_datasets
        .iter()
        .map(|(name, dataset)| InputDataset {
            name: name.clone(),
            kind: match dataset.origin {
                DatasetOrigin::Raw => DatasetKind::Raw,
                DatasetOrigin::Zipped => DatasetKind::Zipped,
            },
            path_in_project: dataset.path_in_project.clone(),
            required_files: dataset.required_files.clone(),
        })
        .collect()
}

/// Stdout entries are checked before stderr entries, matching the
/// classifier's documented stream-then-pattern ordering.
pub fn to_alert_catalog(config: &ProjectConfig) -> AlertCatalog {
    let Some(alerts) = &config.alert_log_messages else {
        return AlertCatalog::default();
    };
    let mut entries = Vec::with_capacity(alerts.stdout.len() + alerts.stderr.len());
    for pattern in &alerts.stdout {
        entries.push(AlertEntry {
            stream: Stream::Stdout,
            pattern: pattern.clone(),
        });
    }
    for pattern in &alerts.stderr {
        entries.push(AlertEntry {
            stream: Stream::Stderr,
            pattern: pattern.clone(),
        });
    }
    AlertCatalog::new(entries)
}

/// Render the opaque submission script template the core hands the
/// Scheduler Adapter unmodified. Placeholders (`{PU}`, `{JOB_COMPUTE_SPACE}`,
/// `{LICENSE_FILE}`) are left in place for the adapter or the imported-files
/// step to substitute; this function only lays out what's fixed per project.
pub fn render_submission_template(config: &ProjectConfig) -> SubmissionTemplate {
    let mut lines = vec!["#!/bin/bash".to_string()];
    lines.push(format!("#SBATCH {}", config.cluster_resources));
    lines.extend(config.script_preamble.iter().cloned());

    for imported in &config.imported_files {
        lines.push(format!(
            "cp {} {{JOB_COMPUTE_SPACE}}/{}",
            imported.source.display(),
            imported.dest_name
        ));
    }

    let mut invocation = vec!["bids_app".to_string(), "{PU}".to_string()];
    invocation.extend(config.bids_app_args.iter().cloned());
    lines.push(invocation.join(" "));

    if !config.zip_foldernames.is_empty() {
        if config.all_results_in_one_zip {
            let folders: Vec<&str> = config.zip_foldernames.keys().map(String::as_str).collect();
            lines.push(format!("zip -r {{PU}}-results.zip {}", folders.join(" ")));
        } else {
            for (folder, version) in &config.zip_foldernames {
                lines.push(format!("zip -r {{PU}}-{folder}-{version}.zip {folder}"));
            }
        }
    }

    SubmissionTemplate(lines.join("\n") + "\n")
}
