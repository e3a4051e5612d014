//! Project Configuration validation and loading.

use std::path::Path;

use thiserror::Error;

use crate::schema::{DatasetOrigin, ProjectConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read project configuration at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed project configuration: {0}")]
    Malformed(#[from] serde_yaml::Error),
    #[error("no input datasets declared")]
    NoInputDatasets,
    #[error("input dataset '{0}' has an empty path_in_project")]
    EmptyDatasetPath(String),
    #[error("input dataset '{name}' declares origin {origin:?} but is_zipped = {is_zipped}")]
    InconsistentDatasetOrigin {
        name: String,
        origin: DatasetOrigin,
        is_zipped: bool,
    },
    #[error("cluster_resources must not be empty")]
    EmptyClusterResources,
    #[error("imported file entry has an empty dest_name")]
    EmptyImportedFileDestName,
}

/// Load and parse a Project Configuration from a YAML file. Validation is a
/// separate step (`validate_config`) so `check-setup` can report every
/// problem at once instead of failing on the first one.
pub fn load_config(path: &Path) -> Result<ProjectConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ProjectConfig = serde_yaml::from_str(&text)?;
    Ok(config)
}

/// Validate a parsed Project Configuration, accumulating every problem
/// found rather than stopping at the first.
pub fn validate_config(config: &ProjectConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.input_datasets.is_empty() {
        errors.push(ConfigError::NoInputDatasets);
    }

    for (name, dataset) in &config.input_datasets {
        if dataset.path_in_project.as_os_str().is_empty() {
            errors.push(ConfigError::EmptyDatasetPath(name.clone()));
        }
        let expected_zipped = dataset.origin == DatasetOrigin::Zipped;
        if dataset.is_zipped != expected_zipped {
            errors.push(ConfigError::InconsistentDatasetOrigin {
                name: name.clone(),
                origin: dataset.origin,
                is_zipped: dataset.is_zipped,
            });
        }
    }

    if config.cluster_resources.trim().is_empty() {
        errors.push(ConfigError::EmptyClusterResources);
    }

    for imported in &config.imported_files {
        if imported.dest_name.trim().is_empty() {
            errors.push(ConfigError::EmptyImportedFileDestName);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{InputDatasetConfig, ProcessingLevel, QueueBackend};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn valid_config() -> ProjectConfig {
        let mut input_datasets = BTreeMap::new();
        input_datasets.insert(
            "bids_raw".to_string(),
            InputDatasetConfig {
                origin: DatasetOrigin::Raw,
                is_zipped: false,
                required_files: vec!["anat/*_T1w.nii.gz".to_string()],
                path_in_project: PathBuf::from("rawdata"),
            },
        );
        ProjectConfig {
            processing_level: ProcessingLevel::Subject,
            queue: QueueBackend::Slurm,
            input_datasets,
            bids_app_args: vec!["--skip-bids-validation".to_string()],
            zip_foldernames: BTreeMap::new(),
            all_results_in_one_zip: false,
            cluster_resources: "--mem=8G --cpus-per-task=4".to_string(),
            script_preamble: vec!["module load singularity".to_string()],
            job_compute_space: PathBuf::from("/scratch/job"),
            alert_log_messages: None,
            imported_files: Vec::new(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn no_datasets_is_an_error() {
        let mut config = valid_config();
        config.input_datasets.clear();
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ConfigError::NoInputDatasets)));
    }

    #[test]
    fn inconsistent_origin_flag_is_an_error() {
        let mut config = valid_config();
        config.input_datasets.get_mut("bids_raw").unwrap().is_zipped = true;
        let errors = validate_config(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::InconsistentDatasetOrigin { .. })));
    }

    #[test]
    fn empty_cluster_resources_is_an_error() {
        let mut config = valid_config();
        config.cluster_resources = "  ".to_string();
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ConfigError::EmptyClusterResources)));
    }

    #[test]
    fn loads_yaml_from_disk() {
        let path = std::env::temp_dir().join(format!("batch-config-test-{}.yml", std::process::id()));
        let config = valid_config();
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.cluster_resources, config.cluster_resources);
        assert!(validate_config(&loaded).is_ok());

        std::fs::remove_file(&path).ok();
    }
}
