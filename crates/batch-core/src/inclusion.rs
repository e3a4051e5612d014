//! Inclusion Resolver (C1): produces the canonical, ordered set of PUs.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::{DatasetKind, InputDataset, InclusionList, ProcessingMode, Pu};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dataset root does not exist: {0}")]
    MissingDatasetRoot(PathBuf),
    #[error("no PUs remained after filtering; check required_files patterns and dataset contents")]
    EmptyAfterFiltering,
    #[error("no input datasets declared")]
    NoDatasets,
}

/// Why a candidate PU was dropped during resolution, for `check-setup`
/// observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    MissingRequiredFile { dataset: String, pattern: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedPu {
    pub pu: Pu,
    pub reason: DropReason,
}

/// A warning that does not abort resolution: an initial-list entry that
/// didn't correspond to anything discoverable in the inputs. Unlike a
/// `DroppedPu`, the PU stays in the final list — the user asked for it
/// explicitly, so resolution only flags it, never removes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownInitialEntry {
    pub raw: String,
}

#[derive(Debug, Clone)]
pub struct ResolveReport {
    pub list: InclusionList,
    pub dropped: Vec<DroppedPu>,
    pub unknown_initial_entries: Vec<UnknownInitialEntry>,
}

/// Lists directory entries and tests glob patterns relative to a PU's
/// directory, abstracted so resolution is testable without real input
/// datasets on disk (external-process/IO wrapped behind
/// interfaces).
pub trait DatasetScanner: Send + Sync {
    fn list_dir_names(&self, dir: &Path) -> std::io::Result<Vec<String>>;
    fn matches_any(&self, base_dir: &Path, pattern: &str) -> std::io::Result<bool>;
    fn dir_exists(&self, dir: &Path) -> bool;
}

/// Resolve the canonical Inclusion List.
pub fn resolve(
    scanner: &dyn DatasetScanner,
    mode: ProcessingMode,
    datasets: &[InputDataset],
    initial_list: Option<Vec<Pu>>,
) -> Result<ResolveReport, ResolveError> {
    let primary = datasets.first().ok_or(ResolveError::NoDatasets)?;
    if !scanner.dir_exists(&primary.path_in_project) {
        return Err(ResolveError::MissingDatasetRoot(primary.path_in_project.clone()));
    }

    let mut unknown_initial_entries = Vec::new();
    let user_supplied_order = initial_list.is_some();

    let seed: Vec<Pu> = match initial_list {
        Some(list) => {
            for pu in &list {
                let pu_dir = primary.path_in_project.join(&pu.subject);
                if !scanner.dir_exists(&pu_dir) {
                    unknown_initial_entries.push(UnknownInitialEntry {
                        raw: pu.components(),
                    });
                }
            }
            list
        }
        None => enumerate_from_dataset(scanner, mode, primary)?,
    };

    let mut dropped = Vec::new();
    let mut kept = Vec::new();
    for pu in seed {
        match first_failing_required_file(scanner, &pu, datasets) {
            None => kept.push(pu),
            Some((dataset, pattern)) => dropped.push(DroppedPu {
                pu,
                reason: DropReason::MissingRequiredFile { dataset, pattern },
            }),
        }
    }

    dedupe(&mut kept);
    if !user_supplied_order {
        kept.sort();
    }

    if kept.is_empty() {
        return Err(ResolveError::EmptyAfterFiltering);
    }

    Ok(ResolveReport {
        list: InclusionList::new(kept),
        dropped,
        unknown_initial_entries,
    })
}

fn enumerate_from_dataset(
    scanner: &dyn DatasetScanner,
    mode: ProcessingMode,
    dataset: &InputDataset,
) -> Result<Vec<Pu>, ResolveError> {
    let mut subjects = scanner
        .list_dir_names(&dataset.path_in_project)
        .unwrap_or_default();
    subjects.sort();

    let mut pus = Vec::new();
    match mode {
        ProcessingMode::Subject => {
            for subject in subjects {
                pus.push(Pu::subject_only(subject));
            }
        }
        ProcessingMode::Session => {
            for subject in subjects {
                let subject_dir = dataset.path_in_project.join(&subject);
                let mut sessions = scanner.list_dir_names(&subject_dir).unwrap_or_default();
                sessions.sort();
                for session in sessions {
                    pus.push(Pu::subject_session(subject.clone(), session));
                }
            }
        }
    }
    Ok(pus)
}

/// Check `required_files` for `pu` across every unzipped dataset, returning
/// the first dataset/pattern that failed to match (if any). Zipped datasets
/// are trusted and never checked.
fn first_failing_required_file(
    scanner: &dyn DatasetScanner,
    pu: &Pu,
    datasets: &[InputDataset],
) -> Option<(String, String)> {
    for dataset in datasets {
        if dataset.kind == DatasetKind::Zipped {
            continue;
        }
        let pu_dir = pu_directory(&dataset.path_in_project, pu);
        for pattern in &dataset.required_files {
            match scanner.matches_any(&pu_dir, pattern) {
                Ok(true) => continue,
                Ok(false) | Err(_) => return Some((dataset.name.clone(), pattern.clone())),
            }
        }
    }
    None
}

fn pu_directory(dataset_root: &Path, pu: &Pu) -> PathBuf {
    match &pu.session {
        Some(session) => dataset_root.join(&pu.subject).join(session),
        None => dataset_root.join(&pu.subject),
    }
}

fn dedupe(pus: &mut Vec<Pu>) {
    let mut seen = std::collections::HashSet::new();
    pus.retain(|pu| seen.insert(pu.clone()));
}

/// `std::fs`-backed scanner for real project directories.
pub struct RealDatasetScanner;

impl DatasetScanner for RealDatasetScanner {
    fn list_dir_names(&self, dir: &Path) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn matches_any(&self, base_dir: &Path, pattern: &str) -> std::io::Result<bool> {
        let full_pattern = base_dir.join(pattern);
        let pattern_str = full_pattern.to_string_lossy();
        match glob::glob(&pattern_str) {
            Ok(paths) => Ok(paths.filter_map(Result::ok).next().is_some()),
            Err(_) => Ok(false),
        }
    }

    fn dir_exists(&self, dir: &Path) -> bool {
        dir.is_dir()
    }
}
