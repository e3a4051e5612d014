//! In-memory artifact store: a `HashMap<String, BranchRecord>` standing in
//! for a git repository's branch namespace, for the test suites and the
//! CLI's dry-run mode.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use batch_core::adapter::{AdapterError, ArtifactStore, MergeReport, MergedChunk};

/// What the fake remembers about a branch; real branch contents never
/// matter to the reconciler (it only reads branch names), so this carries
/// just enough to make conflict simulation possible in tests.
#[derive(Debug, Clone, Default)]
pub struct BranchRecord {
    pub conflicts_with_mainline: bool,
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    branches: Mutex<HashMap<String, BranchRecord>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_branch(&self, name: impl Into<String>) {
        self.branches.lock().unwrap().insert(name.into(), BranchRecord::default());
    }

    pub fn add_conflicting_branch(&self, name: impl Into<String>) {
        self.branches.lock().unwrap().insert(
            name.into(),
            BranchRecord {
                conflicts_with_mainline: true,
            },
        );
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn list_result_branches(&self) -> Result<Vec<String>, AdapterError> {
        Ok(self.branches.lock().unwrap().keys().cloned().collect())
    }

    async fn merge_branches(&self, chunk_size: usize) -> Result<MergeReport, AdapterError> {
        let mut names: Vec<String> = self.branches.lock().unwrap().keys().cloned().collect();
        names.sort();

        let mut report = MergeReport::default();
        for chunk in names.chunks(chunk_size.max(1)) {
            let conflicted = {
                let branches = self.branches.lock().unwrap();
                chunk.iter().find(|n| branches.get(*n).map(|r| r.conflicts_with_mainline).unwrap_or(false)).cloned()
            };
            if let Some(bad) = conflicted {
                let merged_count: usize = report.merged_chunks.iter().map(|c| c.branches.len()).sum();
                let _ = bad;
                report.pending_branches = names[merged_count..].to_vec();
                return Ok(report);
            }
            report.merged_chunks.push(MergedChunk {
                commit_message: format!("Merge result branches: {}", chunk.join(", ")),
                branches: chunk.to_vec(),
            });
            let mut branches = self.branches.lock().unwrap();
            for name in chunk {
                branches.remove(name);
            }
        }
        Ok(report)
    }

    async fn clone_for_sanity_check(&self, dest: &Path) -> Result<(), AdapterError> {
        std::fs::create_dir_all(dest).map_err(|e| AdapterError::Transient(e.to_string()))
    }

    async fn push_code(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn drop_local(&self, branch: &str) -> Result<(), AdapterError> {
        self.branches.lock().unwrap().remove(branch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merges_all_non_conflicting_branches() {
        let store = InMemoryArtifactStore::new();
        store.add_branch("job-1-1-sub-0001");
        store.add_branch("job-2-1-sub-0002");

        let report = store.merge_branches(10).await.unwrap();
        assert!(report.is_complete());
        assert!(store.list_result_branches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicting_branch_stops_the_chunk() {
        let store = InMemoryArtifactStore::new();
        store.add_branch("job-1-1-sub-0001");
        store.add_conflicting_branch("job-2-1-sub-0002");

        let report = store.merge_branches(10).await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.pending_branches.len(), 2);
    }
}
