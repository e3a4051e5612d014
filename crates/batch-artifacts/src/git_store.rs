//! Artifact Store Adapter (C4) implemented against `git2`: mainline is the
//! repository's default branch, result branches are plain local branches
//! named per the scheme in [`batch_core::adapter::branch_name_for`].
//! `git2` calls block, so each one runs on a `spawn_blocking` worker;
//! `push_code`/`drop_local` shell out to the `git` CLI instead, since
//! libgit2 has no credential-helper-aware push story as simple as the
//! system `git` binary's.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{BranchType, Commit, Repository, Signature};
use tracing::{debug, info, warn};

use batch_core::adapter::{AdapterError, ArtifactStore, MergeReport, MergedChunk};

pub struct GitArtifactStore {
    repo_path: PathBuf,
}

impl GitArtifactStore {
    /// Opens an existing repository at `repo_path`, failing fast if it
    /// isn't one.
    pub fn open(repo_path: impl Into<PathBuf>) -> Result<Self, AdapterError> {
        let repo_path = repo_path.into();
        Repository::open(&repo_path).map_err(git_err)?;
        Ok(Self { repo_path })
    }
}

fn git_err(e: git2::Error) -> AdapterError {
    AdapterError::Transient(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> AdapterError {
    AdapterError::Transient(format!("git worker task panicked: {e}"))
}

fn list_result_branch_names(repo: &Repository) -> Result<Vec<String>, AdapterError> {
    let mut names = Vec::new();
    for entry in repo.branches(Some(BranchType::Local)).map_err(git_err)? {
        let (branch, _) = entry.map_err(git_err)?;
        if let Some(name) = branch.name().map_err(git_err)? {
            if batch_core::adapter::parse_branch_components(name).is_some() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

fn delete_local_branch(repo: &Repository, name: &str) -> Result<(), AdapterError> {
    repo.find_branch(name, BranchType::Local).map_err(git_err)?.delete().map_err(git_err)
}

/// Octopus-merges every branch in `chunk` into the current mainline HEAD as
/// a single commit: iteratively fold each branch's tree into an
/// accumulating merge tree, then commit once with the mainline tip plus
/// every chunk branch tip as parents. Returns the commit message (which
/// names the included branches) on success; any conflicting branch aborts
/// the whole chunk before anything is written.
fn merge_one_chunk(repo: &Repository, chunk: &[String]) -> Result<String, AdapterError> {
    let head_commit = repo.head().map_err(git_err)?.peel_to_commit().map_err(git_err)?;
    let mut combined_tree = head_commit.tree().map_err(git_err)?;
    let mut parents: Vec<Commit> = vec![head_commit.clone()];

    for name in chunk {
        let branch = repo.find_branch(name, BranchType::Local).map_err(git_err)?;
        let branch_commit = branch.get().peel_to_commit().map_err(git_err)?;
        let base_oid = repo
            .merge_base(head_commit.id(), branch_commit.id())
            .map_err(git_err)?;
        let base_tree = repo.find_commit(base_oid).map_err(git_err)?.tree().map_err(git_err)?;
        let branch_tree = branch_commit.tree().map_err(git_err)?;

        let mut index = repo
            .merge_trees(&base_tree, &combined_tree, &branch_tree, None)
            .map_err(git_err)?;
        if index.has_conflicts() {
            return Err(AdapterError::Rejected(format!(
                "branch {name} conflicts with mainline, chunk aborted"
            )));
        }
        let tree_oid = index.write_tree_to(repo).map_err(git_err)?;
        combined_tree = repo.find_tree(tree_oid).map_err(git_err)?;
        parents.push(branch_commit);
    }

    let sig = repo
        .signature()
        .or_else(|_| Signature::now("batch-orchestrator", "batch-orchestrator@localhost"))
        .map_err(git_err)?;
    let message = format!("Merge result branches: {}", chunk.join(", "));
    let parent_refs: Vec<&Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, &message, &combined_tree, &parent_refs)
        .map_err(git_err)?;
    Ok(message)
}

fn merge_branches_blocking(repo_path: &Path, chunk_size: usize) -> Result<MergeReport, AdapterError> {
    let repo = Repository::open(repo_path).map_err(git_err)?;
    let mut branches = list_result_branch_names(&repo)?;
    branches.sort(); // lexicographic chunk order: determinism across runs

    let mut report = MergeReport::default();
    for chunk in branches.chunks(chunk_size.max(1)) {
        match merge_one_chunk(&repo, chunk) {
            Ok(commit_message) => {
                info!(chunk = ?chunk, "merged chunk");
                report.merged_chunks.push(MergedChunk {
                    commit_message,
                    branches: chunk.to_vec(),
                });
                for name in chunk {
                    if let Err(e) = delete_local_branch(&repo, name) {
                        warn!(branch = name, error = %e, "merged branch left undeleted");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "merge chunk failed, leaving repository in last-good state");
                let merged_count: usize = report.merged_chunks.iter().map(|c| c.branches.len()).sum();
                report.pending_branches = branches[merged_count..].to_vec();
                return Ok(report);
            }
        }
    }
    Ok(report)
}

fn clone_blocking(repo_path: &Path, dest: &Path) -> Result<(), AdapterError> {
    git2::build::RepoBuilder::new()
        .clone(&repo_path.to_string_lossy(), dest)
        .map_err(git_err)?;
    Ok(())
}

async fn run_git(repo_path: &Path, args: &[&str]) -> Result<(), AdapterError> {
    debug!(?args, "git");
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .args(args)
        .output()
        .await
        .map_err(|e| AdapterError::Transient(format!("spawning git: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(AdapterError::Transient(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

#[async_trait]
impl ArtifactStore for GitArtifactStore {
    async fn list_result_branches(&self) -> Result<Vec<String>, AdapterError> {
        let repo_path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&repo_path).map_err(git_err)?;
            list_result_branch_names(&repo)
        })
        .await
        .map_err(join_err)?
    }

    async fn merge_branches(&self, chunk_size: usize) -> Result<MergeReport, AdapterError> {
        let repo_path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || merge_branches_blocking(&repo_path, chunk_size))
            .await
            .map_err(join_err)?
    }

    async fn clone_for_sanity_check(&self, dest: &Path) -> Result<(), AdapterError> {
        let repo_path = self.repo_path.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || clone_blocking(&repo_path, &dest))
            .await
            .map_err(join_err)?
    }

    async fn push_code(&self) -> Result<(), AdapterError> {
        run_git(&self.repo_path, &["push"]).await
    }

    async fn drop_local(&self, branch: &str) -> Result<(), AdapterError> {
        run_git(&self.repo_path, &["branch", "-D", branch]).await
    }
}
