//! Artifact Store Adapter (C4): list/merge/push/clone over a git result-branch
//! namespace. `git_store` is the real `git2`-backed implementation; `fake`
//! ships an in-memory backend for the test suites and the CLI's dry-run mode.

pub mod fake;
pub mod git_store;

pub use fake::{BranchRecord, InMemoryArtifactStore};
pub use git_store::GitArtifactStore;
