pub mod adapter;
pub mod classifier;
pub mod error;
pub mod finalize;
pub mod inclusion;
pub mod ledger;
pub mod model;
pub mod planner;
pub mod reconcile;

pub use adapter::{ArtifactStore, Filesystem, RealFilesystem, SchedulerAdapter};
pub use error::{ConsistencyWarning, PreconditionError};
pub use inclusion::RealDatasetScanner;
pub use ledger::Ledger;
pub use model::{JobId, LedgerRow, Pu, TaskId};
