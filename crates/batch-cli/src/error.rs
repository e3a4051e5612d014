//! CLI-level error taxonomy: wraps every crate boundary's own error type
//! and maps it onto the documented exit codes (`0` success, `1`
//! user/config error, `2` cluster/IO error, `3` partial success with
//! warnings — `3` is returned directly by command handlers, never
//! constructed here).

use batch_config::ConfigError;
use batch_core::adapter::AdapterError;
use batch_core::finalize::FinalizeError;
use batch_core::inclusion::ResolveError;
use batch_core::ledger::LedgerError;
use batch_core::PreconditionError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("invalid project configuration: {}", summarize(.0))]
    InvalidConfig(Vec<ConfigError>),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn summarize(errors: &[ConfigError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::InvalidConfig(_) | CliError::Resolve(_) | CliError::Precondition(_) => 1,
            CliError::Ledger(_) | CliError::Adapter(_) | CliError::Io(_) => 2,
            CliError::Finalize(inner) => match inner {
                FinalizeError::Precondition(_) => 1,
                FinalizeError::Adapter(_) => 2,
            },
        }
    }
}
