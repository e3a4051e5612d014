//! Project Configuration (C-config): schema, loading, validation, and the
//! mapping from the on-disk YAML document onto `batch-core`'s types.

pub mod resolve;
pub mod schema;
pub mod validation;

pub use schema::ProjectConfig;
pub use validation::{load_config, validate_config, ConfigError};
