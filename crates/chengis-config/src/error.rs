//! Configuration error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("workflow file too large: {0} bytes (limit {1})")]
    FileTooLarge(usize, usize),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
