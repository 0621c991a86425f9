//! Error types for configuration loading

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The document parsed but does not have the shape of a hub configuration
    #[error("invalid hub configuration: {0}")]
    Schema(#[source] serde_yaml::Error),

    #[error("secret '{key}' not found in {path}")]
    SecretNotFound { key: String, path: PathBuf },

    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    #[error("{tag} expects {expected}")]
    BadTagArgument { tag: String, expected: &'static str },

    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("circular include: {}", chain.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" -> "))]
    CircularInclude { chain: Vec<PathBuf> },

    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}
