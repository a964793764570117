use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `!env_var` named a variable that is not set
    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    /// A tag was applied to a value it cannot take
    #[error("tag {tag} cannot be applied here: {reason}")]
    BadTag { tag: String, reason: String },

    /// A section does not match the shape its owner expects
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}
