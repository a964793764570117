//! YAML loading and section extraction
//!
//! `!env_var NAME` is replaced by the variable's value, parsed as YAML so
//! numbers and booleans keep their type. Other tags pass through untouched.

use crate::error::{ConfigError, ConfigResult};
use serde::de::DeserializeOwned;
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const ENV_VAR_TAG: &str = "!env_var";

/// Loads YAML documents relative to a configuration directory
pub struct YamlLoader {
    config_dir: PathBuf,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Read `path`; relative paths are taken from the configuration directory
    pub fn load_file(&self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = match path.as_ref() {
            p if p.is_absolute() => p.to_path_buf(),
            p => self.config_dir.join(p),
        };
        debug!("Loading {}", path.display());

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        self.load_string(&content, &path)
    }

    /// Parse `content`; `origin` only appears in error messages
    pub fn load_string(&self, content: &str, origin: &Path) -> ConfigResult<Value> {
        let parsed = serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
            path: origin.to_path_buf(),
            source,
        })?;
        resolve_tags(parsed)
    }
}

fn resolve_tags(value: Value) -> ConfigResult<Value> {
    Ok(match value {
        Value::Tagged(tagged) if tagged.tag == ENV_VAR_TAG => env_var(tagged.value)?,
        Value::Tagged(tagged) => {
            trace!("Keeping unknown tag {}", tagged.tag);
            let TaggedValue { tag, value } = *tagged;
            Value::Tagged(Box::new(TaggedValue {
                tag,
                value: resolve_tags(value)?,
            }))
        }
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| Ok((resolve_tags(k)?, resolve_tags(v)?)))
                .collect::<ConfigResult<_>>()?,
        ),
        Value::Sequence(seq) => Value::Sequence(
            seq.into_iter()
                .map(resolve_tags)
                .collect::<ConfigResult<_>>()?,
        ),
        other => other,
    })
}

fn env_var(name: Value) -> ConfigResult<Value> {
    let Value::String(var) = name else {
        return Err(ConfigError::BadTag {
            tag: ENV_VAR_TAG.to_string(),
            reason: "variable name must be a string".to_string(),
        });
    };
    let raw = std::env::var(&var).map_err(|_| ConfigError::EnvVarNotFound { var: var.clone() })?;
    debug!("Substituted environment variable {}", var);
    Ok(serde_yaml::from_str(&raw).unwrap_or(Value::String(raw)))
}

/// Load `file` from `config_dir`
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir).load_file(file)
}

/// Parse in-memory YAML as if it came from `source_name`
pub fn load_yaml_string(
    config_dir: impl Into<PathBuf>,
    content: &str,
    source_name: &str,
) -> ConfigResult<Value> {
    YamlLoader::new(config_dir).load_string(content, Path::new(source_name))
}

/// Deserialize the top-level section `key` of a loaded configuration.
///
/// A missing or empty section yields `T::default()`.
pub fn load_section<T>(config: &Value, key: &str) -> ConfigResult<T>
where
    T: DeserializeOwned + Default,
{
    match config.get(key) {
        None | Some(Value::Null) => {
            debug!("No '{}' section in configuration, using defaults", key);
            Ok(T::default())
        }
        Some(section) => {
            serde_yaml::from_value(section.clone()).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })
        }
    }
}
