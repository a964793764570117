//! YAML configuration loading
//!
//! Loads `configuration.yaml` style files and hands typed sections to the
//! integrations that own them.
//!
//! Supported custom tags:
//!
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use ha_config::{load_yaml, load_section};
//!
//! let config = load_yaml("/config", "configuration.yaml")?;
//! let settings: MySettings = load_section(&config, "my_domain")?;
//! ```

mod error;
mod loader;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_section, load_yaml, load_yaml_string, YamlLoader};

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
