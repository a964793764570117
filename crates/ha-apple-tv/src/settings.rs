//! Integration settings from the `apple_tv:` configuration section
//!
//! ```yaml
//! apple_tv:
//!   discovery_aggregation_time: 15
//!   scan_timeout: 3
//!   default_start_off: false
//! ```

use std::time::Duration;

use ha_config::{load_section, ConfigResult, Value};
use serde::{Deserialize, Deserializer};

use crate::constants::{
    DEFAULT_SCAN_TIMEOUT, DEFAULT_START_OFF, DISCOVERY_AGGREGATION_TIME, DOMAIN,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppleTvSettings {
    /// Seconds a discovery flow waits for sibling services of its device
    #[serde(deserialize_with = "seconds")]
    pub discovery_aggregation_time: Duration,
    /// Seconds a device scan may take
    #[serde(deserialize_with = "seconds")]
    pub scan_timeout: Duration,
    /// Default of the `start_off` option
    pub default_start_off: bool,
}

impl Default for AppleTvSettings {
    fn default() -> Self {
        Self {
            discovery_aggregation_time: DISCOVERY_AGGREGATION_TIME,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            default_start_off: DEFAULT_START_OFF,
        }
    }
}

impl AppleTvSettings {
    /// Read the `apple_tv` section of a loaded configuration
    pub fn from_config(config: &Value) -> ConfigResult<Self> {
        load_section(config, DOMAIN)
    }
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_config::{load_yaml_string, ConfigError};

    #[test]
    fn test_missing_section_uses_defaults() {
        let config = load_yaml_string("/config", "homeassistant: {}\n", "configuration.yaml")
            .unwrap();
        assert_eq!(
            AppleTvSettings::from_config(&config).unwrap(),
            AppleTvSettings::default()
        );
    }

    #[test]
    fn test_partial_section() {
        let config = load_yaml_string(
            "/config",
            "apple_tv:\n  discovery_aggregation_time: 0.5\n  default_start_off: true\n",
            "configuration.yaml",
        )
        .unwrap();
        let settings = AppleTvSettings::from_config(&config).unwrap();

        assert_eq!(settings.discovery_aggregation_time, Duration::from_millis(500));
        assert_eq!(settings.scan_timeout, DEFAULT_SCAN_TIMEOUT);
        assert!(settings.default_start_off);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let config =
            load_yaml_string("/config", "apple_tv:\n  scan_timeout: -1\n", "configuration.yaml")
                .unwrap();
        assert!(matches!(
            AppleTvSettings::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
