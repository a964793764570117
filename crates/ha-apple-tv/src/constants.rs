//! Constants for the Apple TV integration

use std::time::Duration;

pub const DOMAIN: &str = "apple_tv";

pub const CONF_ADDRESS: &str = "address";
pub const CONF_NAME: &str = "name";
pub const CONF_IDENTIFIERS: &str = "identifiers";
pub const CONF_CREDENTIALS: &str = "credentials";
pub const CONF_START_OFF: &str = "start_off";
pub const CONF_PIN: &str = "pin";

/// Form field of the user step: address, name or identifier
pub const DEVICE_INPUT: &str = "device_input";

pub const DEFAULT_START_OFF: bool = false;

/// Hard limit on a device scan
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a discovery flow waits for sibling services of the same device
pub const DISCOVERY_AGGREGATION_TIME: Duration = Duration::from_secs(15);

/// Model placeholder used when the device does not report one
pub const DEFAULT_MODEL: &str = "Apple TV";

/// Pairing PINs pushed to the device are in this range
pub const PIN_RANGE: std::ops::RangeInclusive<u32> = 1000..=9999;
