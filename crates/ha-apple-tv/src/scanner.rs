//! Device probe
//!
//! Bounded-time scan for a single device matching a filter.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::sdk::{AppleTvSdk, DeviceDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("No matching device found")]
    NotFound,
}

/// Hosts to probe for `filter`: a literal address restricts the scan to that
/// address, anything else scans the whole network
pub fn host_filter(filter: Option<&str>) -> Option<Vec<IpAddr>> {
    filter
        .and_then(|f| f.parse::<IpAddr>().ok())
        .map(|address| vec![address])
}

/// Scan for the first device matching `filter`.
///
/// The SDK is asked to finish within `timeout`, and a scan still running
/// when it expires counts as nothing found.
#[instrument(skip(sdk))]
pub async fn probe(
    sdk: &dyn AppleTvSdk,
    filter: Option<&str>,
    timeout: Duration,
) -> Result<DeviceDescriptor, ProbeError> {
    let hosts = host_filter(filter);
    let scan = sdk.scan(hosts.as_deref(), timeout);

    let devices = match tokio::time::timeout(timeout, scan).await {
        Ok(Ok(devices)) => devices,
        Ok(Err(err)) => {
            warn!("Scan failed: {}", err);
            return Err(ProbeError::NotFound);
        }
        Err(_) => {
            warn!("Scan did not finish within {:?}", timeout);
            return Err(ProbeError::NotFound);
        }
    };

    let found = devices.into_iter().find(|d| d.matches(filter));
    match &found {
        Some(device) => debug!(name = %device.name, address = %device.address, "Found device"),
        None => debug!("No device matched"),
    }
    found.ok_or(ProbeError::NotFound)
}
