//! Entry resolution
//!
//! Turns a probed device and its collected credentials into a config entry.
//! An entry that shares any identifier with the device is the same device
//! and is updated in place, keeping its unique id.

use std::collections::HashMap;
use std::sync::Arc;

use ha_config_entries::{
    ConfigEntries, ConfigEntriesResult, ConfigEntry, ConfigEntrySource, ConfigEntryUpdate,
};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::constants::{CONF_ADDRESS, CONF_CREDENTIALS, CONF_IDENTIFIERS, CONF_NAME, DOMAIN};
use crate::errors::FlowErrorReason;
use crate::pairing::Credentials;
use crate::sdk::DeviceDescriptor;

/// Data stored in an Apple TV config entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppleTvEntryData {
    pub name: String,
    pub address: String,
    pub identifiers: IndexSet<String>,
    pub credentials: Credentials,
}

impl AppleTvEntryData {
    pub fn new(device: &DeviceDescriptor, credentials: Credentials) -> Self {
        Self {
            name: device.name.clone(),
            address: device.address.to_string(),
            identifiers: device.identifiers.clone(),
            credentials,
        }
    }

    /// Read back from an entry's data; `None` if the data is malformed
    pub fn from_entry(entry: &ConfigEntry) -> Option<Self> {
        let value = serde_json::to_value(&entry.data).ok()?;
        serde_json::from_value(value).ok()
    }

    pub fn into_data(self) -> HashMap<String, Value> {
        HashMap::from([
            (CONF_NAME.to_string(), Value::String(self.name)),
            (CONF_ADDRESS.to_string(), Value::String(self.address)),
            (
                CONF_IDENTIFIERS.to_string(),
                Value::from_iter(self.identifiers),
            ),
            (
                CONF_CREDENTIALS.to_string(),
                serde_json::to_value(self.credentials).unwrap_or_default(),
            ),
        ])
    }
}

/// Identifiers stored on `entry`; entries without the list fall back to
/// their unique id
pub fn entry_identifiers(entry: &ConfigEntry) -> Vec<String> {
    match entry.data.get(CONF_IDENTIFIERS).and_then(Value::as_array) {
        Some(ids) => ids
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect(),
        None => entry.unique_id.iter().cloned().collect(),
    }
}

/// First entry of the domain sharing an identifier with `identifiers`.
///
/// There is no index on identifiers; every entry is inspected.
pub fn find_entry_by_identifiers(
    entries: &ConfigEntries,
    identifiers: &IndexSet<String>,
) -> Option<ConfigEntry> {
    entries
        .get_by_domain(DOMAIN)
        .into_iter()
        .find(|entry| {
            entry_identifiers(entry)
                .iter()
                .any(|id| identifiers.contains(id))
        })
}

/// Unique id to use for `device`: that of an entry already covering one of
/// its identifiers, else the device's preferred identifier
pub fn device_identifier(entries: &ConfigEntries, device: &DeviceDescriptor) -> Option<String> {
    find_entry_by_identifiers(entries, &device.identifiers)
        .and_then(|entry| entry.unique_id)
        .or_else(|| device.identifier().map(str::to_string))
}

/// How a finished flow ended up
#[derive(Debug, Clone)]
pub enum Resolution {
    Created(ConfigEntry),
    Updated {
        entry: ConfigEntry,
        reason: FlowErrorReason,
    },
    Aborted(FlowErrorReason),
}

/// Create or update the entry for `device`.
///
/// `source` is the source of the flow; reauth and reconfigure flows report
/// an update as `reauth_successful`.
pub async fn resolve(
    entries: &Arc<ConfigEntries>,
    device: &DeviceDescriptor,
    credentials: &Credentials,
    source: ConfigEntrySource,
) -> ConfigEntriesResult<Resolution> {
    if credentials.is_empty() {
        warn!("No protocols were paired with {}", device.name);
        return Ok(Resolution::Aborted(FlowErrorReason::SetupFailed));
    }

    let existing = find_entry_by_identifiers(entries, &device.identifiers);
    let unique_id = match existing.as_ref().and_then(|e| e.unique_id.clone()) {
        Some(unique_id) => unique_id,
        None => match device.identifier() {
            Some(identifier) => identifier.to_string(),
            None => {
                warn!("Device {} has no identifiers", device.name);
                return Ok(Resolution::Aborted(FlowErrorReason::Unknown));
            }
        },
    };

    let mut data = AppleTvEntryData::new(device, credentials.clone());

    if let Some(entry) = existing {
        let mut identifiers: IndexSet<String> = entry_identifiers(&entry).into_iter().collect();
        identifiers.extend(data.identifiers);
        data.identifiers = identifiers;

        let (entry, _) = entries
            .update(
                &entry.entry_id,
                ConfigEntryUpdate::new()
                    .data(data.into_data())
                    .unique_id(Some(unique_id)),
            )
            .await?;
        entries.schedule_reload(&entry.entry_id);

        let reason = if source.is_existing_entry() {
            FlowErrorReason::ReauthSuccessful
        } else {
            FlowErrorReason::AlreadyConfigured
        };
        info!("Updated entry {} for {}", entry.entry_id, entry.title);
        return Ok(Resolution::Updated { entry, reason });
    }

    let entry = entries
        .add(
            ConfigEntry::new(DOMAIN, device.name.clone())
                .with_unique_id(unique_id)
                .with_source(source)
                .with_data(data.into_data()),
        )
        .await?;
    Ok(Resolution::Created(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{PairingRequirement, Protocol, ServiceDescriptor};
    use ha_config_entries::Storage;
    use tempfile::TempDir;

    fn store() -> (TempDir, Arc<ConfigEntries>) {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(dir.path()))));
        (dir, entries)
    }

    fn device(ids: &[&str]) -> DeviceDescriptor {
        let protocols = [Protocol::Mrp, Protocol::AirPlay, Protocol::Companion];
        ids.iter().zip(protocols).fold(
            DeviceDescriptor::new("Den", "10.0.0.5".parse().unwrap()),
            |device, (id, protocol)| {
                device.with_service(
                    ServiceDescriptor::new(protocol, PairingRequirement::Required)
                        .with_identifier(*id),
                )
            },
        )
    }

    fn credentials() -> Credentials {
        Credentials::from([("mrp".to_string(), Some("cred".to_string()))])
    }

    #[tokio::test]
    async fn test_no_credentials_aborts() {
        let (_dir, entries) = store();
        let result = resolve(&entries, &device(&["A"]), &Credentials::new(), ConfigEntrySource::User)
            .await
            .unwrap();
        assert!(matches!(
            result,
            Resolution::Aborted(FlowErrorReason::SetupFailed)
        ));
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_creates_entry_with_preferred_identifier() {
        let (_dir, entries) = store();
        let Resolution::Created(entry) = resolve(
            &entries,
            &device(&["A", "B"]),
            &credentials(),
            ConfigEntrySource::Zeroconf,
        )
        .await
        .unwrap() else {
            panic!("expected a new entry");
        };

        assert_eq!(entry.unique_id.as_deref(), Some("A"));
        assert_eq!(entry.source, ConfigEntrySource::Zeroconf);
        let data = AppleTvEntryData::from_entry(&entry).unwrap();
        assert_eq!(data.address, "10.0.0.5");
        assert_eq!(data.credentials, credentials());
    }

    #[tokio::test]
    async fn test_reauth_update_reason() {
        let (_dir, entries) = store();
        resolve(&entries, &device(&["A"]), &credentials(), ConfigEntrySource::User)
            .await
            .unwrap();

        let result = resolve(&entries, &device(&["A"]), &credentials(), ConfigEntrySource::Reauth)
            .await
            .unwrap();
        assert!(matches!(
            result,
            Resolution::Updated {
                reason: FlowErrorReason::ReauthSuccessful,
                ..
            }
        ));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_entry_identifiers_fall_back_to_unique_id() {
        let entry = ConfigEntry::new(DOMAIN, "Den").with_unique_id("legacy");
        assert_eq!(entry_identifiers(&entry), vec!["legacy".to_string()]);
    }
}
