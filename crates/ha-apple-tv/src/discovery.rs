//! Zeroconf discovery records
//!
//! Each protocol of a device is announced as its own mDNS service. The
//! identifier carried by a record depends on the service type.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// One zeroconf service announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroconfServiceInfo {
    pub host: IpAddr,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub hostname: String,
    /// Fully qualified service type, e.g. `_mediaremotetv._tcp.local.`
    #[serde(rename = "type")]
    pub service_type: String,
    /// Fully qualified instance name, e.g. `Den._mediaremotetv._tcp.local.`
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ZeroconfServiceInfo {
    /// Service type without the trailing dot
    pub fn short_type(&self) -> &str {
        self.service_type
            .strip_suffix('.')
            .unwrap_or(&self.service_type)
    }

    /// Instance name with the service type removed
    pub fn instance_name(&self) -> String {
        self.name.replace(&format!(".{}.", self.short_type()), "")
    }

    /// TXT record lookup; keys are case-insensitive
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Stable device identifier announced by this service, if any
    pub fn unique_id(&self) -> Option<String> {
        let name = self.instance_name();
        let id = match self.short_type() {
            "_mediaremotetv._tcp.local" => self.property("UniqueIdentifier")?.to_string(),
            "_touch-able._tcp.local" | "_appletv-v2._tcp.local" => name,
            "_hscp._tcp.local" => self.property("Machine ID")?.to_string(),
            "_airplay._tcp.local" => self.property("deviceid")?.to_string(),
            "_raop._tcp.local" => name.split('@').next()?.to_string(),
            "_companion-link._tcp.local" => self.property("rpMRtID")?.to_string(),
            _ => return None,
        };
        (!id.is_empty()).then_some(id)
    }
}
