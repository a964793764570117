//! Shared fixtures for Apple TV flow tests

#![allow(dead_code)]

mod mock_sdk;

pub use mock_sdk::*;

use std::collections::HashMap;
use std::sync::Arc;

use ha_apple_tv::{
    register_config_flow, AppleTvSdk, AppleTvSettings, DeviceDescriptor, PairingRequirement,
    Protocol, ServiceDescriptor, ZeroconfServiceInfo, DOMAIN,
};
use ha_config_entries::{
    ConfigEntries, ConfigEntry, ConfigEntrySource, FlowContext, FlowManager, FlowProgress,
    FlowResult, Storage,
};
use serde_json::Value;
use tempfile::TempDir;

pub const ADDRESS: &str = "10.0.0.5";

/// Route `tracing` output through the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A device at [`ADDRESS`] with one service per `(protocol, identifier,
/// requirement)`
pub fn device(services: &[(Protocol, &str, PairingRequirement)]) -> DeviceDescriptor {
    services.iter().fold(
        DeviceDescriptor::new("Living Room", ADDRESS.parse().unwrap()).with_model("Apple TV 4K"),
        |device, (protocol, identifier, pairing)| {
            device.with_service(ServiceDescriptor::new(*protocol, *pairing).with_identifier(*identifier))
        },
    )
}

pub fn mrp_record(identifier: &str) -> ZeroconfServiceInfo {
    record(
        "_mediaremotetv._tcp.local.",
        "Living Room._mediaremotetv._tcp.local.",
        &[("UniqueIdentifier", identifier)],
    )
}

pub fn airplay_record(identifier: &str) -> ZeroconfServiceInfo {
    record(
        "_airplay._tcp.local.",
        "Living Room._airplay._tcp.local.",
        &[("deviceid", identifier)],
    )
}

pub fn companion_record(identifier: &str) -> ZeroconfServiceInfo {
    record(
        "_companion-link._tcp.local.",
        "Living Room._companion-link._tcp.local.",
        &[("rpMRtID", identifier)],
    )
}

fn record(service_type: &str, name: &str, properties: &[(&str, &str)]) -> ZeroconfServiceInfo {
    ZeroconfServiceInfo {
        host: ADDRESS.parse().unwrap(),
        port: None,
        hostname: "living-room.local.".to_string(),
        service_type: service_type.to_string(),
        name: name.to_string(),
        properties: properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

/// Entry store, flow manager and mock SDK wired together
pub struct Harness {
    _dir: TempDir,
    pub entries: Arc<ConfigEntries>,
    pub flows: FlowManager,
    pub sdk: Arc<MockSdk>,
}

impl Harness {
    pub fn new(sdk: MockSdk) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(dir.path()))));
        let flows = FlowManager::new(entries.clone());
        let sdk = Arc::new(sdk);
        let dyn_sdk: Arc<dyn AppleTvSdk> = sdk.clone();
        register_config_flow(&flows, dyn_sdk, AppleTvSettings::default());
        Self {
            _dir: dir,
            entries,
            flows,
            sdk,
        }
    }

    pub async fn add_entry(&self, unique_id: &str, data: Value) -> ConfigEntry {
        let data: HashMap<String, Value> = serde_json::from_value(data).unwrap();
        tokio_test::assert_ok!(
            self.entries
                .add(
                    ConfigEntry::new(DOMAIN, "Living Room")
                        .with_unique_id(unique_id)
                        .with_data(data),
                )
                .await
        )
    }

    pub async fn start_user(&self) -> FlowResult {
        self.flows
            .async_init(DOMAIN, FlowContext::new(ConfigEntrySource::User), None)
            .await
            .unwrap()
    }

    pub async fn start_zeroconf(&self, info: ZeroconfServiceInfo) -> FlowResult {
        self.flows
            .async_init(
                DOMAIN,
                FlowContext::new(ConfigEntrySource::Zeroconf),
                Some(serde_json::to_value(info).unwrap()),
            )
            .await
            .unwrap()
    }

    pub async fn configure(&self, flow_id: &str, input: Value) -> FlowResult {
        self.flows
            .async_configure(flow_id, Some(input))
            .await
            .unwrap()
    }

    /// A fresh entry store over the same `.storage/` directory
    pub async fn reopen(&self) -> Arc<ConfigEntries> {
        tokio_test::assert_ok!(ConfigEntries::open(Arc::new(Storage::new(self._dir.path()))).await)
    }

    pub fn progress(&self, flow_id: &str) -> FlowProgress {
        self.flows
            .async_progress(true)
            .into_iter()
            .find(|p| p.flow_id == flow_id)
            .unwrap()
    }
}
