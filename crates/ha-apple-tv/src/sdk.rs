//! Device SDK seam
//!
//! The network side of the integration (scanning, the per-protocol pairing
//! handshakes) lives in an external library. This module describes what the
//! config flow needs from it: device descriptors returned by a scan, and a
//! pairing session per protocol.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Credential produced by a successful pairing
pub type Credential = String;

/// Protocols an Apple TV can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Mrp,
    Dmap,
    #[serde(rename = "airplay")]
    AirPlay,
    Companion,
    Raop,
}

impl Protocol {
    /// Stable key used in stored credentials
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mrp => "mrp",
            Protocol::Dmap => "dmap",
            Protocol::AirPlay => "airplay",
            Protocol::Companion => "companion",
            Protocol::Raop => "raop",
        }
    }

    /// Name shown to users
    pub fn display_name(&self) -> &'static str {
        match self {
            Protocol::Mrp => "MRP",
            Protocol::Dmap => "DMAP",
            Protocol::AirPlay => "AirPlay",
            Protocol::Companion => "Companion",
            Protocol::Raop => "RAOP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// What a service needs before it can be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingRequirement {
    /// Pairing is not possible with this service
    Unsupported,
    /// Pairing is possible but switched off on the device
    Disabled,
    /// The service works without credentials
    NotNeeded,
    /// Credentials must be obtained by pairing
    Required,
}

/// One protocol endpoint of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub protocol: Protocol,
    /// Stable identifier announced by this service
    pub identifier: Option<String>,
    pub pairing: PairingRequirement,
    pub requires_password: bool,
    pub enabled: bool,
}

impl ServiceDescriptor {
    pub fn new(protocol: Protocol, pairing: PairingRequirement) -> Self {
        Self {
            protocol,
            identifier: None,
            pairing,
            requires_password: false,
            enabled: true,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_password(mut self) -> Self {
        self.requires_password = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Result of a device scan; immutable once returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Every identifier the device presents, preferred one first
    pub identifiers: IndexSet<String>,
    pub address: IpAddr,
    pub name: String,
    pub model: Option<String>,
    pub services: Vec<ServiceDescriptor>,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            identifiers: IndexSet::new(),
            address,
            name: name.into(),
            model: None,
            services: Vec::new(),
        }
    }

    /// Add a service; its identifier joins the device's identifier set
    pub fn with_service(mut self, service: ServiceDescriptor) -> Self {
        if let Some(identifier) = &service.identifier {
            self.identifiers.insert(identifier.clone());
        }
        self.services.push(service);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Preferred identifier
    pub fn identifier(&self) -> Option<&str> {
        self.identifiers.first().map(String::as_str)
    }

    pub fn service(&self, protocol: Protocol) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.protocol == protocol)
    }

    /// True if `filter` names this device by address, name or any service
    /// identifier. No filter matches everything.
    pub fn matches(&self, filter: Option<&str>) -> bool {
        let Some(filter) = filter else {
            return true;
        };
        filter == self.address.to_string()
            || filter == self.name
            || self
                .services
                .iter()
                .any(|s| s.identifier.as_deref() == Some(filter))
    }
}

/// Errors reported by the SDK
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Device asked to back off")]
    BackOff,

    #[error("Pairing failed: {0}")]
    Pairing(String),

    #[error("{0}")]
    Other(String),
}

pub type SdkResult<T> = Result<T, SdkError>;

/// A pairing handshake with one protocol of one device
#[async_trait]
pub trait PairingSession: Send + Sync {
    /// Start the handshake
    async fn begin(&mut self) -> SdkResult<()>;

    /// True when the device shows a PIN that the user has to type in
    fn device_provides_pin(&self) -> bool;

    /// Supply the PIN, either typed by the user or shown on the device
    fn pin(&mut self, pin: u32);

    /// Complete the handshake
    async fn finish(&mut self) -> SdkResult<()>;

    fn has_paired(&self) -> bool;

    /// Credentials obtained by a completed handshake
    fn credentials(&self) -> Option<Credential>;

    /// Release the connection; safe to call more than once
    async fn close(&mut self);
}

/// Entry point into the device SDK
#[async_trait]
pub trait AppleTvSdk: Send + Sync {
    /// Scan for devices for at most `timeout`. `hosts` limits the scan to
    /// unicast probes of those addresses.
    async fn scan(
        &self,
        hosts: Option<&[IpAddr]>,
        timeout: Duration,
    ) -> SdkResult<Vec<DeviceDescriptor>>;

    /// Open a pairing session for one protocol of `device`
    async fn pair(
        &self,
        device: &DeviceDescriptor,
        protocol: Protocol,
    ) -> SdkResult<Box<dyn PairingSession>>;
}
