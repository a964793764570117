//! Scriptable SDK for flow tests
//!
//! Devices returned by scans can be swapped between steps, and every
//! protocol can be given its own pairing behaviour. Session open/close
//! counts and pushed PINs are recorded.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ha_apple_tv::{
    AppleTvSdk, Credential, DeviceDescriptor, PairingSession, Protocol, SdkError, SdkResult,
};

/// How a protocol's pairing session behaves
#[derive(Debug, Clone)]
pub enum PairBehavior {
    /// We push a PIN, the user enters it on the device
    DevicePin { credentials: String },
    /// The device shows `pin`, the user types it
    UserPin { pin: u32, credentials: String },
    /// `begin` fails
    BeginFails(SdkError),
    /// Handshake completes but the device never accepts
    NeverPairs,
}

#[derive(Debug, Default)]
pub struct SessionCounters {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub pushed_pins: Mutex<Vec<u32>>,
}

pub struct MockSdk {
    devices: Mutex<Vec<DeviceDescriptor>>,
    behaviors: Mutex<HashMap<Protocol, PairBehavior>>,
    scans: AtomicUsize,
    counters: Arc<SessionCounters>,
}

impl MockSdk {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices: Mutex::new(devices),
            behaviors: Mutex::new(HashMap::new()),
            scans: AtomicUsize::new(0),
            counters: Arc::new(SessionCounters::default()),
        }
    }

    pub fn with_behavior(self, protocol: Protocol, behavior: PairBehavior) -> Self {
        self.behaviors.lock().unwrap().insert(protocol, behavior);
        self
    }

    /// Replace what later scans return
    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn pushed_pins(&self) -> Vec<u32> {
        self.counters.pushed_pins.lock().unwrap().clone()
    }
}

#[async_trait]
impl AppleTvSdk for MockSdk {
    async fn scan(
        &self,
        hosts: Option<&[IpAddr]>,
        _timeout: Duration,
    ) -> SdkResult<Vec<DeviceDescriptor>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let devices = self.devices.lock().unwrap();
        Ok(devices
            .iter()
            .filter(|d| hosts.map_or(true, |hosts| hosts.contains(&d.address)))
            .cloned()
            .collect())
    }

    async fn pair(
        &self,
        _device: &DeviceDescriptor,
        protocol: Protocol,
    ) -> SdkResult<Box<dyn PairingSession>> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&protocol)
            .cloned()
            .unwrap_or(PairBehavior::DevicePin {
                credentials: format!("{}-credentials", protocol.as_str()),
            });
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            behavior,
            counters: self.counters.clone(),
            pin: None,
            paired: false,
            closed: false,
        }))
    }
}

struct MockSession {
    behavior: PairBehavior,
    counters: Arc<SessionCounters>,
    pin: Option<u32>,
    paired: bool,
    closed: bool,
}

#[async_trait]
impl PairingSession for MockSession {
    async fn begin(&mut self) -> SdkResult<()> {
        match &self.behavior {
            PairBehavior::BeginFails(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn device_provides_pin(&self) -> bool {
        matches!(self.behavior, PairBehavior::UserPin { .. })
    }

    fn pin(&mut self, pin: u32) {
        if !self.device_provides_pin() {
            self.counters.pushed_pins.lock().unwrap().push(pin);
        }
        self.pin = Some(pin);
    }

    async fn finish(&mut self) -> SdkResult<()> {
        match &self.behavior {
            PairBehavior::UserPin { pin, .. } if self.pin != Some(*pin) => {
                Err(SdkError::Pairing("wrong PIN".to_string()))
            }
            PairBehavior::NeverPairs => Ok(()),
            _ => {
                self.paired = self.pin.is_some();
                Ok(())
            }
        }
    }

    fn has_paired(&self) -> bool {
        self.paired
    }

    fn credentials(&self) -> Option<Credential> {
        if !self.paired {
            return None;
        }
        match &self.behavior {
            PairBehavior::DevicePin { credentials } | PairBehavior::UserPin { credentials, .. } => {
                Some(credentials.clone())
            }
            _ => None,
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
