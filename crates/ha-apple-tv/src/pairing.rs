//! Pairing sequencer
//!
//! Walks the enabled services of a device one at a time and collects a
//! credential for each protocol that can provide one. Every user-facing
//! pause is a [`PairingState`]; [`PairingSequencer::advance`] is the only
//! way to move between them.
//!
//! At most one pairing session is open at any time. It is closed before the
//! next service is looked at, before the sequencer gives up, and by
//! [`PairingSequencer::close`] when the owning flow goes away.

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use rand::Rng;
use tracing::{debug, error, warn};

use crate::constants::PIN_RANGE;
use crate::errors::FlowErrorReason;
use crate::sdk::{
    AppleTvSdk, Credential, DeviceDescriptor, PairingRequirement, PairingSession, Protocol,
    SdkError,
};

/// Credentials collected so far, keyed by protocol tag. `None` marks a
/// protocol that works without pairing.
pub type Credentials = IndexMap<String, Option<Credential>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    NotStarted,
    /// The service needs a password, which is not supported
    AwaitingPasswordNotice(Protocol),
    /// Pairing is switched off on the device for this protocol
    AwaitingProtocolDisabledNotice(Protocol),
    /// Session open, handshake under way
    Pairing(Protocol),
    /// A generated PIN was pushed to the session; the user enters it on the
    /// device and confirms here
    AwaitingDevicePin { protocol: Protocol, pin: u32 },
    /// The device shows a PIN that the user types in here
    AwaitingUserPin(Protocol),
    /// The service could not be reached and will be skipped
    AwaitingServiceProblemNotice(Protocol),
    Done,
}

impl PairingState {
    /// Form step shown to the user in this state
    pub fn step_id(&self) -> Option<&'static str> {
        match self {
            PairingState::AwaitingPasswordNotice(_) => Some("password"),
            PairingState::AwaitingProtocolDisabledNotice(_) => Some("protocol_disabled"),
            PairingState::AwaitingDevicePin { .. } => Some("pair_no_pin"),
            PairingState::AwaitingUserPin(_) => Some("pair_with_pin"),
            PairingState::AwaitingServiceProblemNotice(_) => Some("service_problem"),
            PairingState::NotStarted | PairingState::Pairing(_) | PairingState::Done => None,
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        match *self {
            PairingState::AwaitingPasswordNotice(p)
            | PairingState::AwaitingProtocolDisabledNotice(p)
            | PairingState::Pairing(p)
            | PairingState::AwaitingUserPin(p)
            | PairingState::AwaitingServiceProblemNotice(p)
            | PairingState::AwaitingDevicePin { protocol: p, .. } => Some(p),
            PairingState::NotStarted | PairingState::Done => None,
        }
    }
}

/// User action fed into the sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingInput {
    /// Begin with the first service
    Start,
    /// The user dismissed a notice or confirmed the device PIN
    Acknowledge,
    /// PIN typed by the user
    Pin(u32),
}

/// How starting a handshake went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// This service is skipped, the others continue
    Skip,
    /// The whole flow stops
    Fatal(FlowErrorReason),
}

impl Outcome {
    fn from_sdk_error(err: &SdkError) -> Self {
        match err {
            SdkError::ConnectionFailed(_) => Outcome::Skip,
            SdkError::BackOff => Outcome::Fatal(FlowErrorReason::Backoff),
            SdkError::Pairing(_) => Outcome::Fatal(FlowErrorReason::InvalidAuth),
            SdkError::Other(_) => Outcome::Fatal(FlowErrorReason::Unknown),
        }
    }
}

/// Result of one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Waiting for the user in the current state; `error` is shown inline
    Prompt { error: Option<FlowErrorReason> },
    /// Every service has been handled
    Done,
    /// The flow must abort
    Abort(FlowErrorReason),
}

pub struct PairingSequencer {
    sdk: Arc<dyn AppleTvSdk>,
    device: DeviceDescriptor,
    queue: VecDeque<Protocol>,
    credentials: Credentials,
    session: Option<Box<dyn PairingSession>>,
    state: PairingState,
}

impl PairingSequencer {
    /// Queue every enabled service of `device`, in device order
    pub fn new(sdk: Arc<dyn AppleTvSdk>, device: DeviceDescriptor) -> Self {
        let queue = device
            .services
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.protocol)
            .collect();
        Self {
            sdk,
            device,
            queue,
            credentials: Credentials::new(),
            session: None,
            state: PairingState::NotStarted,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn has_open_session(&self) -> bool {
        self.session.is_some()
    }

    /// Apply `input` to the current state
    pub async fn advance(&mut self, input: PairingInput) -> Transition {
        match (self.state, input) {
            (PairingState::NotStarted, _) => self.next().await,
            (
                PairingState::AwaitingPasswordNotice(_)
                | PairingState::AwaitingProtocolDisabledNotice(_)
                | PairingState::AwaitingServiceProblemNotice(_),
                PairingInput::Acknowledge,
            ) => self.next().await,
            (PairingState::AwaitingUserPin(protocol), PairingInput::Pin(pin)) => {
                self.submit_user_pin(protocol, pin).await
            }
            (PairingState::AwaitingDevicePin { protocol, .. }, PairingInput::Acknowledge) => {
                self.confirm_device_pin(protocol).await
            }
            (PairingState::Done, _) => Transition::Done,
            (state, input) => {
                debug!(?state, ?input, "Input does not apply, showing step again");
                Transition::Prompt { error: None }
            }
        }
    }

    /// Close any open session
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    /// Move on to the next service that needs the user or can be paired
    async fn next(&mut self) -> Transition {
        self.close().await;

        while let Some(protocol) = self.queue.pop_front() {
            let Some(service) = self.device.service(protocol) else {
                continue;
            };

            if service.requires_password {
                self.state = PairingState::AwaitingPasswordNotice(protocol);
                return Transition::Prompt { error: None };
            }

            match service.pairing {
                PairingRequirement::Unsupported => {
                    debug!("{} does not support pairing", protocol);
                }
                PairingRequirement::Disabled => {
                    self.state = PairingState::AwaitingProtocolDisabledNotice(protocol);
                    return Transition::Prompt { error: None };
                }
                PairingRequirement::NotNeeded => {
                    debug!("{} does not require pairing", protocol);
                    self.credentials.insert(protocol.as_str().to_string(), None);
                }
                PairingRequirement::Required => {
                    debug!("{} requires pairing", protocol);
                    return self.start_pairing(protocol).await;
                }
            }
        }

        self.state = PairingState::Done;
        Transition::Done
    }

    async fn start_pairing(&mut self, protocol: Protocol) -> Transition {
        self.state = PairingState::Pairing(protocol);

        match self.begin(protocol).await {
            Outcome::Success => {}
            Outcome::Skip => {
                self.state = PairingState::AwaitingServiceProblemNotice(protocol);
                return Transition::Prompt { error: None };
            }
            Outcome::Fatal(reason) => {
                self.close().await;
                return Transition::Abort(reason);
            }
        }

        let Some(session) = self.session.as_mut() else {
            return Transition::Abort(FlowErrorReason::Unknown);
        };
        if session.device_provides_pin() {
            self.state = PairingState::AwaitingUserPin(protocol);
        } else {
            let pin = rand::thread_rng().gen_range(PIN_RANGE);
            session.pin(pin);
            self.state = PairingState::AwaitingDevicePin { protocol, pin };
        }
        Transition::Prompt { error: None }
    }

    /// Open a session for `protocol` and start the handshake
    async fn begin(&mut self, protocol: Protocol) -> Outcome {
        let session = match self.sdk.pair(&self.device, protocol).await {
            Ok(session) => self.session.insert(session),
            Err(err) => return Self::classify(protocol, &err),
        };

        match session.begin().await {
            Ok(()) => Outcome::Success,
            Err(err) => Self::classify(protocol, &err),
        }
    }

    fn classify(protocol: Protocol, err: &SdkError) -> Outcome {
        let outcome = Outcome::from_sdk_error(err);
        match outcome {
            Outcome::Skip => warn!("Could not connect to {}: {}", protocol, err),
            Outcome::Fatal(FlowErrorReason::Unknown) => {
                error!("Unexpected error pairing {}: {}", protocol, err)
            }
            _ => warn!("Pairing {} failed: {}", protocol, err),
        }
        outcome
    }

    async fn submit_user_pin(&mut self, protocol: Protocol, pin: u32) -> Transition {
        let Some(session) = self.session.as_mut() else {
            return Transition::Abort(FlowErrorReason::Unknown);
        };

        session.pin(pin);
        match session.finish().await {
            Ok(()) => {
                self.store_credentials(protocol);
                self.next().await
            }
            Err(SdkError::Pairing(reason)) => {
                warn!("Authentication problem with {}: {}", protocol, reason);
                Transition::Prompt {
                    error: Some(FlowErrorReason::InvalidAuth),
                }
            }
            Err(err) => {
                error!("Unexpected error finishing {}: {}", protocol, err);
                Transition::Prompt {
                    error: Some(FlowErrorReason::Unknown),
                }
            }
        }
    }

    async fn confirm_device_pin(&mut self, protocol: Protocol) -> Transition {
        let Some(session) = self.session.as_mut() else {
            return Transition::Abort(FlowErrorReason::Unknown);
        };

        if let Err(err) = session.finish().await {
            warn!("Finishing {} failed: {}", protocol, err);
        }
        if session.has_paired() {
            self.store_credentials(protocol);
            return self.next().await;
        }

        self.close().await;
        Transition::Abort(FlowErrorReason::DeviceDidNotPair)
    }

    fn store_credentials(&mut self, protocol: Protocol) {
        let credentials = self.session.as_ref().and_then(|s| s.credentials());
        debug!(
            "Paired {} (credentials: {})",
            protocol,
            credentials.is_some()
        );
        self.credentials
            .insert(protocol.as_str().to_string(), credentials);
    }
}
