//! Apple TV integration
//!
//! Config flow for devices that expose several protocols, each announced
//! separately over zeroconf with its own identifier. The pieces, leaf first:
//!
//! - [`scanner`] - bounded-time device probe
//! - [`aggregator`] - coalesces sibling discoveries into one flow
//! - [`pairing`] - pairs every service of the device in turn
//! - [`resolver`] - creates or updates the config entry
//!
//! [`AppleTvConfigFlow`] strings them together on top of the host's flow
//! manager. The network side is behind the [`AppleTvSdk`] trait.

pub mod aggregator;
pub mod config_flow;
pub mod constants;
pub mod discovery;
pub mod errors;
pub mod options_flow;
pub mod pairing;
pub mod resolver;
pub mod scanner;
pub mod sdk;
pub mod settings;

use std::sync::Arc;

use ha_config_entries::{FlowHandler, FlowManager};

pub use config_flow::AppleTvConfigFlow;
pub use constants::DOMAIN;
pub use discovery::ZeroconfServiceInfo;
pub use errors::{AppleTvError, AppleTvResult, FlowErrorReason};
pub use options_flow::AppleTvOptionsFlow;
pub use pairing::{Credentials, Outcome, PairingInput, PairingSequencer, PairingState, Transition};
pub use resolver::{resolve, AppleTvEntryData, Resolution};
pub use scanner::{probe, ProbeError};
pub use sdk::{
    AppleTvSdk, Credential, DeviceDescriptor, PairingRequirement, PairingSession, Protocol,
    SdkError, SdkResult, ServiceDescriptor,
};
pub use settings::AppleTvSettings;

/// Register the config flow with `flows`
pub fn register_config_flow(
    flows: &FlowManager,
    sdk: Arc<dyn AppleTvSdk>,
    settings: AppleTvSettings,
) {
    flows.register_handler(
        DOMAIN,
        Arc::new(move || {
            Box::new(AppleTvConfigFlow::new(sdk.clone(), settings.clone())) as Box<dyn FlowHandler>
        }),
    );
}

/// Register the options flow with the manager that runs options flows
pub fn register_options_flow(options: &FlowManager, settings: AppleTvSettings) {
    options.register_handler(
        DOMAIN,
        Arc::new(move || Box::new(AppleTvOptionsFlow::new(settings.clone())) as Box<dyn FlowHandler>),
    );
}
