//! Config flow for the Apple TV integration
//!
//! A flow starts from the user (typing an address, name or identifier),
//! from zeroconf (one flow per announced protocol, coalesced by the
//! aggregator), or from a reauth/reconfigure request for an existing entry.
//! All of them end in the pairing sequencer and the entry resolver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ha_config_entries::{
    AbortFlow, ConfigEntryUpdate, ConfigEntrySource, FlowHandle, FlowHandler, FlowResult,
    FormField,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, instrument};

use crate::aggregator::aggregate;
use crate::constants::{CONF_ADDRESS, CONF_PIN, DEFAULT_MODEL, DEVICE_INPUT};
use crate::discovery::ZeroconfServiceInfo;
use crate::errors::{AppleTvError, AppleTvResult, FlowErrorReason};
use crate::pairing::{PairingInput, PairingSequencer, PairingState, Transition};
use crate::resolver::{device_identifier, entry_identifiers, resolve, Resolution};
use crate::scanner::probe;
use crate::sdk::{AppleTvSdk, DeviceDescriptor};
use crate::settings::AppleTvSettings;

/// Form currently shown by the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    User,
    Confirm,
    Reconfigure,
    /// One of the pairing forms; the sequencer knows which
    Pairing,
}

#[derive(Debug, Deserialize)]
struct UserInput {
    device_input: String,
}

#[derive(Debug, Deserialize)]
struct PinInput {
    pin: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ReauthData {
    #[serde(default)]
    name: Option<String>,
}

pub struct AppleTvConfigFlow {
    sdk: Arc<dyn AppleTvSdk>,
    settings: AppleTvSettings,
    step: Option<Step>,
    scan_filter: Option<String>,
    device: Option<DeviceDescriptor>,
    pairing: Option<PairingSequencer>,
}

impl AppleTvConfigFlow {
    pub fn new(sdk: Arc<dyn AppleTvSdk>, settings: AppleTvSettings) -> Self {
        Self {
            sdk,
            settings,
            step: None,
            scan_filter: None,
            device: None,
            pairing: None,
        }
    }

    fn show(&mut self, step: Step, result: FlowResult) -> AppleTvResult<FlowResult> {
        self.step = Some(step);
        Ok(result)
    }

    fn device(&self) -> AppleTvResult<&DeviceDescriptor> {
        self.device
            .as_ref()
            .ok_or_else(|| AppleTvError::Unexpected("no device has been probed".to_string()))
    }

    async fn step_user(
        &mut self,
        flow: &FlowHandle,
        user_input: Option<Value>,
    ) -> AppleTvResult<FlowResult> {
        let mut errors = HashMap::new();

        if let Some(input) = user_input {
            let found = match serde_json::from_value::<UserInput>(input) {
                Ok(input) => {
                    self.scan_filter = Some(input.device_input);
                    self.find_device(flow, false).await
                }
                Err(err) => Err(err.into()),
            };

            let reason = match found {
                Ok(()) => {
                    let device = self.device()?;
                    let unique_id = device_identifier(flow.entries(), device);
                    let identifiers = device.identifiers.clone();
                    flow.set_unique_id(unique_id.as_deref(), false)?;
                    flow.update_context(|c| c.all_identifiers = identifiers);
                    return self.step_confirm(flow, None).await;
                }
                Err(AppleTvError::DeviceNotFound) => FlowErrorReason::NoDevicesFound,
                Err(AppleTvError::DeviceAlreadyConfigured) => FlowErrorReason::AlreadyConfigured,
                Err(AppleTvError::Abort(abort)) => return Err(abort.into()),
                Err(err) => {
                    error!("Unexpected exception: {}", err);
                    FlowErrorReason::Unknown
                }
            };
            errors.insert("base".to_string(), reason.as_str().to_string());
        }

        let form = FlowResult::form("user")
            .with_schema(vec![FormField::required(DEVICE_INPUT, "string")])
            .with_errors(errors);
        self.show(Step::User, form)
    }

    #[instrument(skip_all, fields(host = %info.host, service = %info.service_type))]
    async fn step_zeroconf(
        &mut self,
        flow: &FlowHandle,
        info: ZeroconfServiceInfo,
    ) -> AppleTvResult<FlowResult> {
        let host = info.host.to_string();
        flow.abort_entries_match(&HashMap::from([(CONF_ADDRESS.to_string(), json!(host))]))?;

        let Some(unique_id) = info.unique_id() else {
            debug!("No identifier in zeroconf record {}", info.name);
            return Err(FlowErrorReason::Unknown.into());
        };
        self.scan_filter = Some(host.clone());
        flow.update_context(|c| {
            c.all_identifiers.insert(unique_id.clone());
        });

        aggregate(flow, &host, &unique_id, self.settings.discovery_aggregation_time).await?;

        self.find_device_or_abort(flow, false).await?;
        self.found_zeroconf_device(flow).await
    }

    async fn found_zeroconf_device(&mut self, flow: &FlowHandle) -> AppleTvResult<FlowResult> {
        let device = self.device()?;
        let identifiers = device.identifiers.clone();
        let address = device.address.to_string();
        let unique_id = device_identifier(flow.entries(), device);

        flow.update_context(|c| c.all_identifiers.extend(identifiers));
        flow.set_unique_id(unique_id.as_deref(), true)?;
        flow.abort_if_unique_id_configured(Some(HashMap::from([(
            CONF_ADDRESS.to_string(),
            json!(address),
        )])))
        .await?;
        flow.update_context(|c| c.identifier = unique_id);

        self.step_confirm(flow, None).await
    }

    async fn step_confirm(
        &mut self,
        flow: &FlowHandle,
        user_input: Option<Value>,
    ) -> AppleTvResult<FlowResult> {
        if user_input.is_none() {
            let device = self.device()?;
            let form = FlowResult::form("confirm")
                .with_placeholder("name", device.name.clone())
                .with_placeholder("type", device.model.as_deref().unwrap_or(DEFAULT_MODEL));
            return self.show(Step::Confirm, form);
        }

        let expected = flow.context().all_identifiers;
        let covered = |device: &DeviceDescriptor| {
            expected.iter().all(|id| device.identifiers.contains(id))
        };

        if !covered(self.device()?) {
            debug!("Probe missed identifiers seen during discovery, scanning again");
            match self.find_device(flow, true).await {
                Ok(()) => {}
                Err(AppleTvError::DeviceNotFound) => {
                    return Err(FlowErrorReason::DeviceNotFound.into())
                }
                Err(err) => return Err(err),
            }
        }
        if !covered(self.device()?) {
            return Err(FlowErrorReason::InconsistentDevice.into());
        }

        self.start_pairing(flow).await
    }

    async fn step_reauth(&mut self, flow: &FlowHandle, data: Option<Value>) -> AppleTvResult<FlowResult> {
        let data: ReauthData = match data {
            Some(value) => serde_json::from_value(value)?,
            None => ReauthData::default(),
        };
        let entry = flow
            .context()
            .entry_id
            .and_then(|entry_id| flow.entries().get(&entry_id));
        let name = data
            .name
            .or_else(|| entry.as_ref().map(|e| e.title.clone()))
            .unwrap_or_default();

        flow.update_context(|c| {
            c.title_placeholders = HashMap::from([
                ("name".to_string(), name),
                ("type".to_string(), DEFAULT_MODEL.to_string()),
            ]);
        });
        self.step_reconfigure(flow, None).await
    }

    async fn step_reconfigure(
        &mut self,
        flow: &FlowHandle,
        user_input: Option<Value>,
    ) -> AppleTvResult<FlowResult> {
        if user_input.is_some() {
            self.find_device_or_abort(flow, true).await?;
            return self.start_pairing(flow).await;
        }

        if self.scan_filter.is_none() {
            let context = flow.context();
            let unique_id = context.unique_id.or_else(|| {
                context
                    .entry_id
                    .and_then(|entry_id| flow.entries().get(&entry_id))
                    .and_then(|entry| entry.unique_id)
            });
            flow.update_context(|c| c.identifier = unique_id.clone());
            self.scan_filter = unique_id;
        }
        self.show(Step::Reconfigure, FlowResult::form("reconfigure"))
    }

    /// Probe for the device matching the scan filter.
    ///
    /// Entries already covering the device get their address refreshed.
    /// Unless `allow_exist` is set, such an entry makes the device count as
    /// already configured.
    async fn find_device(&mut self, flow: &FlowHandle, allow_exist: bool) -> AppleTvResult<()> {
        let device = probe(
            self.sdk.as_ref(),
            self.scan_filter.as_deref(),
            self.settings.scan_timeout,
        )
        .await?;

        let model = device.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let name = device.name.clone();
        flow.update_context(|c| {
            c.title_placeholders =
                HashMap::from([("name".to_string(), name), ("type".to_string(), model)]);
        });

        let address = json!(device.address.to_string());
        let mut configured = false;
        for entry in flow.current_entries() {
            if !entry_identifiers(&entry)
                .iter()
                .any(|id| device.identifiers.contains(id))
            {
                continue;
            }
            configured = true;
            if entry.data.get(CONF_ADDRESS) != Some(&address) {
                let mut data = entry.data.clone();
                data.insert(CONF_ADDRESS.to_string(), address.clone());
                flow.entries()
                    .update(&entry.entry_id, ConfigEntryUpdate::new().data(data))
                    .await?;
                flow.entries().schedule_reload(&entry.entry_id);
            }
        }

        self.device = Some(device);
        if configured && !allow_exist {
            return Err(AppleTvError::DeviceAlreadyConfigured);
        }
        Ok(())
    }

    /// [`Self::find_device`] with failures turned into aborts
    async fn find_device_or_abort(&mut self, flow: &FlowHandle, allow_exist: bool) -> AppleTvResult<()> {
        match self.find_device(flow, allow_exist).await {
            Ok(()) => Ok(()),
            Err(AppleTvError::DeviceNotFound) => Err(FlowErrorReason::NoDevicesFound.into()),
            Err(AppleTvError::DeviceAlreadyConfigured) => {
                Err(FlowErrorReason::AlreadyConfigured.into())
            }
            Err(err) => Err(err),
        }
    }

    async fn start_pairing(&mut self, flow: &FlowHandle) -> AppleTvResult<FlowResult> {
        if let Some(mut previous) = self.pairing.take() {
            previous.close().await;
        }
        let device = self.device()?.clone();
        let transition = self
            .pairing
            .insert(PairingSequencer::new(self.sdk.clone(), device))
            .advance(PairingInput::Start)
            .await;
        self.handle_transition(flow, transition).await
    }

    async fn step_pairing(
        &mut self,
        flow: &FlowHandle,
        user_input: Option<Value>,
    ) -> AppleTvResult<FlowResult> {
        let Some(pairing) = self.pairing.as_mut() else {
            return Err(AppleTvError::Unexpected("pairing has not started".to_string()));
        };

        let transition = match (pairing.state(), user_input) {
            (_, None) => Transition::Prompt { error: None },
            (PairingState::AwaitingUserPin(_), Some(input)) => {
                match serde_json::from_value::<PinInput>(input) {
                    Ok(input) => pairing.advance(PairingInput::Pin(input.pin)).await,
                    Err(err) => {
                        debug!("Invalid PIN input: {}", err);
                        Transition::Prompt {
                            error: Some(FlowErrorReason::InvalidAuth),
                        }
                    }
                }
            }
            (_, Some(_)) => pairing.advance(PairingInput::Acknowledge).await,
        };
        self.handle_transition(flow, transition).await
    }

    async fn handle_transition(
        &mut self,
        flow: &FlowHandle,
        transition: Transition,
    ) -> AppleTvResult<FlowResult> {
        let Some(pairing) = self.pairing.as_ref() else {
            return Err(AppleTvError::Unexpected("pairing has not started".to_string()));
        };

        match transition {
            Transition::Prompt { error } => {
                let form = pairing_form(pairing.state(), error)?;
                self.show(Step::Pairing, form)
            }
            Transition::Abort(reason) => Err(reason.into()),
            Transition::Done => {
                let resolution = resolve(
                    flow.entries(),
                    pairing.device(),
                    pairing.credentials(),
                    flow.source(),
                )
                .await?;
                match resolution {
                    Resolution::Created(entry) => Ok(FlowResult::create_entry(&entry)),
                    Resolution::Updated { reason, .. } | Resolution::Aborted(reason) => {
                        Err(reason.into())
                    }
                }
            }
        }
    }

    /// Catch-all at the step boundary: aborts pass through, anything else is
    /// logged and reported as `unknown`
    fn finish(result: AppleTvResult<FlowResult>) -> Result<FlowResult, AbortFlow> {
        match result {
            Ok(result) => Ok(result),
            Err(AppleTvError::Abort(abort)) => Err(abort),
            Err(err) => {
                error!("Unexpected exception: {}", err);
                Err(FlowErrorReason::Unknown.into())
            }
        }
    }
}

fn pairing_form(state: PairingState, error: Option<FlowErrorReason>) -> AppleTvResult<FlowResult> {
    let (Some(step_id), Some(protocol)) = (state.step_id(), state.protocol()) else {
        return Err(AppleTvError::Unexpected(format!(
            "no form for pairing state {:?}",
            state
        )));
    };

    let mut form = FlowResult::form(step_id).with_placeholder("protocol", protocol.display_name());
    match state {
        PairingState::AwaitingUserPin(_) => {
            form = form.with_schema(vec![FormField::required(CONF_PIN, "integer")]);
        }
        PairingState::AwaitingDevicePin { pin, .. } => {
            form = form.with_placeholder("pin", pin.to_string());
        }
        _ => {}
    }
    if let Some(error) = error {
        form = form.with_errors(HashMap::from([(
            "base".to_string(),
            error.as_str().to_string(),
        )]));
    }
    Ok(form)
}

#[async_trait]
impl FlowHandler for AppleTvConfigFlow {
    async fn async_init(
        &mut self,
        flow: &FlowHandle,
        data: Option<Value>,
    ) -> Result<FlowResult, AbortFlow> {
        let result = match flow.source() {
            ConfigEntrySource::User => self.step_user(flow, data).await,
            ConfigEntrySource::Zeroconf => match data.map(serde_json::from_value::<ZeroconfServiceInfo>) {
                Some(Ok(info)) => self.step_zeroconf(flow, info).await,
                Some(Err(err)) => Err(err.into()),
                None => Err(AppleTvError::Unexpected("missing discovery info".to_string())),
            },
            ConfigEntrySource::Reauth => self.step_reauth(flow, data).await,
            ConfigEntrySource::Reconfigure => self.step_reconfigure(flow, None).await,
            source => Err(AppleTvError::Unexpected(format!(
                "unsupported flow source {:?}",
                source
            ))),
        };
        Self::finish(result)
    }

    async fn async_configure(
        &mut self,
        flow: &FlowHandle,
        user_input: Option<Value>,
    ) -> Result<FlowResult, AbortFlow> {
        let result = match self.step {
            Some(Step::User) => self.step_user(flow, user_input).await,
            Some(Step::Confirm) => self.step_confirm(flow, user_input).await,
            Some(Step::Reconfigure) => self.step_reconfigure(flow, user_input).await,
            Some(Step::Pairing) => self.step_pairing(flow, user_input).await,
            None => Err(AppleTvError::Unexpected("no step is active".to_string())),
        };
        Self::finish(result)
    }

    async fn async_remove(&mut self) {
        if let Some(pairing) = self.pairing.as_mut() {
            pairing.close().await;
        }
    }
}
