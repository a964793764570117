//! Options flow for Apple TV entries

use async_trait::async_trait;
use ha_config_entries::{AbortFlow, ConfigEntryUpdate, FlowHandle, FlowHandler, FlowResult, FormField};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::constants::CONF_START_OFF;
use crate::errors::FlowErrorReason;
use crate::settings::AppleTvSettings;

#[derive(Debug, Deserialize)]
struct OptionsInput {
    start_off: Option<bool>,
}

/// Edits the options of the entry named by the flow context's `entry_id`
pub struct AppleTvOptionsFlow {
    settings: AppleTvSettings,
}

impl AppleTvOptionsFlow {
    pub fn new(settings: AppleTvSettings) -> Self {
        Self { settings }
    }

    async fn step_init(
        &mut self,
        flow: &FlowHandle,
        user_input: Option<Value>,
    ) -> Result<FlowResult, AbortFlow> {
        let entry = flow
            .context()
            .entry_id
            .and_then(|entry_id| flow.entries().get(&entry_id))
            .ok_or_else(|| AbortFlow::new("unknown_entry"))?;

        let current = entry
            .options
            .get(CONF_START_OFF)
            .and_then(Value::as_bool)
            .unwrap_or(self.settings.default_start_off);

        let Some(input) = user_input else {
            return Ok(FlowResult::form("init").with_schema(vec![FormField::optional(
                CONF_START_OFF,
                "boolean",
                json!(current),
            )]));
        };

        let input: OptionsInput = serde_json::from_value(input).map_err(|err| {
            debug!("Invalid options input: {}", err);
            AbortFlow::from(FlowErrorReason::Unknown)
        })?;

        let mut options = entry.options.clone();
        options.insert(
            CONF_START_OFF.to_string(),
            json!(input.start_off.unwrap_or(current)),
        );

        if let Err(err) = flow
            .entries()
            .update(&entry.entry_id, ConfigEntryUpdate::new().options(options.clone()))
            .await
        {
            error!("Failed to store options for {}: {}", entry.entry_id, err);
            return Err(FlowErrorReason::Unknown.into());
        }

        Ok(FlowResult::create_entry_data("", json!(options)))
    }
}

#[async_trait]
impl FlowHandler for AppleTvOptionsFlow {
    /// Always opens on the form; init data is not user input
    async fn async_init(
        &mut self,
        flow: &FlowHandle,
        _data: Option<Value>,
    ) -> Result<FlowResult, AbortFlow> {
        self.step_init(flow, None).await
    }

    async fn async_configure(
        &mut self,
        flow: &FlowHandle,
        user_input: Option<Value>,
    ) -> Result<FlowResult, AbortFlow> {
        self.step_init(flow, user_input).await
    }
}
