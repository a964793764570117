//! Data entry flow types
//!
//! A flow is one run of an integration's setup wizard. Each step returns a
//! [`FlowResult`]: a form to show, a finished entry, or an abort with a
//! machine-readable reason that the frontend translates.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::entry::{ConfigEntry, ConfigEntrySource};

/// Kind of step result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// Form field schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl FormField {
    pub fn required(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: Some(true),
            default: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        field_type: impl Into<String>,
        default: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: Some(false),
            default: Some(default),
        }
    }
}

/// Result of a flow step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowResult {
    /// Flow ID, filled in by the flow manager
    pub flow_id: String,
    /// Handler (integration domain), filled in by the flow manager
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    /// Current step ID (for form type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Data schema for the form, empty if the form has no inputs
    pub data_schema: Vec<FormField>,
    /// Errors from the previous submission
    pub errors: Option<HashMap<String, String>>,
    /// Values substituted into the translated step description
    pub description_placeholders: Option<HashMap<String, String>>,
    /// Title (for create_entry type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Abort reason (for abort type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Entry data or options (for create_entry type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Persisted entry (for create_entry type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
}

impl FlowResult {
    fn empty(result_type: FlowResultType) -> Self {
        Self {
            flow_id: String::new(),
            handler: String::new(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: None,
            description_placeholders: None,
            title: None,
            reason: None,
            data: None,
            entry_id: None,
        }
    }

    /// Show a form for `step_id`
    pub fn form(step_id: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..Self::empty(FlowResultType::Form)
        }
    }

    /// Finish the flow with an entry that has already been persisted
    pub fn create_entry(entry: &ConfigEntry) -> Self {
        Self {
            title: Some(entry.title.clone()),
            data: serde_json::to_value(&entry.data).ok(),
            entry_id: Some(entry.entry_id.clone()),
            ..Self::empty(FlowResultType::CreateEntry)
        }
    }

    /// Finish the flow with plain data (options flows)
    pub fn create_entry_data(title: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            title: Some(title.into()),
            data: Some(data),
            ..Self::empty(FlowResultType::CreateEntry)
        }
    }

    /// Finish the flow without creating anything
    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::empty(FlowResultType::Abort)
        }
    }

    pub fn with_schema(mut self, fields: Vec<FormField>) -> Self {
        self.data_schema = fields;
        self
    }

    /// Attach form errors; an empty map is normalised to `None`
    pub fn with_errors(mut self, errors: HashMap<String, String>) -> Self {
        self.errors = (!errors.is_empty()).then_some(errors);
        self
    }

    pub fn with_placeholder(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.description_placeholders
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// True for results that end the flow
    pub fn is_finished(&self) -> bool {
        self.result_type != FlowResultType::Form
    }
}

/// Abort raised from anywhere inside a step
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("flow aborted: {reason}")]
pub struct AbortFlow {
    pub reason: String,
}

impl AbortFlow {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<AbortFlow> for FlowResult {
    fn from(abort: AbortFlow) -> Self {
        FlowResult::abort(abort.reason)
    }
}

/// Shared per-flow context.
///
/// Lives in the in-progress registry so that other flows of the same handler
/// can inspect it, and occasionally write to it, while this flow is suspended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub source: ConfigEntrySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// Entry being reworked (reauth/reconfigure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    /// Address published by a discovery flow once its aggregation window closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Every identifier seen for the device, including ones merged in by
    /// sibling discovery flows
    #[serde(default)]
    pub all_identifiers: IndexSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub title_placeholders: HashMap<String, String>,
}

impl FlowContext {
    pub fn new(source: ConfigEntrySource) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_form_serialization() {
        let result = FlowResult::form("confirm")
            .with_placeholder("name", "Kitchen")
            .with_errors(HashMap::new());
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["type"], "form");
        assert_eq!(value["step_id"], "confirm");
        assert_eq!(value["errors"], serde_json::Value::Null);
        assert_eq!(value["description_placeholders"]["name"], "Kitchen");
        assert!(!result.is_finished());
    }

    #[test]
    fn test_abort_from_error() {
        let result: FlowResult = AbortFlow::new("already_in_progress").into();
        assert_eq!(result.result_type, FlowResultType::Abort);
        assert_eq!(result.reason.as_deref(), Some("already_in_progress"));
        assert!(result.is_finished());
    }

    #[test]
    fn test_create_entry_carries_entry() {
        let entry = ConfigEntry::new("apple_tv", "Den")
            .with_data(HashMap::from([("address".to_string(), json!("10.0.0.9"))]));
        let result = FlowResult::create_entry(&entry);

        assert_eq!(result.result_type, FlowResultType::CreateEntry);
        assert_eq!(result.entry_id.as_deref(), Some(entry.entry_id.as_str()));
        assert_eq!(result.data, Some(json!({"address": "10.0.0.9"})));
    }
}
