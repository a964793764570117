//! Config Entry types
//!
//! A ConfigEntry is one configured instance of an integration, usually one
//! physical device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Initial state, not yet set up
    #[default]
    NotLoaded,
    /// Currently being set up
    SetupInProgress,
    /// Successfully set up
    Loaded,
    /// Setup failed
    SetupError,
    /// Waiting to retry setup
    SetupRetry,
    /// Currently unloading
    UnloadInProgress,
    /// Unload failed, entry is stuck until restart
    FailedUnload,
}

/// Where a config entry (or the flow creating it) came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Configured by the user through the UI
    #[default]
    User,
    /// Imported from YAML config
    Import,
    /// Generic discovery
    Discovery,
    /// mDNS/Bonjour discovery
    Zeroconf,
    /// User hiding a discovery
    Ignore,
    /// Re-authentication of an existing entry
    Reauth,
    /// User reconfiguring an existing entry
    Reconfigure,
}

impl ConfigEntrySource {
    /// Sources that originate from network discovery rather than a person
    pub fn is_discovery(&self) -> bool {
        matches!(self, Self::Discovery | Self::Zeroconf)
    }

    /// Sources that rework an entry that already exists
    pub fn is_existing_entry(&self) -> bool {
        matches!(self, Self::Reauth | Self::Reconfigure)
    }
}

/// Reason an entry was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

/// A configuration entry for an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain (e.g., "apple_tv")
    pub domain: String,

    /// Human-readable display name
    pub title: String,

    /// Configuration data written by the config flow
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// User-configurable options
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Identifier used to prevent duplicate entries per domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Origin type
    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Current lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Human-readable explanation for failed states (not persisted)
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// What disabled this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    /// Create a new config entry
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// True when every `(key, value)` pair is present in either data or options
    pub fn matches_all(&self, pairs: &HashMap<String, serde_json::Value>) -> bool {
        pairs.iter().all(|(key, value)| {
            self.data.get(key) == Some(value) || self.options.get(key) == Some(value)
        })
    }

    /// Move to a new lifecycle state, validating the transition
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.try_transition(new_state)?;
        self.reason = reason;
        Ok(())
    }
}

/// Partial update for a config entry; `None` fields are left untouched
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<HashMap<String, serde_json::Value>>,
    pub options: Option<HashMap<String, serde_json::Value>>,
    pub unique_id: Option<Option<String>>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn unique_id(mut self, unique_id: Option<String>) -> Self {
        self.unique_id = Some(unique_id);
        self
    }

    /// Apply to `entry`, returning whether anything changed
    pub(crate) fn apply(self, entry: &mut ConfigEntry) -> bool {
        let mut changed = false;
        if let Some(title) = self.title {
            changed |= entry.title != title;
            entry.title = title;
        }
        if let Some(data) = self.data {
            changed |= entry.data != data;
            entry.data = data;
        }
        if let Some(options) = self.options {
            changed |= entry.options != options;
            entry.options = options;
        }
        if let Some(unique_id) = self.unique_id {
            changed |= entry.unique_id != unique_id;
            entry.unique_id = unique_id;
        }
        if changed {
            entry.modified_at = Utc::now();
        }
        changed
    }
}
