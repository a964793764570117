//! Error types for the Apple TV config flow

use std::fmt;

use ha_config_entries::{AbortFlow, ConfigEntriesError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scanner::ProbeError;
use crate::sdk::SdkError;

/// Machine-readable reasons carried by aborts and form errors.
///
/// The strings are translated by the frontend and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowErrorReason {
    CannotConnect,
    InvalidAuth,
    AlreadyConfigured,
    AlreadyInProgress,
    NoDevicesFound,
    DeviceNotFound,
    InconsistentDevice,
    SetupFailed,
    Unknown,
    Backoff,
    DeviceDidNotPair,
    ReauthSuccessful,
}

impl FlowErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CannotConnect => "cannot_connect",
            Self::InvalidAuth => "invalid_auth",
            Self::AlreadyConfigured => "already_configured",
            Self::AlreadyInProgress => "already_in_progress",
            Self::NoDevicesFound => "no_devices_found",
            Self::DeviceNotFound => "device_not_found",
            Self::InconsistentDevice => "inconsistent_device",
            Self::SetupFailed => "setup_failed",
            Self::Unknown => "unknown",
            Self::Backoff => "backoff",
            Self::DeviceDidNotPair => "device_did_not_pair",
            Self::ReauthSuccessful => "reauth_successful",
        }
    }
}

impl fmt::Display for FlowErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FlowErrorReason> for AbortFlow {
    fn from(reason: FlowErrorReason) -> Self {
        AbortFlow::new(reason.as_str())
    }
}

/// Errors raised inside a config flow step
#[derive(Debug, Error)]
pub enum AppleTvError {
    #[error(transparent)]
    Abort(#[from] AbortFlow),

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Device already configured")]
    DeviceAlreadyConfigured,

    #[error("Invalid user input: {0}")]
    InvalidInput(#[from] serde_json::Error),

    #[error("Config entry error: {0}")]
    Entries(#[from] ConfigEntriesError),

    #[error("SDK error: {0}")]
    Sdk(#[from] SdkError),

    #[error("{0}")]
    Unexpected(String),
}

impl From<ProbeError> for AppleTvError {
    fn from(_: ProbeError) -> Self {
        AppleTvError::DeviceNotFound
    }
}

impl From<FlowErrorReason> for AppleTvError {
    fn from(reason: FlowErrorReason) -> Self {
        AppleTvError::Abort(reason.into())
    }
}

pub type AppleTvResult<T> = Result<T, AppleTvError>;
