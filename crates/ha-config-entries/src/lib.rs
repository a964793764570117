//! Config Entries
//!
//! This crate provides the configuration entry system and the config flow
//! machinery. Config entries represent individual integration instances and
//! manage their lifecycle (setup, unload, reload); config flows are the
//! step-by-step wizards that create and rework them.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`FlowManager`] - Runs config flows and tracks the ones in progress
//! - [`FlowHandler`] - Implemented by each integration's config flow
//!
//! # Storage
//!
//! Config entries are persisted in `.storage/core.config_entries` with
//! version tracking for migrations.

pub mod entry;
pub mod flow;
pub mod flow_manager;
pub mod manager;
pub mod state_machine;
pub mod storage;

// Re-export main types
pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};

pub use flow::{AbortFlow, FlowContext, FlowResult, FlowResultType, FormField};

pub use flow_manager::{
    FlowError, FlowHandle, FlowHandler, FlowHandlerFactory, FlowManager, FlowManagerResult,
    FlowProgress, FlowRegistry, ABORT_ALREADY_CONFIGURED, ABORT_ALREADY_IN_PROGRESS,
};

pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, SetupHandler,
    STORAGE_KEY, STORAGE_MINOR_VERSION, STORAGE_VERSION,
};

pub use state_machine::InvalidTransition;

pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
