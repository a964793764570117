//! Config Flow Manager
//!
//! Runs config flows for native integrations and keeps the registry of
//! flows in progress. Integrations implement [`FlowHandler`]; the manager
//! owns flow ids, routes user input to the right flow instance and removes
//! flows once a step finishes them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::entry::{ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate};
use crate::flow::{AbortFlow, FlowContext, FlowResult};
use crate::manager::ConfigEntries;

/// Abort reason when another flow already handles the same device
pub const ABORT_ALREADY_IN_PROGRESS: &str = "already_in_progress";
/// Abort reason when an entry for the device already exists
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";

/// Flow manager errors
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Unknown flow handler: {0}")]
    UnknownHandler(String),

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),
}

pub type FlowManagerResult<T> = Result<T, FlowError>;

/// Snapshot of one flow in progress
#[derive(Debug, Clone, PartialEq)]
pub struct FlowProgress {
    pub flow_id: String,
    /// Integration domain
    pub handler: String,
    pub context: FlowContext,
    /// Step of the last form shown
    pub step_id: Option<String>,
    /// False until the first step has returned
    pub initialized: bool,
}

impl FlowProgress {
    pub fn new(flow_id: impl Into<String>, handler: impl Into<String>, context: FlowContext) -> Self {
        Self {
            flow_id: flow_id.into(),
            handler: handler.into(),
            context,
            step_id: None,
            initialized: false,
        }
    }
}

/// Registry of flows in progress, shared by every flow handle
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, FlowProgress>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, FlowProgress>> {
        self.flows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, FlowProgress>> {
        self.flows.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, progress: FlowProgress) {
        self.write().insert(progress.flow_id.clone(), progress);
    }

    pub fn remove(&self, flow_id: &str) -> Option<FlowProgress> {
        self.write().remove(flow_id)
    }

    pub fn get(&self, flow_id: &str) -> Option<FlowProgress> {
        self.read().get(flow_id).cloned()
    }

    fn mark_step(&self, flow_id: &str, step_id: Option<String>) {
        if let Some(progress) = self.write().get_mut(flow_id) {
            progress.step_id = step_id;
            progress.initialized = true;
        }
    }

    /// Run `f` with exclusive access to the whole table.
    ///
    /// `f` must not block. Check-then-publish sequences done inside one call
    /// cannot interleave with another flow's.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut HashMap<String, FlowProgress>) -> R) -> R {
        f(&mut self.write())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// A flow's view of the host: its own context, the shared registry and the entries
/// of its domain
#[derive(Clone)]
pub struct FlowHandle {
    flow_id: String,
    handler: String,
    registry: Arc<FlowRegistry>,
    entries: Arc<ConfigEntries>,
}

impl FlowHandle {
    pub fn new(
        flow_id: impl Into<String>,
        handler: impl Into<String>,
        registry: Arc<FlowRegistry>,
        entries: Arc<ConfigEntries>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            handler: handler.into(),
            registry,
            entries,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn entries(&self) -> &Arc<ConfigEntries> {
        &self.entries
    }

    /// Current context; empty once the flow has been removed
    pub fn context(&self) -> FlowContext {
        self.registry
            .get(&self.flow_id)
            .map(|p| p.context)
            .unwrap_or_default()
    }

    pub fn source(&self) -> ConfigEntrySource {
        self.context().source
    }

    pub fn unique_id(&self) -> Option<String> {
        self.context().unique_id
    }

    pub fn update_context(&self, f: impl FnOnce(&mut FlowContext)) {
        self.registry.transaction(|flows| {
            if let Some(progress) = flows.get_mut(&self.flow_id) {
                f(&mut progress.context);
            }
        });
    }

    /// Entries of this domain, ignored ones included
    pub fn current_entries(&self) -> Vec<ConfigEntry> {
        self.entries.get_by_domain(&self.handler)
    }

    /// Abort if a non-ignored entry of this domain has all `pairs` in its
    /// data or options
    pub fn abort_entries_match(
        &self,
        pairs: &HashMap<String, serde_json::Value>,
    ) -> Result<(), AbortFlow> {
        let matched = self
            .current_entries()
            .iter()
            .filter(|e| e.source != ConfigEntrySource::Ignore)
            .any(|e| e.matches_all(pairs));
        if matched {
            return Err(AbortFlow::new(ABORT_ALREADY_CONFIGURED));
        }
        Ok(())
    }

    /// Set the flow's unique id.
    ///
    /// With `raise_on_progress`, aborts when another flow of this handler
    /// already holds the same id. Returns the entry already using the id.
    pub fn set_unique_id(
        &self,
        unique_id: Option<&str>,
        raise_on_progress: bool,
    ) -> Result<Option<ConfigEntry>, AbortFlow> {
        let Some(unique_id) = unique_id else {
            self.update_context(|c| c.unique_id = None);
            return Ok(None);
        };

        self.registry.transaction(|flows| {
            if raise_on_progress
                && flows.values().any(|p| {
                    p.flow_id != self.flow_id
                        && p.handler == self.handler
                        && p.context.unique_id.as_deref() == Some(unique_id)
                })
            {
                return Err(AbortFlow::new(ABORT_ALREADY_IN_PROGRESS));
            }
            if let Some(progress) = flows.get_mut(&self.flow_id) {
                progress.context.unique_id = Some(unique_id.to_string());
            }
            Ok(())
        })?;

        Ok(self.entries.get_by_unique_id(&self.handler, unique_id))
    }

    /// Abort if an entry already uses this flow's unique id.
    ///
    /// `updates` are merged into that entry's data first; a loaded entry whose
    /// data changed is reloaded in the background.
    pub async fn abort_if_unique_id_configured(
        &self,
        updates: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<(), AbortFlow> {
        let context = self.context();
        let Some(unique_id) = context.unique_id else {
            return Ok(());
        };
        let Some(entry) = self.entries.get_by_unique_id(&self.handler, &unique_id) else {
            return Ok(());
        };

        let mut should_reload = false;
        if let Some(updates) = updates {
            let mut data = entry.data.clone();
            data.extend(updates);
            match self
                .entries
                .update(&entry.entry_id, ConfigEntryUpdate::new().data(data))
                .await
            {
                Ok((_, changed)) => {
                    should_reload = changed
                        && matches!(
                            entry.state,
                            ConfigEntryState::Loaded | ConfigEntryState::SetupRetry
                        );
                }
                Err(err) => warn!("Failed to update entry {}: {}", entry.entry_id, err),
            }
        } else if context.source.is_discovery() && entry.state == ConfigEntryState::SetupRetry {
            // A retrying entry was just seen on the network
            should_reload = true;
        }

        if entry.source == ConfigEntrySource::Ignore && context.source == ConfigEntrySource::User
        {
            return Ok(());
        }
        if should_reload {
            self.entries.schedule_reload(&entry.entry_id);
        }
        Err(AbortFlow::new(ABORT_ALREADY_CONFIGURED))
    }
}

/// A config flow implementation for one integration.
///
/// The handler tracks its own current step; the manager only routes input.
#[async_trait]
pub trait FlowHandler: Send {
    /// First step. `data` is the source-specific payload (discovery info,
    /// reauth data, ...), `None` for a plain user flow.
    async fn async_init(
        &mut self,
        flow: &FlowHandle,
        data: Option<serde_json::Value>,
    ) -> Result<FlowResult, AbortFlow>;

    /// Continue with input submitted for the current form
    async fn async_configure(
        &mut self,
        flow: &FlowHandle,
        user_input: Option<serde_json::Value>,
    ) -> Result<FlowResult, AbortFlow>;

    /// Release resources; called once when the flow ends for any reason
    async fn async_remove(&mut self) {}
}

/// Creates a fresh handler for each new flow
pub type FlowHandlerFactory = Arc<dyn Fn() -> Box<dyn FlowHandler> + Send + Sync>;

#[derive(Clone)]
struct ActiveFlow {
    handle: FlowHandle,
    handler: Arc<Mutex<Box<dyn FlowHandler>>>,
}

/// Config flow manager
pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    registry: Arc<FlowRegistry>,
    factories: DashMap<String, FlowHandlerFactory>,
    flows: DashMap<String, ActiveFlow>,
}

impl FlowManager {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self {
            entries,
            registry: Arc::new(FlowRegistry::new()),
            factories: DashMap::new(),
            flows: DashMap::new(),
        }
    }

    pub fn entries(&self) -> &Arc<ConfigEntries> {
        &self.entries
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// Register the flow implementation for a domain
    pub fn register_handler(&self, domain: &str, factory: FlowHandlerFactory) {
        self.factories.insert(domain.to_string(), factory);
        debug!("Registered config flow for domain: {}", domain);
    }

    /// Start a new flow
    #[instrument(skip(self, context, data), fields(source = ?context.source))]
    pub async fn async_init(
        &self,
        handler: &str,
        context: FlowContext,
        data: Option<serde_json::Value>,
    ) -> FlowManagerResult<FlowResult> {
        let factory = self
            .factories
            .get(handler)
            .map(|r| r.value().clone())
            .ok_or_else(|| FlowError::UnknownHandler(handler.to_string()))?;

        let flow_id = Ulid::new().to_string();
        self.registry
            .insert(FlowProgress::new(&flow_id, handler, context));

        let flow = ActiveFlow {
            handle: FlowHandle::new(
                &flow_id,
                handler,
                self.registry.clone(),
                self.entries.clone(),
            ),
            handler: Arc::new(Mutex::new(factory())),
        };
        self.flows.insert(flow_id.clone(), flow.clone());
        debug!(flow_id = %flow_id, "Starting flow");

        let result = {
            let mut instance = flow.handler.lock().await;
            instance.async_init(&flow.handle, data).await
        };
        self.handle_result(&flow, result).await
    }

    /// Submit user input to a flow
    pub async fn async_configure(
        &self,
        flow_id: &str,
        user_input: Option<serde_json::Value>,
    ) -> FlowManagerResult<FlowResult> {
        let flow = self
            .flows
            .get(flow_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        let result = {
            let mut instance = flow.handler.lock().await;
            instance.async_configure(&flow.handle, user_input).await
        };
        self.handle_result(&flow, result).await
    }

    /// Abort a flow from the outside
    pub async fn async_abort(&self, flow_id: &str) -> FlowManagerResult<()> {
        let (_, flow) = self
            .flows
            .remove(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        self.registry.remove(flow_id);
        flow.handler.lock().await.async_remove().await;
        info!("Aborted flow {}", flow_id);
        Ok(())
    }

    /// Flows in progress across all handlers
    pub fn async_progress(&self, include_uninitialized: bool) -> Vec<FlowProgress> {
        self.registry.transaction(|flows| {
            flows
                .values()
                .filter(|p| include_uninitialized || p.initialized)
                .cloned()
                .collect()
        })
    }

    async fn handle_result(
        &self,
        flow: &ActiveFlow,
        result: Result<FlowResult, AbortFlow>,
    ) -> FlowManagerResult<FlowResult> {
        let flow_id = flow.handle.flow_id();
        let mut result = result.unwrap_or_else(FlowResult::from);
        result.flow_id = flow_id.to_string();
        result.handler = flow.handle.handler().to_string();

        if !self.flows.contains_key(flow_id) {
            // Aborted from the outside while the step was running
            return Err(FlowError::UnknownFlow(flow_id.to_string()));
        }

        if result.is_finished() {
            self.flows.remove(flow_id);
            self.registry.remove(flow_id);
            flow.handler.lock().await.async_remove().await;
            debug!(
                flow_id = %flow_id,
                result = ?result.result_type,
                reason = ?result.reason,
                "Flow finished"
            );
        } else {
            self.registry.mark_step(flow_id, result.step_id.clone());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowResultType;
    use crate::storage::Storage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Two-step flow: shows "user", aborts on {"abort": reason}, else finishes
    struct EchoFlow {
        removed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FlowHandler for EchoFlow {
        async fn async_init(
            &mut self,
            _flow: &FlowHandle,
            _data: Option<serde_json::Value>,
        ) -> Result<FlowResult, AbortFlow> {
            Ok(FlowResult::form("user"))
        }

        async fn async_configure(
            &mut self,
            _flow: &FlowHandle,
            user_input: Option<serde_json::Value>,
        ) -> Result<FlowResult, AbortFlow> {
            let input = user_input.unwrap_or_default();
            if let Some(reason) = input.get("abort").and_then(|v| v.as_str()) {
                return Err(AbortFlow::new(reason));
            }
            Ok(FlowResult::create_entry_data("Echo", input))
        }

        async fn async_remove(&mut self) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (TempDir, FlowManager, Arc<AtomicUsize>) {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(dir.path()))));
        let manager = FlowManager::new(entries);
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        manager.register_handler(
            "echo",
            Arc::new(move || {
                Box::new(EchoFlow {
                    removed: counter.clone(),
                }) as Box<dyn FlowHandler>
            }),
        );
        (dir, manager, removed)
    }

    #[tokio::test]
    async fn test_flow_runs_to_completion() {
        let (_dir, manager, removed) = setup();

        let form = manager
            .async_init("echo", FlowContext::default(), None)
            .await
            .unwrap();
        assert_eq!(form.step_id.as_deref(), Some("user"));
        assert_eq!(form.handler, "echo");
        assert_eq!(manager.async_progress(false).len(), 1);

        let done = manager
            .async_configure(&form.flow_id, Some(json!({"value": 1})))
            .await
            .unwrap();
        assert_eq!(done.result_type, FlowResultType::CreateEntry);
        assert_eq!(done.data, Some(json!({"value": 1})));
        assert!(manager.registry().is_empty());
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_error_becomes_abort_result() {
        let (_dir, manager, removed) = setup();
        let form = manager
            .async_init("echo", FlowContext::default(), None)
            .await
            .unwrap();

        let result = manager
            .async_configure(&form.flow_id, Some(json!({"abort": "cannot_connect"})))
            .await
            .unwrap();

        assert_eq!(result.result_type, FlowResultType::Abort);
        assert_eq!(result.reason.as_deref(), Some("cannot_connect"));
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.async_configure(&form.flow_id, None).await,
            Err(FlowError::UnknownFlow(_))
        ));
    }

    #[tokio::test]
    async fn test_external_abort_removes_flow() {
        let (_dir, manager, removed) = setup();
        let form = manager
            .async_init("echo", FlowContext::default(), None)
            .await
            .unwrap();

        manager.async_abort(&form.flow_id).await.unwrap();

        assert!(manager.async_progress(true).is_empty());
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let (_dir, manager, _) = setup();
        let result = manager
            .async_init("missing", FlowContext::default(), None)
            .await;
        assert!(matches!(result, Err(FlowError::UnknownHandler(_))));
    }

    fn handle(registry: &Arc<FlowRegistry>, entries: &Arc<ConfigEntries>, id: &str) -> FlowHandle {
        registry.insert(FlowProgress::new(
            id,
            "apple_tv",
            FlowContext::new(ConfigEntrySource::Zeroconf),
        ));
        FlowHandle::new(id, "apple_tv", registry.clone(), entries.clone())
    }

    #[tokio::test]
    async fn test_set_unique_id_raises_on_progress() {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(dir.path()))));
        let registry = Arc::new(FlowRegistry::new());
        let first = handle(&registry, &entries, "flow-1");
        let second = handle(&registry, &entries, "flow-2");

        assert!(first.set_unique_id(Some("dev"), true).unwrap().is_none());
        assert_eq!(
            second.set_unique_id(Some("dev"), true).unwrap_err(),
            AbortFlow::new(ABORT_ALREADY_IN_PROGRESS)
        );
        assert!(second.set_unique_id(Some("dev"), false).unwrap().is_none());
        assert_eq!(second.unique_id().as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn test_abort_if_unique_id_configured_updates_data() {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(dir.path()))));
        let entry = entries
            .add(
                ConfigEntry::new("apple_tv", "Den")
                    .with_unique_id("dev")
                    .with_data(HashMap::from([("address".to_string(), json!("10.0.0.1"))])),
            )
            .await
            .unwrap();
        let registry = Arc::new(FlowRegistry::new());
        let flow = handle(&registry, &entries, "flow-1");

        flow.set_unique_id(Some("dev"), true).unwrap();
        let result = flow
            .abort_if_unique_id_configured(Some(HashMap::from([(
                "address".to_string(),
                json!("10.0.0.2"),
            )])))
            .await;

        assert_eq!(result, Err(AbortFlow::new(ABORT_ALREADY_CONFIGURED)));
        assert_eq!(
            entries.get(&entry.entry_id).unwrap().data["address"],
            json!("10.0.0.2")
        );
    }

    #[tokio::test]
    async fn test_abort_entries_match() {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Arc::new(Storage::new(dir.path()))));
        entries
            .add(
                ConfigEntry::new("apple_tv", "Den")
                    .with_data(HashMap::from([("address".to_string(), json!("10.0.0.1"))])),
            )
            .await
            .unwrap();
        let registry = Arc::new(FlowRegistry::new());
        let flow = handle(&registry, &entries, "flow-1");

        let same = HashMap::from([("address".to_string(), json!("10.0.0.1"))]);
        let other = HashMap::from([("address".to_string(), json!("10.0.0.7"))]);
        assert!(flow.abort_entries_match(&same).is_err());
        assert!(flow.abort_entries_match(&other).is_ok());
    }
}
