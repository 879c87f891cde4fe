//! Plugin registry and event bus.
//!
//! Extensions declare the lifecycle hooks they implement via a capability
//! set; dispatch only ever invokes declared hooks. Broadcast dispatch
//! isolates each extension's failures (including timeouts and panics) so
//! one misbehaving extension cannot break the others or the engine;
//! pipeline dispatch threads a JSON value through each extension in
//! priority order.

use crate::item::TransferItem;
use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default time box for a single hook invocation.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle hooks an extension may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    FileAdded,
    Validation,
    UploadStart,
    UploadProgress,
    UploadComplete,
    UploadError,
    QueuePreProcess,
    QueuePostProcess,
    StatusChange,
    ManagerStateChange,
    /// Receives this extension's own dispatch failures.
    PluginError,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::FileAdded => "file-added",
            HookKind::Validation => "validation",
            HookKind::UploadStart => "upload-start",
            HookKind::UploadProgress => "upload-progress",
            HookKind::UploadComplete => "upload-complete",
            HookKind::UploadError => "upload-error",
            HookKind::QueuePreProcess => "queue-pre-process",
            HookKind::QueuePostProcess => "queue-post-process",
            HookKind::StatusChange => "status-change",
            HookKind::ManagerStateChange => "manager-state-change",
            HookKind::PluginError => "plugin-error",
        }
    }
}

/// One dispatched event.
#[derive(Debug, Clone)]
pub struct PluginEvent {
    pub kind: HookKind,
    pub item: Option<TransferItem>,
    pub detail: Value,
}

impl PluginEvent {
    pub fn new(kind: HookKind) -> Self {
        Self {
            kind,
            item: None,
            detail: Value::Null,
        }
    }

    pub fn with_item(kind: HookKind, item: TransferItem) -> Self {
        Self {
            kind,
            item: Some(item),
            detail: Value::Null,
        }
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// An extension observing or modifying engine behavior.
///
/// Hooks are synchronous and expected to be fast; the bus runs each one on
/// a blocking thread under a time box. Only hooks listed in
/// `capabilities()` are ever invoked.
pub trait UploadPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    fn capabilities(&self) -> &[HookKind];

    /// Broadcast hook. The same entry point serves every declared kind.
    fn handle(&self, event: &PluginEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    /// Pipeline hook: transform and return the value for the next stage.
    fn transform(&self, stage: HookKind, value: Value) -> Result<Value> {
        let _ = stage;
        Ok(value)
    }

    /// Called once on unregistration.
    fn teardown(&self) {}
}

/// Registration-time settings for one extension.
#[derive(Debug, Clone)]
pub struct PluginOptions {
    /// Higher runs first.
    pub priority: i32,
    pub enabled: bool,
    pub options: Value,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            enabled: true,
            options: Value::Null,
        }
    }
}

/// Registry view of one extension.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub priority: i32,
    pub enabled: bool,
    pub capabilities: Vec<HookKind>,
    /// The opaque options value supplied at registration.
    pub options: Value,
}

struct Entry {
    plugin: Arc<dyn UploadPlugin>,
    priority: i32,
    enabled: bool,
    options: Value,
}

/// The event bus: named extensions, prioritized broadcast and pipeline
/// dispatch, per-call timeout isolation.
pub struct PluginBus {
    entries: Mutex<Vec<Entry>>,
    hook_timeout: Duration,
}

impl Default for PluginBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginBus {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    pub fn with_timeout(hook_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            hook_timeout,
        }
    }

    /// Register an extension. Fails if the name is already taken.
    pub fn register(&self, plugin: Arc<dyn UploadPlugin>, opts: PluginOptions) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.plugin.name() == plugin.name()) {
            bail!("plugin {:?} is already registered", plugin.name());
        }
        tracing::debug!(name = plugin.name(), priority = opts.priority, "plugin registered");
        entries.push(Entry {
            plugin,
            priority: opts.priority,
            enabled: opts.enabled,
            options: opts.options,
        });
        Ok(())
    }

    /// Unregister an extension, invoking its teardown hook first.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let index = entries.iter().position(|e| e.plugin.name() == name);
            index.map(|i| entries.remove(i))
        };
        match removed {
            Some(entry) => {
                let plugin = Arc::clone(&entry.plugin);
                let result = tokio::time::timeout(
                    self.hook_timeout,
                    tokio::task::spawn_blocking(move || plugin.teardown()),
                )
                .await;
                if result.is_err() {
                    tracing::warn!(name, "plugin teardown timed out");
                }
                true
            }
            None => false,
        }
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.plugin.name() == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| PluginInfo {
                name: e.plugin.name().to_string(),
                version: e.plugin.version().to_string(),
                priority: e.priority,
                enabled: e.enabled,
                capabilities: e.plugin.capabilities().to_vec(),
                options: e.options.clone(),
            })
            .collect()
    }

    /// Enabled extensions declaring `kind`, highest priority first.
    /// Stable for equal priorities (registration order).
    fn subscribers(&self, kind: HookKind) -> Vec<(Arc<dyn UploadPlugin>, i32)> {
        let entries = self.entries.lock().unwrap();
        let mut subs: Vec<_> = entries
            .iter()
            .filter(|e| e.enabled && e.plugin.capabilities().contains(&kind))
            .map(|e| (Arc::clone(&e.plugin), e.priority))
            .collect();
        subs.sort_by_key(|(_, priority)| std::cmp::Reverse(*priority));
        subs
    }

    async fn timed_handle(
        &self,
        plugin: Arc<dyn UploadPlugin>,
        event: PluginEvent,
    ) -> Result<()> {
        let joined = tokio::time::timeout(
            self.hook_timeout,
            tokio::task::spawn_blocking(move || plugin.handle(&event)),
        )
        .await;
        match joined {
            Err(_) => bail!("hook timed out after {:?}", self.hook_timeout),
            Ok(Err(join_err)) => bail!("hook panicked: {}", join_err),
            Ok(Ok(result)) => result,
        }
    }

    /// Broadcast `event` to every enabled extension declaring its kind.
    ///
    /// Failures (Err, panic, timeout) are logged and routed to the failing
    /// extension's own `PluginError` hook if declared; dispatch continues.
    pub async fn emit(&self, event: PluginEvent) {
        for (plugin, _) in self.subscribers(event.kind) {
            let name = plugin.name().to_string();
            if let Err(e) = self.timed_handle(Arc::clone(&plugin), event.clone()).await {
                tracing::warn!(plugin = %name, hook = event.kind.as_str(), "plugin hook failed: {}", e);
                if event.kind != HookKind::PluginError
                    && plugin.capabilities().contains(&HookKind::PluginError)
                {
                    let error_event = PluginEvent::new(HookKind::PluginError).detail(json!({
                        "plugin": name,
                        "hook": event.kind.as_str(),
                        "error": e.to_string(),
                    }));
                    if let Err(e2) = self.timed_handle(plugin, error_event).await {
                        tracing::warn!(plugin = %name, "plugin error hook failed: {}", e2);
                    }
                }
            }
        }
    }

    /// Thread `value` through every enabled extension declaring `stage`,
    /// highest priority first. A failing or timed-out stage leaves the
    /// value unchanged and dispatch continues.
    pub async fn pipeline(&self, stage: HookKind, mut value: Value) -> Value {
        for (plugin, _) in self.subscribers(stage) {
            let name = plugin.name().to_string();
            let input = value.clone();
            let joined = tokio::time::timeout(
                self.hook_timeout,
                tokio::task::spawn_blocking(move || plugin.transform(stage, input)),
            )
            .await;
            match joined {
                Ok(Ok(Ok(next))) => value = next,
                Ok(Ok(Err(e))) => {
                    tracing::warn!(plugin = %name, stage = stage.as_str(), "pipeline stage failed: {}", e);
                }
                Ok(Err(join_err)) => {
                    tracing::warn!(plugin = %name, "pipeline stage panicked: {}", join_err);
                }
                Err(_) => {
                    tracing::warn!(plugin = %name, "pipeline stage timed out");
                }
            }
        }
        value
    }
}
