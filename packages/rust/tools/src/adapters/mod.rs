//! Tool adapter trait and registry.
//!
//! Adapters wrap one external extraction tool. They are looked up by name,
//! so any tool declared in configuration can be plugged in without code
//! changes.

mod process;
mod scripted;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zoneflow_shared::{EngineConfig, Result, ToolOutput, Zone};

pub use process::ProcessAdapter;
pub use scripted::{ScriptedAdapter, ScriptedResponse};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One external extraction tool.
///
/// Implementations must give up promptly when `cancel` fires and should not
/// run past `timeout`; the worker enforces both anyway and discards late
/// results.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Registry key; matches `[[tools]].name`.
    fn name(&self) -> &str;

    /// Extract one zone.
    ///
    /// Errors should be [`ZoneflowError::ToolTimeout`](zoneflow_shared::ZoneflowError::ToolTimeout)
    /// or [`ZoneflowError::ToolExecution`](zoneflow_shared::ZoneflowError::ToolExecution).
    async fn execute(
        &self,
        zone: &Zone,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ToolOutput>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Adapters keyed by tool name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`ProcessAdapter`] for every configured tool with a `command`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for tool in &config.tools {
            match &tool.command {
                Some(command) => {
                    registry.register(Arc::new(ProcessAdapter::new(&tool.name, command)?));
                }
                None => debug!(tool = %tool.name, "no command configured, adapter must be registered in code"),
            }
        }
        Ok(registry)
    }

    /// Add or replace an adapter. Returns the one it replaced.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) -> Option<Arc<dyn ToolAdapter>> {
        let name = adapter.name().to_string();
        let previous = self.adapters.insert(name.clone(), adapter);
        if previous.is_some() {
            warn!(tool = %name, "replaced existing tool adapter");
        }
        previous
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new()
            .with(Arc::new(ScriptedAdapter::new("paddle")))
            .with(Arc::new(ScriptedAdapter::new("tesseract")));
        assert_eq!(registry.names(), ["paddle", "tesseract"]);
        assert!(registry.get("paddle").is_some());
        assert!(registry.get("layoutlm").is_none());
    }

    #[test]
    fn register_replaces_by_name() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(ScriptedAdapter::new("a"))).is_none());
        assert!(registry.register(Arc::new(ScriptedAdapter::new("a"))).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn from_config_builds_process_adapters() {
        let mut config = EngineConfig::default();
        config.tools[0].command = Some(vec!["python3".into(), "adapter.py".into()]);
        let registry = ToolRegistry::from_config(&config).expect("registry");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&config.tools[0].name));
    }

    #[test]
    fn from_config_rejects_empty_command() {
        let mut config = EngineConfig::default();
        config.tools[0].command = Some(vec![]);
        assert!(ToolRegistry::from_config(&config).is_err());
    }
}
