//! Tool capability registry: (tool, content type) → accuracy, speed, complexity.

use std::collections::HashMap;

use zoneflow_shared::{ContentType, EngineConfig};

/// Memory estimate for a tool missing from the configuration.
const DEFAULT_MEMORY_MB: u64 = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCapability {
    pub tool: String,
    pub content_type: ContentType,
    /// Expected accuracy in [0,1].
    pub accuracy: f64,
    /// Expected seconds per zone.
    pub speed: f64,
    /// Complexity this tool is suited for, in [0,1].
    pub complexity: f64,
}

/// Immutable lookup table built once per engine.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    /// Per content type, ranked best-first.
    by_type: HashMap<ContentType, Vec<ToolCapability>>,
    memory: HashMap<String, u64>,
}

impl CapabilityRegistry {
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::default();
        for tool in &config.tools {
            registry.memory.insert(tool.name.clone(), tool.memory_mb);
            for cap in &tool.capabilities {
                registry.insert(ToolCapability {
                    tool: tool.name.clone(),
                    content_type: cap.content_type,
                    accuracy: cap.accuracy,
                    speed: cap.speed,
                    complexity: cap.complexity,
                });
            }
        }
        registry
    }

    /// Add an entry, keeping the per-type list ranked.
    pub fn insert(&mut self, capability: ToolCapability) {
        let list = self.by_type.entry(capability.content_type).or_default();
        list.retain(|c| c.tool != capability.tool);
        list.push(capability);
        list.sort_by(|a, b| {
            b.accuracy
                .total_cmp(&a.accuracy)
                .then(a.speed.total_cmp(&b.speed))
                .then_with(|| a.tool.cmp(&b.tool))
        });
    }

    /// Capabilities for a content type: accuracy descending, speed ascending.
    pub fn ranked(&self, content_type: ContentType) -> &[ToolCapability] {
        self.by_type
            .get(&content_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, tool: &str, content_type: ContentType) -> Option<&ToolCapability> {
        self.ranked(content_type).iter().find(|c| c.tool == tool)
    }

    pub fn supports(&self, content_type: ContentType) -> bool {
        !self.ranked(content_type).is_empty()
    }

    /// Complexity estimate for a content type: mean over declaring tools,
    /// or the type's built-in default.
    pub fn complexity(&self, content_type: ContentType) -> f64 {
        let caps = self.ranked(content_type);
        if caps.is_empty() {
            return content_type.default_complexity();
        }
        caps.iter().map(|c| c.complexity).sum::<f64>() / caps.len() as f64
    }

    /// Expected seconds for `tool` on `content_type`, if declared.
    pub fn expected_seconds(&self, tool: &str, content_type: ContentType) -> Option<f64> {
        self.get(tool, content_type).map(|c| c.speed)
    }

    /// Slowest declared speed across the whole table.
    pub fn slowest_seconds(&self) -> f64 {
        self.by_type
            .values()
            .flatten()
            .map(|c| c.speed)
            .fold(0.0, f64::max)
    }

    pub fn memory_mb(&self, tool: &str) -> u64 {
        self.memory.get(tool).copied().unwrap_or(DEFAULT_MEMORY_MB)
    }
}
