//! Tool assignment: primary tool plus ordered fallback chain per zone.

use std::sync::Arc;

use tracing::warn;

use zoneflow_shared::{EngineConfig, FallbackStrategy, Zone, ZoneWarning};

use crate::capability::CapabilityRegistry;

/// Result of assigning tools to a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub primary: String,
    pub fallback_chain: Vec<String>,
    /// Set when the content type had no capability entry.
    pub warning: Option<ZoneWarning>,
}

#[derive(Debug, Clone)]
pub struct ToolAssignmentEngine {
    capabilities: Arc<CapabilityRegistry>,
    config: Arc<EngineConfig>,
}

impl ToolAssignmentEngine {
    pub fn new(capabilities: Arc<CapabilityRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            capabilities,
            config,
        }
    }

    /// Pick the primary tool and fallback chain. Never fails: a content type
    /// nobody declares gets the default tool and a warning.
    pub fn assign(&self, zone: &Zone) -> Assignment {
        let content_type = zone.content_type;
        let strategy = self.config.strategy_for(content_type);
        let ranked = self.capabilities.ranked(content_type);

        let Some(best) = ranked.first() else {
            let default_tool = self.config.engine.default_tool.clone();
            warn!(
                zone_id = %zone.id,
                content_type = %content_type,
                tool = %default_tool,
                "no capability for content type, using default tool"
            );
            let chain = chain(&default_tool, &strategy.fallback_tools, strategy);
            return Assignment {
                primary: default_tool.clone(),
                fallback_chain: chain,
                warning: Some(ZoneWarning::ContentTypeUnsupported {
                    content_type,
                    default_tool,
                }),
            };
        };

        let candidates: Vec<String> = if strategy.fallback_tools.is_empty() {
            ranked.iter().map(|c| c.tool.clone()).collect()
        } else {
            strategy.fallback_tools.clone()
        };
        Assignment {
            primary: best.tool.clone(),
            fallback_chain: chain(&best.tool, &candidates, strategy),
            warning: None,
        }
    }
}

/// Candidates minus the primary and duplicates, capped at `max_attempts - 1`.
fn chain(primary: &str, candidates: &[String], strategy: &FallbackStrategy) -> Vec<String> {
    let cap = strategy.max_attempts.saturating_sub(1) as usize;
    let mut out: Vec<String> = Vec::new();
    for tool in candidates {
        if out.len() >= cap {
            break;
        }
        if tool != primary && !out.contains(tool) {
            out.push(tool.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use zoneflow_shared::{BoundingBox, ContentType};

    use super::*;

    fn zone(content_type: ContentType) -> Zone {
        Zone {
            id: "z".into(),
            page_number: 1,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                page_width: 1.0,
                page_height: 1.0,
            },
            content_type,
            user_priority: None,
            depends_on: vec![],
        }
    }

    fn engine(config: EngineConfig) -> ToolAssignmentEngine {
        let capabilities = Arc::new(CapabilityRegistry::from_config(&config));
        ToolAssignmentEngine::new(capabilities, Arc::new(config))
    }

    #[test]
    fn ranked_primary_and_chain() {
        let a = engine(EngineConfig::default()).assign(&zone(ContentType::Table));
        assert_eq!(a.primary, "layoutlm");
        assert_eq!(a.fallback_chain, ["paddle", "unstructured"]);
        assert!(a.warning.is_none());
    }

    #[test]
    fn chain_capped_by_max_attempts() {
        let mut config = EngineConfig::default();
        config.fallback.default.max_attempts = 2;
        let a = engine(config).assign(&zone(ContentType::Text));
        assert_eq!(a.primary, "layoutlm");
        assert_eq!(a.fallback_chain.len(), 1);

        let mut config = EngineConfig::default();
        config.fallback.default.max_attempts = 1;
        let a = engine(config).assign(&zone(ContentType::Text));
        assert!(a.fallback_chain.is_empty());
    }

    #[test]
    fn explicit_fallback_order_wins() {
        let mut config = EngineConfig::default();
        config.fallback.content_types.insert(
            ContentType::Table,
            FallbackStrategy {
                fallback_tools: vec!["unstructured".into(), "layoutlm".into(), "paddle".into()],
                ..FallbackStrategy::default()
            },
        );
        let a = engine(config).assign(&zone(ContentType::Table));
        assert_eq!(a.primary, "layoutlm");
        assert_eq!(a.fallback_chain, ["unstructured", "paddle"]);
    }

    #[test]
    fn unsupported_type_degrades_to_default_tool() {
        let mut config = EngineConfig::default();
        config.tools.iter_mut().for_each(|t| {
            t.capabilities.retain(|c| c.content_type != ContentType::Diagram)
        });
        let a = engine(config).assign(&zone(ContentType::Diagram));
        assert_eq!(a.primary, "unstructured");
        assert!(matches!(
            a.warning,
            Some(ZoneWarning::ContentTypeUnsupported {
                content_type: ContentType::Diagram,
                ..
            })
        ));
    }
}
