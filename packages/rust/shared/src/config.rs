//! Engine configuration for Zoneflow.
//!
//! User config lives at `~/.zoneflow/zoneflow.toml`.
//! CLI flags override config file values, which override defaults.
//! The configuration is validated once at engine construction and is
//! immutable for the lifetime of a run.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, ZoneflowError};
use crate::types::{ContentType, MergePolicy};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "zoneflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".zoneflow";

/// Tolerance when checking that weights sum to 1.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Config structs (matching zoneflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level engine config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global engine limits.
    #[serde(default)]
    pub engine: EngineSection,

    /// Priority calculator settings.
    #[serde(default)]
    pub priority: PriorityConfig,

    /// Confidence engine settings.
    #[serde(default)]
    pub confidence: ConfidenceConfig,

    /// Result merger settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Fallback strategies.
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Tool capability table and adapter registrations.
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: EngineSection::default(),
            priority: PriorityConfig::default(),
            confidence: ConfidenceConfig::default(),
            merge: MergeConfig::default(),
            fallback: FallbackConfig::default(),
            tools: default_tools(),
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Global concurrency ceiling (also the worker pool size).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Memory budget shared by all in-flight attempts, in MiB.
    #[serde(default = "default_memory_budget")]
    pub memory_budget_mb: u64,

    /// Generic tool used when no capability covers a content type.
    #[serde(default = "default_tool")]
    pub default_tool: String,

    /// How long a cancelled attempt may take to wind down before it is abandoned.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,

    /// Max vertical gap (fraction of page height) for two zones to count as neighbors.
    #[serde(default = "default_neighbor_gap")]
    pub neighbor_gap: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            memory_budget_mb: default_memory_budget(),
            default_tool: default_tool(),
            cancel_grace_ms: default_cancel_grace(),
            neighbor_gap: default_neighbor_gap(),
        }
    }
}

fn default_max_concurrency() -> u32 {
    5
}
fn default_memory_budget() -> u64 {
    4096
}
fn default_tool() -> String {
    "unstructured".into()
}
fn default_cancel_grace() -> u64 {
    2000
}
fn default_neighbor_gap() -> f64 {
    0.05
}

/// Scoring strategy for the priority calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityStrategyKind {
    #[default]
    WeightedSum,
    Multiplicative,
}

/// `[priority]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    #[serde(default)]
    pub strategy: PriorityStrategyKind,

    #[serde(default)]
    pub weights: PriorityWeights,

    /// Number of dependents at which the dependency weight saturates at 1.
    #[serde(default = "default_dependency_saturation")]
    pub dependency_saturation: u32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            strategy: PriorityStrategyKind::default(),
            weights: PriorityWeights::default(),
            dependency_saturation: default_dependency_saturation(),
        }
    }
}

fn default_dependency_saturation() -> u32 {
    1
}

/// `[priority.weights]`: must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub complexity: f64,
    pub availability: f64,
    pub user: f64,
    pub dependency: f64,
    pub time: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            complexity: 0.2,
            availability: 0.15,
            user: 0.35,
            dependency: 0.2,
            time: 0.1,
        }
    }
}

impl PriorityWeights {
    pub fn sum(&self) -> f64 {
        self.complexity + self.availability + self.user + self.dependency + self.time
    }

    fn as_array(&self) -> [(&'static str, f64); 5] {
        [
            ("complexity", self.complexity),
            ("availability", self.availability),
            ("user", self.user),
            ("dependency", self.dependency),
            ("time", self.time),
        ]
    }
}

/// `[[confidence.weight_sets]]`: one versioned set of factor weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorWeights {
    pub version: u32,
    pub tool_reliability: f64,
    pub content_complexity: f64,
    pub contextual_agreement: f64,
    pub cross_validation: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            version: 1,
            tool_reliability: 0.4,
            content_complexity: 0.2,
            contextual_agreement: 0.2,
            cross_validation: 0.2,
        }
    }
}

impl FactorWeights {
    pub fn sum(&self) -> f64 {
        self.tool_reliability + self.content_complexity + self.contextual_agreement
            + self.cross_validation
    }

    /// SHA-256 over the version and weights, recorded with every score.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        for w in [
            self.tool_reliability,
            self.content_complexity,
            self.contextual_agreement,
            self.cross_validation,
        ] {
            hasher.update(w.to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// `[confidence]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Normalized score assumed when a tool reports no confidence.
    #[serde(default = "default_missing_floor")]
    pub missing_signal_floor: f64,

    /// Max bonus from high-confidence neighbors.
    #[serde(default = "default_contextual_bonus")]
    pub contextual_bonus: f64,

    /// Neighbor mean confidence at which the contextual bonus starts.
    #[serde(default = "default_high_confidence")]
    pub high_confidence_level: f64,

    /// Max bonus when another tool's output agrees.
    #[serde(default = "default_cross_validation_bonus")]
    pub cross_validation_bonus: f64,

    /// Weight set version used for new scores.
    #[serde(default = "default_active_version")]
    pub active_version: u32,

    /// Every weight set ever used, so old scores can be reproduced.
    #[serde(default = "default_weight_sets")]
    pub weight_sets: Vec<FactorWeights>,

    /// JSON file with historical (tool, content_type, predicted, actual) samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_file: Option<String>,

    /// Number of equal-width reliability bins per (tool, content type).
    #[serde(default = "default_calibration_bins")]
    pub calibration_bins: u32,

    /// Samples needed before a (tool, content type) key is calibrated at all.
    #[serde(default = "default_calibration_min_samples")]
    pub calibration_min_samples: u32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            missing_signal_floor: default_missing_floor(),
            contextual_bonus: default_contextual_bonus(),
            high_confidence_level: default_high_confidence(),
            cross_validation_bonus: default_cross_validation_bonus(),
            active_version: default_active_version(),
            weight_sets: default_weight_sets(),
            calibration_file: None,
            calibration_bins: default_calibration_bins(),
            calibration_min_samples: default_calibration_min_samples(),
        }
    }
}

impl ConfidenceConfig {
    /// Weight set with the given version.
    pub fn weights(&self, version: u32) -> Option<&FactorWeights> {
        self.weight_sets.iter().find(|w| w.version == version)
    }

    /// Weight set used for new scores.
    pub fn active_weights(&self) -> Option<&FactorWeights> {
        self.weights(self.active_version)
    }
}

fn default_missing_floor() -> f64 {
    0.3
}
fn default_contextual_bonus() -> f64 {
    0.1
}
fn default_high_confidence() -> f64 {
    0.8
}
fn default_cross_validation_bonus() -> f64 {
    0.15
}
fn default_active_version() -> u32 {
    1
}
fn default_weight_sets() -> Vec<FactorWeights> {
    vec![FactorWeights::default()]
}
fn default_calibration_bins() -> u32 {
    10
}
fn default_calibration_min_samples() -> u32 {
    20
}

/// `[merge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Similarity above which two candidates are considered in agreement.
    #[serde(default = "default_agreement_threshold")]
    pub agreement_threshold: f64,

    /// Minimum merge quality for a merged result to be produced.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Policy when no pair agrees.
    #[serde(default = "default_merge_policy")]
    pub default_policy: MergePolicy,

    /// Per-content-type policy overrides.
    #[serde(default = "default_policy_overrides")]
    pub policies: BTreeMap<ContentType, MergePolicy>,

    /// Agreeing tools required by the `consensus` policy.
    #[serde(default = "default_consensus_min")]
    pub consensus_min_agreeing: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            agreement_threshold: default_agreement_threshold(),
            quality_threshold: default_quality_threshold(),
            default_policy: default_merge_policy(),
            policies: default_policy_overrides(),
            consensus_min_agreeing: default_consensus_min(),
        }
    }
}

impl MergeConfig {
    pub fn policy_for(&self, content_type: ContentType) -> MergePolicy {
        self.policies
            .get(&content_type)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

fn default_agreement_threshold() -> f64 {
    0.9
}
fn default_quality_threshold() -> f64 {
    0.5
}
fn default_merge_policy() -> MergePolicy {
    MergePolicy::BestSingleTool
}
fn default_policy_overrides() -> BTreeMap<ContentType, MergePolicy> {
    BTreeMap::from([(ContentType::Table, MergePolicy::WeightedAverage)])
}
fn default_consensus_min() -> u32 {
    2
}

/// Exponential backoff between fallback attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_backoff_base")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base(),
            multiplier: default_backoff_multiplier(),
            max_ms: default_backoff_max(),
        }
    }
}

fn default_backoff_base() -> u64 {
    200
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_max() -> u64 {
    5000
}

/// Fallback behaviour for one content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackStrategy {
    /// Final confidence below which the next tool is tried.
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,

    /// Explicit fallback order; empty means "rank by capability".
    #[serde(default)]
    pub fallback_tools: Vec<String>,

    /// Attempts allowed for one zone, primary included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-attempt timeout.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        Self {
            confidence_threshold: default_threshold(),
            fallback_tools: Vec::new(),
            max_attempts: default_max_attempts(),
            timeout_ms: default_timeout(),
            backoff: BackoffPolicy::default(),
        }
    }
}

fn default_threshold() -> f64 {
    0.7
}
fn default_max_attempts() -> u32 {
    3
}
fn default_timeout() -> u64 {
    30_000
}

/// `[fallback]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Strategy for content types without an override.
    #[serde(default)]
    pub default: FallbackStrategy,

    /// `[fallback.content_types.<type>]` overrides.
    #[serde(default = "default_fallback_overrides")]
    pub content_types: BTreeMap<ContentType, FallbackStrategy>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            default: FallbackStrategy::default(),
            content_types: default_fallback_overrides(),
        }
    }
}

fn default_fallback_overrides() -> BTreeMap<ContentType, FallbackStrategy> {
    BTreeMap::from([
        (
            ContentType::Diagram,
            FallbackStrategy {
                confidence_threshold: 0.6,
                timeout_ms: 60_000,
                ..FallbackStrategy::default()
            },
        ),
        (
            ContentType::Image,
            FallbackStrategy {
                confidence_threshold: 0.6,
                ..FallbackStrategy::default()
            },
        ),
    ])
}

/// Per-tool curve mapping native confidence onto a common scale.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CurveConfig {
    #[default]
    Linear,
    Power {
        exponent: f64,
    },
    Logistic {
        midpoint: f64,
        steepness: f64,
    },
    Piecewise {
        points: Vec<[f64; 2]>,
    },
}

/// `[[tools.capabilities]]`: what a tool is good at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub content_type: ContentType,
    /// Expected accuracy in [0,1].
    pub accuracy: f64,
    /// Expected seconds per zone (lower is faster).
    pub speed: f64,
    /// Content complexity this tool handles, in [0,1].
    pub complexity: f64,
}

/// `[[tools]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,

    /// Concurrent attempts allowed for this tool; `None` means only the global ceiling applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,

    /// Estimated memory per attempt, in MiB.
    #[serde(default = "default_tool_memory")]
    pub memory_mb: u64,

    /// Native confidence range `[min, max]`.
    #[serde(default = "default_confidence_range")]
    pub confidence_range: [f64; 2],

    #[serde(default)]
    pub curve: CurveConfig,

    /// External command implementing the adapter protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub capabilities: Vec<CapabilityConfig>,
}

fn default_tool_memory() -> u64 {
    128
}
fn default_confidence_range() -> [f64; 2] {
    [0.0, 1.0]
}

fn capability(content_type: ContentType, accuracy: f64, speed: f64, complexity: f64) -> CapabilityConfig {
    CapabilityConfig {
        content_type,
        accuracy,
        speed,
        complexity,
    }
}

fn default_tools() -> Vec<ToolConfig> {
    use ContentType::*;
    vec![
        ToolConfig {
            name: "unstructured".into(),
            max_concurrency: None,
            memory_mb: 256,
            confidence_range: [0.0, 1.0],
            curve: CurveConfig::Linear,
            command: None,
            capabilities: vec![
                capability(Text, 0.85, 1.0, 0.2),
                capability(Table, 0.75, 2.0, 0.6),
                capability(Header, 0.9, 0.5, 0.05),
                capability(Footer, 0.9, 0.5, 0.05),
                capability(Unknown, 0.6, 1.5, 0.5),
            ],
        },
        ToolConfig {
            name: "layoutlm".into(),
            max_concurrency: Some(2),
            memory_mb: 1024,
            confidence_range: [0.0, 1.0],
            curve: CurveConfig::Logistic {
                midpoint: 0.5,
                steepness: 6.0,
            },
            command: None,
            capabilities: vec![
                capability(Text, 0.88, 2.5, 0.3),
                capability(Table, 0.9, 3.0, 0.7),
                capability(Diagram, 0.7, 4.0, 1.0),
            ],
        },
        ToolConfig {
            name: "paddle".into(),
            max_concurrency: None,
            memory_mb: 512,
            confidence_range: [0.0, 1.0],
            curve: CurveConfig::Linear,
            command: None,
            capabilities: vec![
                capability(Text, 0.85, 1.5, 0.3),
                capability(Table, 0.86, 2.5, 0.6),
                capability(Image, 0.8, 2.0, 0.7),
            ],
        },
        ToolConfig {
            name: "tesseract".into(),
            max_concurrency: Some(1),
            memory_mb: 128,
            confidence_range: [0.0, 100.0],
            curve: CurveConfig::Linear,
            command: None,
            capabilities: vec![
                capability(Text, 0.8, 0.8, 0.2),
                capability(Header, 0.85, 0.3, 0.05),
                capability(Footer, 0.85, 0.3, 0.05),
                capability(Image, 0.7, 1.5, 0.7),
            ],
        },
    ]
}

// ---------------------------------------------------------------------------
// Lookups & validation
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Fallback strategy for a content type.
    pub fn strategy_for(&self, content_type: ContentType) -> &FallbackStrategy {
        self.fallback
            .content_types
            .get(&content_type)
            .unwrap_or(&self.fallback.default)
    }

    /// Tool entry by name.
    pub fn tool(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Check every constraint the engine relies on. Fails fast with
    /// [`ZoneflowError::ConfigurationInvalid`].
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(ZoneflowError::config("engine.max_concurrency must be at least 1"));
        }
        check_unit("engine.neighbor_gap", self.engine.neighbor_gap)?;

        // Priority
        let pw = &self.priority.weights;
        for (name, w) in pw.as_array() {
            check_unit(&format!("priority.weights.{name}"), w)?;
        }
        check_sum("priority.weights", pw.sum())?;
        if self.priority.dependency_saturation == 0 {
            return Err(ZoneflowError::config(
                "priority.dependency_saturation must be at least 1",
            ));
        }

        // Confidence
        let c = &self.confidence;
        check_unit("confidence.missing_signal_floor", c.missing_signal_floor)?;
        if c.missing_signal_floor == 0.0 || c.missing_signal_floor == 1.0 {
            return Err(ZoneflowError::config(
                "confidence.missing_signal_floor must lie strictly between 0 and 1",
            ));
        }
        check_unit("confidence.contextual_bonus", c.contextual_bonus)?;
        check_unit("confidence.high_confidence_level", c.high_confidence_level)?;
        check_unit("confidence.cross_validation_bonus", c.cross_validation_bonus)?;
        let mut versions = HashSet::new();
        for ws in &c.weight_sets {
            if !versions.insert(ws.version) {
                return Err(ZoneflowError::config(format!(
                    "confidence weight set version {} is defined twice",
                    ws.version
                )));
            }
            for (name, w) in [
                ("tool_reliability", ws.tool_reliability),
                ("content_complexity", ws.content_complexity),
                ("contextual_agreement", ws.contextual_agreement),
                ("cross_validation", ws.cross_validation),
            ] {
                check_unit(&format!("confidence.weight_sets[v{}].{name}", ws.version), w)?;
            }
            check_sum(&format!("confidence.weight_sets[v{}]", ws.version), ws.sum())?;
        }
        if c.active_weights().is_none() {
            return Err(ZoneflowError::config(format!(
                "confidence.active_version {} has no matching weight set",
                c.active_version
            )));
        }
        if c.calibration_bins == 0 {
            return Err(ZoneflowError::config("confidence.calibration_bins must be at least 1"));
        }

        // Merge
        check_unit("merge.agreement_threshold", self.merge.agreement_threshold)?;
        check_unit("merge.quality_threshold", self.merge.quality_threshold)?;
        if self.merge.consensus_min_agreeing < 2 {
            return Err(ZoneflowError::config(
                "merge.consensus_min_agreeing must be at least 2",
            ));
        }

        // Tools
        let mut names = HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(ZoneflowError::config("tool name must not be empty"));
            }
            if !names.insert(tool.name.as_str()) {
                return Err(ZoneflowError::config(format!(
                    "tool '{}' is defined twice",
                    tool.name
                )));
            }
            validate_tool(tool)?;
        }
        if !names.contains(self.engine.default_tool.as_str()) {
            return Err(ZoneflowError::config(format!(
                "engine.default_tool '{}' is not a configured tool",
                self.engine.default_tool
            )));
        }

        // Fallback
        let strategies = std::iter::once(("default".to_string(), &self.fallback.default)).chain(
            self.fallback
                .content_types
                .iter()
                .map(|(ct, s)| (ct.to_string(), s)),
        );
        for (label, strategy) in strategies {
            check_unit(
                &format!("fallback.{label}.confidence_threshold"),
                strategy.confidence_threshold,
            )?;
            if strategy.max_attempts == 0 {
                return Err(ZoneflowError::config(format!(
                    "fallback.{label}.max_attempts must be at least 1"
                )));
            }
            if strategy.timeout_ms == 0 {
                return Err(ZoneflowError::config(format!(
                    "fallback.{label}.timeout_ms must be positive"
                )));
            }
            let b = &strategy.backoff;
            if b.multiplier < 1.0 || b.max_ms < b.base_ms {
                return Err(ZoneflowError::config(format!(
                    "fallback.{label}.backoff needs multiplier >= 1 and max_ms >= base_ms"
                )));
            }
            for name in &strategy.fallback_tools {
                if !names.contains(name.as_str()) {
                    return Err(ZoneflowError::config(format!(
                        "fallback.{label} references unknown tool '{name}'"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_tool(tool: &ToolConfig) -> Result<()> {
    let name = &tool.name;
    if tool.max_concurrency == Some(0) {
        return Err(ZoneflowError::config(format!(
            "tool '{name}' max_concurrency must be at least 1"
        )));
    }
    let [lo, hi] = tool.confidence_range;
    if !(lo.is_finite() && hi.is_finite() && hi > lo) {
        return Err(ZoneflowError::config(format!(
            "tool '{name}' confidence_range must be finite with max > min"
        )));
    }
    match &tool.curve {
        CurveConfig::Linear => {}
        CurveConfig::Power { exponent } => {
            if !(exponent.is_finite() && *exponent > 0.0) {
                return Err(ZoneflowError::config(format!(
                    "tool '{name}' power curve exponent must be positive"
                )));
            }
        }
        CurveConfig::Logistic {
            midpoint,
            steepness,
        } => {
            check_unit(&format!("tool '{name}' logistic midpoint"), *midpoint)?;
            if !(steepness.is_finite() && *steepness > 0.0) {
                return Err(ZoneflowError::config(format!(
                    "tool '{name}' logistic steepness must be positive"
                )));
            }
        }
        CurveConfig::Piecewise { points } => {
            if points.len() < 2 {
                return Err(ZoneflowError::config(format!(
                    "tool '{name}' piecewise curve needs at least two points"
                )));
            }
            for [x, y] in points {
                check_unit(&format!("tool '{name}' piecewise x"), *x)?;
                check_unit(&format!("tool '{name}' piecewise y"), *y)?;
            }
            let monotone = points
                .windows(2)
                .all(|w| w[1][0] > w[0][0] && w[1][1] >= w[0][1]);
            if !monotone {
                return Err(ZoneflowError::config(format!(
                    "tool '{name}' piecewise points must be strictly increasing in x and non-decreasing in y"
                )));
            }
        }
    }
    if tool.command.as_ref().is_some_and(|c| c.is_empty()) {
        return Err(ZoneflowError::config(format!(
            "tool '{name}' command must not be empty"
        )));
    }
    let mut seen = HashSet::new();
    for cap in &tool.capabilities {
        if !seen.insert(cap.content_type) {
            return Err(ZoneflowError::config(format!(
                "tool '{name}' declares content type '{}' twice",
                cap.content_type
            )));
        }
        check_unit(&format!("tool '{name}' accuracy"), cap.accuracy)?;
        check_unit(&format!("tool '{name}' complexity"), cap.complexity)?;
        if !(cap.speed.is_finite() && cap.speed > 0.0) {
            return Err(ZoneflowError::config(format!(
                "tool '{name}' speed must be positive"
            )));
        }
    }
    Ok(())
}

fn check_unit(label: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ZoneflowError::config(format!(
            "{label} must be within [0, 1], got {value}"
        )))
    }
}

fn check_sum(label: &str, sum: f64) -> Result<()> {
    if (sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE {
        Ok(())
    } else {
        Err(ZoneflowError::config(format!(
            "{label} must sum to 1, got {sum}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.zoneflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ZoneflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.zoneflow/zoneflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the engine config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<EngineConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(EngineConfig::default());
    }

    load_config_from(&path)
}

/// Load the engine config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ZoneflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ZoneflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ZoneflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = EngineConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ZoneflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ZoneflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
