//! Core domain types for the processing engine.
//!
//! Zones arrive read-only from the upstream detector; everything else in this
//! module is owned by the engine and recorded for the result hand-off.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable zone identifier assigned by the upstream detector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

impl ZoneId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ZoneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ZoneId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Zone (input)
// ---------------------------------------------------------------------------

/// Classified content type of a zone.
///
/// Unrecognized values from the detector deserialize as [`ContentType::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Table,
    Image,
    Diagram,
    Header,
    Footer,
    #[serde(other)]
    Unknown,
}

impl ContentType {
    pub const ALL: [ContentType; 7] = [
        Self::Text,
        Self::Table,
        Self::Image,
        Self::Diagram,
        Self::Header,
        Self::Footer,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::Image => "image",
            Self::Diagram => "diagram",
            Self::Header => "header",
            Self::Footer => "footer",
            Self::Unknown => "unknown",
        }
    }

    /// Complexity estimate used when no capability entry declares one
    /// (0 = simple text, 1 = complex diagram).
    pub fn default_complexity(&self) -> f64 {
        match self {
            Self::Header | Self::Footer => 0.05,
            Self::Text => 0.1,
            Self::Unknown => 0.5,
            Self::Table => 0.6,
            Self::Image => 0.7,
            Self::Diagram => 1.0,
        }
    }

    /// Whether cell-wise numeric averaging makes sense for this content.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Table)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ct| ct.as_str() == s)
            .ok_or_else(|| format!("unknown content type '{s}'"))
    }
}

/// Region of a page, in the page's own units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub page_width: f64,
    pub page_height: f64,
}

impl BoundingBox {
    /// Fraction of the page covered by this region.
    pub fn page_fraction(&self) -> f64 {
        let page = self.page_width * self.page_height;
        if page <= 0.0 {
            return 0.0;
        }
        (self.width * self.height / page).clamp(0.0, 1.0)
    }

    /// Vertical gap to `other` as a fraction of page height (0 when overlapping).
    pub fn vertical_gap(&self, other: &BoundingBox) -> f64 {
        let (top, bottom) = if self.y <= other.y {
            (self, other)
        } else {
            (other, self)
        };
        let gap = bottom.y - (top.y + top.height);
        if gap <= 0.0 || self.page_height <= 0.0 {
            0.0
        } else {
            gap / self.page_height
        }
    }
}

/// A classified region of the source document. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub page_number: u32,
    pub bbox: BoundingBox,
    pub content_type: ContentType,
    /// User-assigned priority in [0,1]; `None` means the default 0.5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_priority: Option<f64>,
    /// Zones that must complete before this one is dispatched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ZoneId>,
}

impl Zone {
    pub const DEFAULT_USER_PRIORITY: f64 = 0.5;

    pub fn user_priority(&self) -> f64 {
        self.user_priority
            .unwrap_or(Self::DEFAULT_USER_PRIORITY)
            .clamp(0.0, 1.0)
    }

    /// Same page and vertically within `max_gap` (fraction of page height).
    pub fn is_neighbor_of(&self, other: &Zone, max_gap: f64) -> bool {
        self.id != other.id
            && self.page_number == other.page_number
            && self.bbox.vertical_gap(&other.bbox) <= max_gap
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Per-zone processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ZoneStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle state of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    Cancelled,
    Completed,
}

/// Why the fallback manager moved past an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTrigger {
    LowConfidence,
    ToolTimeout,
    ToolError,
    ContentMismatch,
    ValidationFailure,
}

impl FallbackTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowConfidence => "low_confidence",
            Self::ToolTimeout => "tool_timeout",
            Self::ToolError => "tool_error",
            Self::ContentMismatch => "content_mismatch",
            Self::ValidationFailure => "validation_failure",
        }
    }
}

impl std::fmt::Display for FallbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-zone fallback state machine position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FallbackState {
    NotStarted,
    Attempting { tool: String, attempt: u32 },
    Succeeded,
    LowConfidence,
    Failed,
    Exhausted,
}

// ---------------------------------------------------------------------------
// Tool output
// ---------------------------------------------------------------------------

/// What an extraction tool hands back for one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Extracted content rendered as text; opaque apart from similarity checks.
    pub content: String,
    /// Confidence in the tool's native range, if the tool reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_confidence: Option<f64>,
    /// Content type the tool believes it saw, if it classifies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_content_type: Option<ContentType>,
    /// Tool-specific payload passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ToolOutput {
    pub fn new(content: impl Into<String>, raw_confidence: Option<f64>) -> Self {
        Self {
            content: content.into(),
            raw_confidence,
            detected_content_type: None,
            metadata: serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// Inputs the confidence engine saw when scoring an attempt. Stored with the
/// attempt so the score can be recomputed exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreContext {
    /// Content complexity estimate in [0,1].
    pub complexity: f64,
    /// Final confidences of neighboring/dependency zones at scoring time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub neighbor_confidences: Vec<f64>,
    /// Best similarity against earlier successful attempts of the same zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_agreement: Option<f64>,
}

/// One named factor in a confidence explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactor {
    pub name: String,
    pub weight: f64,
    pub value: f64,
    pub contribution: f64,
    pub description: String,
}

/// Full confidence record for one attempt. Every field lies in [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    /// Native confidence mapped from the tool's declared range onto [0,1].
    pub raw_score: f64,
    pub normalized_score: f64,
    pub weighted_score: f64,
    pub calibrated_score: f64,
    pub final_confidence: f64,
    /// True when the tool gave no confidence and the floor was used.
    #[serde(default)]
    pub signal_missing: bool,
    pub weights_version: u32,
    pub weights_fingerprint: String,
    pub explanation: Vec<ConfidenceFactor>,
}

impl ConfidenceScore {
    /// Human-readable one-line summary of the explanation.
    pub fn summary(&self) -> String {
        let factors = self
            .explanation
            .iter()
            .map(|f| format!("{}={:.3}", f.name, f.contribution))
            .collect::<Vec<_>>()
            .join(", ");
        format!("confidence {:.3} ({factors})", self.final_confidence)
    }
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// Error recorded against a failed or rejected attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub trigger: FallbackTrigger,
    pub message: String,
}

/// One execution of one tool against one zone. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingAttempt {
    /// Zero-based index within the zone's attempt history.
    pub index: u32,
    pub tool: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ScoreContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ConfidenceScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AttemptError>,
    /// Trigger that sent the zone past this attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<FallbackTrigger>,
}

impl ProcessingAttempt {
    /// Produced output and no error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.output.is_some()
    }

    pub fn final_confidence(&self) -> Option<f64> {
        self.score.as_ref().map(|s| s.final_confidence)
    }
}

/// Non-fatal condition attached to a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ZoneWarning {
    /// No capability for the content type; the default tool was used.
    ContentTypeUnsupported {
        content_type: ContentType,
        default_tool: String,
    },
    /// Memory budget forced a cheaper tool.
    Degraded { from: String, to: String },
    /// Best result stayed below the content-type threshold.
    LowConfidence { confidence: f64, threshold: f64 },
    /// Candidates disagreed; see the result's conflict list.
    MergeConflictUnresolved { conflicts: usize },
    /// A declared dependency is not part of the run and was ignored.
    UnknownDependency { zone_id: ZoneId },
}

/// Mutable per-zone record owned exclusively by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingZone {
    pub zone: Arc<Zone>,
    pub priority: f64,
    pub assigned_tool: String,
    pub fallback_chain: Vec<String>,
    pub status: ZoneStatus,
    pub fallback_state: FallbackState,
    pub attempts: Vec<ProcessingAttempt>,
    pub dependencies: Vec<ZoneId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ZoneWarning>,
}

impl ProcessingZone {
    pub fn new(zone: Arc<Zone>, assigned_tool: String, fallback_chain: Vec<String>) -> Self {
        let dependencies = zone.depends_on.clone();
        Self {
            zone,
            priority: 0.0,
            assigned_tool,
            fallback_chain,
            status: ZoneStatus::Queued,
            fallback_state: FallbackState::NotStarted,
            attempts: Vec::new(),
            dependencies,
            warnings: Vec::new(),
        }
    }

    pub fn id(&self) -> &ZoneId {
        &self.zone.id
    }

    /// Successful attempt with the highest final confidence (earliest wins ties).
    pub fn best_attempt(&self) -> Option<&ProcessingAttempt> {
        self.attempts
            .iter()
            .filter(|a| a.succeeded())
            .fold(None, |best: Option<&ProcessingAttempt>, a| match best {
                Some(b) if b.final_confidence() >= a.final_confidence() => Some(b),
                _ => Some(a),
            })
    }

    /// Tools already tried for this zone, in order.
    pub fn tried_tools(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.tool.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Quality metrics used when comparing merge candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuality {
    pub normalized_score: f64,
    pub content_chars: usize,
    pub duration_ms: u64,
}

/// One completed attempt offered to the merger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub attempt_index: u32,
    pub tool: String,
    pub content: String,
    pub confidence: f64,
    pub quality: CandidateQuality,
}

/// A difference between two candidates that the merger did not reconcile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Attempt index of the kept candidate.
    pub kept: u32,
    /// Attempt index of the discarded candidate.
    pub discarded: u32,
    pub kept_tool: String,
    pub discarded_tool: String,
    pub similarity: f64,
    pub discarded_content: String,
}

/// Merge strategy applied when candidates do not clearly agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    BestSingleTool,
    WeightedAverage,
    Consensus,
}

/// Reconciled content produced from two or more candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub content: String,
    pub confidence: f64,
    /// Attempt indexes that contributed.
    pub contributors: Vec<u32>,
    pub merge_quality: f64,
    pub policy: MergePolicy,
    pub conflicts: Vec<Conflict>,
}

// ---------------------------------------------------------------------------
// Final zone record
// ---------------------------------------------------------------------------

/// Where the final content of a zone came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResultSource {
    SingleAttempt { attempt_index: u32, tool: String },
    Merged(MergedResult),
    None,
}

/// Final per-zone record handed to the external result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneResult {
    pub run_id: RunId,
    pub zone_id: ZoneId,
    pub content_type: ContentType,
    pub status: ZoneStatus,
    /// Best-effort result below the content-type threshold.
    pub low_confidence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub final_confidence: f64,
    pub source: ResultSource,
    /// Explanation of the chosen attempt's confidence.
    pub explanation: Vec<ConfidenceFactor>,
    pub conflicts: Vec<Conflict>,
    pub warnings: Vec<ZoneWarning>,
    pub attempts: Vec<ProcessingAttempt>,
    pub completed_at: DateTime<Utc>,
}

impl ZoneResult {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}
