//! Core types for the decision feedback loop
//!
//! Every "type" string that flows through the system is a closed enum here,
//! each with its own option set and output shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::LoopError;

/// Kind of automated decision made by a producer outside this core
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionType {
    ClusterAssignment,
    ConceptExtraction,
    DuplicateMerge,
    DocumentPlacement,
}

impl DecisionType {
    pub const ALL: [DecisionType; 4] = [
        DecisionType::ClusterAssignment,
        DecisionType::ConceptExtraction,
        DecisionType::DuplicateMerge,
        DecisionType::DocumentPlacement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::ClusterAssignment => "cluster-assignment",
            DecisionType::ConceptExtraction => "concept-extraction",
            DecisionType::DuplicateMerge => "duplicate-merge",
            DecisionType::DocumentPlacement => "document-placement",
        }
    }

    /// Field of the output snapshot that carries the producer's choice
    pub fn output_field(&self) -> &'static str {
        match self {
            DecisionType::ClusterAssignment => "cluster",
            DecisionType::ConceptExtraction => "concepts",
            DecisionType::DuplicateMerge => "merge_with",
            DecisionType::DocumentPlacement => "folder",
        }
    }

    /// Feedback type a validation of this decision produces
    pub fn feedback_type(&self) -> FeedbackType {
        match self {
            DecisionType::ClusterAssignment => FeedbackType::ClusterCorrection,
            DecisionType::ConceptExtraction => FeedbackType::ConceptCorrection,
            DecisionType::DuplicateMerge => FeedbackType::MergeCorrection,
            DecisionType::DocumentPlacement => FeedbackType::PlacementCorrection,
        }
    }

    /// Fixed response options offered to the reviewer
    pub fn options(&self) -> Vec<ValidationOption> {
        let opt = |id: &str, label: &str, result, requires_value| ValidationOption {
            id: id.to_string(),
            label: label.to_string(),
            result,
            requires_value,
        };
        match self {
            DecisionType::ConceptExtraction => vec![
                opt("accept", "Accept", ValidationResult::Accepted, false),
                opt("edit", "Edit concepts", ValidationResult::Partial, true),
                opt("reject", "Reject", ValidationResult::Rejected, false),
            ],
            DecisionType::ClusterAssignment => vec![
                opt("accept", "Accept", ValidationResult::Accepted, false),
                opt("move", "Move to another cluster", ValidationResult::Partial, true),
                opt("reject", "Reject", ValidationResult::Rejected, false),
            ],
            DecisionType::DuplicateMerge => vec![
                opt("merge", "Merge", ValidationResult::Accepted, false),
                opt("keep_separate", "Keep separate", ValidationResult::Rejected, false),
            ],
            DecisionType::DocumentPlacement => vec![
                opt("accept", "Accept", ValidationResult::Accepted, false),
                opt("move", "Move", ValidationResult::Partial, true),
                opt("reject", "Reject", ValidationResult::Rejected, false),
            ],
        }
    }

    /// Concept lists feed the vocabulary; everything else feeds rules
    pub fn is_structural(&self) -> bool {
        !matches!(self, DecisionType::ConceptExtraction)
    }

    /// The producer's choice as a single label (structural types)
    pub fn primary_value(&self, output: &Value) -> Option<String> {
        value_as_label(output.get(self.output_field()).unwrap_or(output), self.output_field())
    }

    /// The producer's concept list (concept extraction)
    pub fn concepts(&self, output: &Value) -> Vec<String> {
        value_as_list(output.get(self.output_field()).unwrap_or(output))
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionType {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DecisionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LoopError::InvalidInput(format!("unknown decision type: {}", s)))
    }
}

/// Reduce a JSON value to a single label
///
/// Accepts a bare string or number, or an object carrying `field`.
pub fn value_as_label(value: &Value, field: &str) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get(field).and_then(|v| value_as_label(v, field)),
        _ => None,
    }
}

/// Reduce a JSON value to a list of strings (comma-separated strings allowed)
pub fn value_as_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Value::Object(map) => map.get("concepts").map(value_as_list).unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Where a decision applies
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
    pub owner: String,
    #[serde(default)]
    pub knowledge_base: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
}

impl Scope {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }
}

/// Outcome of a validation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationResult {
    Accepted,
    Rejected,
    Partial,
}

impl ValidationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationResult::Accepted => "accepted",
            ValidationResult::Rejected => "rejected",
            ValidationResult::Partial => "partial",
        }
    }

    /// Credit toward an acceptance rate
    pub fn credit(&self, partial_credit: f64) -> f64 {
        match self {
            ValidationResult::Accepted => 1.0,
            ValidationResult::Partial => partial_credit,
            ValidationResult::Rejected => 0.0,
        }
    }
}

impl FromStr for ValidationResult {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accepted" | "accept" => Ok(ValidationResult::Accepted),
            "rejected" | "reject" => Ok(ValidationResult::Rejected),
            "partial" => Ok(ValidationResult::Partial),
            other => Err(LoopError::InvalidInput(format!(
                "unknown validation result: {}",
                other
            ))),
        }
    }
}

/// A recorded automated decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDecision {
    pub id: String,
    pub decision_type: DecisionType,
    pub scope: Scope,
    pub input_snapshot: Value,
    pub output_snapshot: Value,
    pub confidence: f64,
    pub model_identity: String,
    pub validated: bool,
    pub validation_result: Option<ValidationResult>,
    pub validated_at: Option<DateTime<Utc>>,
    /// Rule that produced this decision (autonomous actions only)
    pub rule_id: Option<String>,
    /// Producer decision this autonomous action replaced
    pub supersedes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AiDecision {
    pub fn is_autonomous(&self) -> bool {
        self.rule_id.is_some()
    }

    /// Condition signature used to match rules
    pub fn signature(&self) -> Option<RuleCondition> {
        if !self.decision_type.is_structural() {
            return None;
        }
        let original_value = self.decision_type.primary_value(&self.output_snapshot)?;
        Some(RuleCondition {
            decision_type: self.decision_type,
            knowledge_base: self.scope.knowledge_base.clone(),
            original_value,
        })
    }
}

/// One reviewer choice on a validation prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationOption {
    pub id: String,
    pub label: String,
    pub result: ValidationResult,
    /// The option needs a corrected value (edit, move)
    pub requires_value: bool,
}

/// A pending decision rendered for a human
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPrompt {
    pub decision_id: String,
    pub decision_type: DecisionType,
    pub title: String,
    pub question: String,
    pub confidence: f64,
    pub options: Vec<ValidationOption>,
    pub output_snapshot: Value,
    pub created_at: DateTime<Utc>,
}

/// Kind of human correction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackType {
    ConceptCorrection,
    ClusterCorrection,
    PlacementCorrection,
    MergeCorrection,
    FreeText,
}

impl FeedbackType {
    pub const ALL: [FeedbackType; 5] = [
        FeedbackType::ConceptCorrection,
        FeedbackType::ClusterCorrection,
        FeedbackType::PlacementCorrection,
        FeedbackType::MergeCorrection,
        FeedbackType::FreeText,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::ConceptCorrection => "concept-correction",
            FeedbackType::ClusterCorrection => "cluster-correction",
            FeedbackType::PlacementCorrection => "placement-correction",
            FeedbackType::MergeCorrection => "merge-correction",
            FeedbackType::FreeText => "free-text",
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FeedbackType::ClusterCorrection
                | FeedbackType::PlacementCorrection
                | FeedbackType::MergeCorrection
        )
    }

    /// Decision type this correction speaks about
    pub fn decision_type(&self) -> Option<DecisionType> {
        match self {
            FeedbackType::ConceptCorrection => Some(DecisionType::ConceptExtraction),
            FeedbackType::ClusterCorrection => Some(DecisionType::ClusterAssignment),
            FeedbackType::PlacementCorrection => Some(DecisionType::DocumentPlacement),
            FeedbackType::MergeCorrection => Some(DecisionType::DuplicateMerge),
            FeedbackType::FreeText => None,
        }
    }
}

impl FromStr for FeedbackType {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeedbackType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LoopError::InvalidInput(format!("unknown feedback type: {}", s)))
    }
}

/// A human (or agent) correction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFeedback {
    pub id: String,
    pub owner: String,
    pub feedback_type: FeedbackType,
    pub decision_id: Option<String>,
    pub validation_result: Option<ValidationResult>,
    pub original_value: Option<Value>,
    pub new_value: Option<Value>,
    pub reasoning: Option<String>,
    pub processed: bool,
    pub improvement_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Structured predicate of a learned rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleCondition {
    pub decision_type: DecisionType,
    /// `None` matches every knowledge base
    #[serde(default)]
    pub knowledge_base: Option<String>,
    /// The producer's choice this rule corrects
    pub original_value: String,
}

impl RuleCondition {
    pub fn matches(&self, signature: &RuleCondition) -> bool {
        self.decision_type == signature.decision_type
            && normalize_label(&self.original_value) == normalize_label(&signature.original_value)
            && match &self.knowledge_base {
                None => true,
                Some(kb) => signature.knowledge_base.as_deref() == Some(kb.as_str()),
            }
    }
}

/// Structured effect of a learned rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Replace the producer's choice
    Assign { value: String },
    /// Withhold the producer's choice entirely
    Suppress,
}

impl RuleAction {
    pub fn agrees_with(&self, other: &RuleAction) -> bool {
        match (self, other) {
            (RuleAction::Assign { value: a }, RuleAction::Assign { value: b }) => {
                normalize_label(a) == normalize_label(b)
            }
            (RuleAction::Suppress, RuleAction::Suppress) => true,
            _ => false,
        }
    }

    /// Output snapshot the rule produces for a decision of `decision_type`
    pub fn apply_to(&self, decision_type: DecisionType, output: &Value) -> Value {
        let mut out = match output {
            Value::Object(map) => Value::Object(map.clone()),
            _ => serde_json::json!({}),
        };
        let field = decision_type.output_field();
        match self {
            RuleAction::Assign { value } => out[field] = Value::String(value.clone()),
            RuleAction::Suppress => {
                out[field] = Value::Null;
                out["suppressed"] = Value::Bool(true);
            }
        }
        out
    }
}

/// Case- and punctuation-insensitive form of a label
pub fn normalize_label(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A condition → action heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedRule {
    pub id: String,
    pub owner: String,
    pub rule_type: DecisionType,
    pub condition: RuleCondition,
    pub action: RuleAction,
    pub confidence: f64,
    pub times_applied: i64,
    pub times_overridden: i64,
    /// Distinct documents whose corrections minted the rule
    pub support: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl LearnedRule {
    /// Derived accuracy, undefined before the first application or override
    pub fn accuracy(&self) -> Option<f64> {
        self.state().accuracy()
    }

    pub fn state(&self) -> RuleState {
        RuleState {
            confidence: self.confidence,
            times_applied: self.times_applied,
            times_overridden: self.times_overridden,
        }
    }
}

/// A rule's trust counters at one point in time
///
/// Stored on every autonomous decision as the state the strategy gate saw
/// when it admitted the rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RuleState {
    pub confidence: f64,
    pub times_applied: i64,
    pub times_overridden: i64,
}

impl RuleState {
    pub fn accuracy(&self) -> Option<f64> {
        let total = self.times_applied + self.times_overridden;
        if total > 0 {
            Some(self.times_applied as f64 / total as f64)
        } else {
            None
        }
    }
}

/// Canonical concept learned from concept edits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyTerm {
    pub id: String,
    pub owner: String,
    pub canonical_name: String,
    pub category: Option<String>,
    pub variants: BTreeSet<String>,
    pub always_include: bool,
    pub never_include: bool,
    pub times_seen: i64,
    pub times_kept: i64,
    pub times_removed: i64,
}

impl VocabularyTerm {
    pub fn kept_ratio(&self) -> Option<f64> {
        if self.times_seen > 0 {
            Some(self.times_kept as f64 / self.times_seen as f64)
        } else {
            None
        }
    }
}

/// Per-owner confidence triple
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceThresholds {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl ConfidenceThresholds {
    pub fn is_ordered(&self) -> bool {
        self.high > self.medium && self.medium > self.low
    }

    pub fn band(&self, confidence: f64) -> ConfidenceBand {
        if confidence >= self.high {
            ConfidenceBand::High
        } else if confidence >= self.medium {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

/// Per-owner learning summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningProfile {
    pub owner: String,
    pub accuracy_rate: Option<f64>,
    pub confidence_threshold: f64,
    pub last_learning_run: Option<DateTime<Utc>>,
    pub total_learning_runs: i64,
}

/// Learning Agent risk posture
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Conservative, Strategy::Balanced, Strategy::Aggressive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Conservative => "conservative",
            Strategy::Balanced => "balanced",
            Strategy::Aggressive => "aggressive",
        }
    }

    pub fn promote(self) -> Strategy {
        match self {
            Strategy::Conservative => Strategy::Balanced,
            _ => Strategy::Aggressive,
        }
    }

    pub fn demote(self) -> Strategy {
        match self {
            Strategy::Aggressive => Strategy::Balanced,
            _ => Strategy::Conservative,
        }
    }
}

impl FromStr for Strategy {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LoopError::InvalidInput(format!("unknown strategy: {}", s)))
    }
}

/// Phase of the Learning Agent cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Observing,
    Deciding,
    Evaluating,
    Experimenting,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Observing => "observing",
            AgentMode::Deciding => "deciding",
            AgentMode::Evaluating => "evaluating",
            AgentMode::Experimenting => "experimenting",
        }
    }

    pub fn next(self) -> AgentMode {
        match self {
            AgentMode::Observing => AgentMode::Deciding,
            AgentMode::Deciding => AgentMode::Evaluating,
            AgentMode::Evaluating => AgentMode::Experimenting,
            AgentMode::Experimenting => AgentMode::Observing,
        }
    }
}

impl FromStr for AgentMode {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observing" => Ok(AgentMode::Observing),
            "deciding" => Ok(AgentMode::Deciding),
            "evaluating" => Ok(AgentMode::Evaluating),
            "experimenting" => Ok(AgentMode::Experimenting),
            other => Err(LoopError::InvalidInput(format!("unknown agent mode: {}", other))),
        }
    }
}

/// Hypothesis lifecycle
///
/// `pending → testing → {validated | rejected}`, `validated → applied`,
/// `pending → rejected`. Nothing moves backward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HypothesisStatus {
    Pending,
    Testing,
    Validated,
    Rejected,
    Applied,
}

impl HypothesisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HypothesisStatus::Pending => "pending",
            HypothesisStatus::Testing => "testing",
            HypothesisStatus::Validated => "validated",
            HypothesisStatus::Rejected => "rejected",
            HypothesisStatus::Applied => "applied",
        }
    }

    pub fn can_transition_to(&self, next: HypothesisStatus) -> bool {
        use HypothesisStatus::*;
        matches!(
            (self, next),
            (Pending, Testing)
                | (Pending, Rejected)
                | (Testing, Validated)
                | (Testing, Rejected)
                | (Validated, Applied)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HypothesisStatus::Rejected | HypothesisStatus::Applied)
    }
}

impl fmt::Display for HypothesisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HypothesisStatus {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HypothesisStatus::Pending),
            "testing" => Ok(HypothesisStatus::Testing),
            "validated" => Ok(HypothesisStatus::Validated),
            "rejected" => Ok(HypothesisStatus::Rejected),
            "applied" => Ok(HypothesisStatus::Applied),
            other => Err(LoopError::InvalidInput(format!(
                "unknown hypothesis status: {}",
                other
            ))),
        }
    }
}

/// Metric a hypothesis is judged on, with its sign convention
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TargetMetric {
    /// Higher is better
    AcceptanceRate,
    /// Lower is better
    OverrideRate,
}

impl TargetMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMetric::AcceptanceRate => "acceptance-rate",
            TargetMetric::OverrideRate => "override-rate",
        }
    }

    /// Improvement of `treatment` over `baseline` under this metric's sign
    pub fn improvement(&self, baseline: f64, treatment: f64) -> f64 {
        match self {
            TargetMetric::AcceptanceRate => treatment - baseline,
            TargetMetric::OverrideRate => baseline - treatment,
        }
    }
}

impl FromStr for TargetMetric {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acceptance-rate" => Ok(TargetMetric::AcceptanceRate),
            "override-rate" => Ok(TargetMetric::OverrideRate),
            other => Err(LoopError::InvalidInput(format!("unknown target metric: {}", other))),
        }
    }
}

/// The concrete change a hypothesis proposes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "category", rename_all = "kebab-case")]
pub enum HypothesisChange {
    /// Move the owner's `high` threshold
    ThresholdShift { current_high: f64, candidate_high: f64 },
    /// Deactivate a rule believed to do more harm than good
    RetireRule { rule_id: String },
}

impl HypothesisChange {
    pub fn category(&self) -> HypothesisCategory {
        match self {
            HypothesisChange::ThresholdShift { .. } => HypothesisCategory::ThresholdShift,
            HypothesisChange::RetireRule { .. } => HypothesisCategory::RetireRule,
        }
    }

    /// Two changes target the same knob
    pub fn same_target(&self, other: &HypothesisChange) -> bool {
        match (self, other) {
            (HypothesisChange::ThresholdShift { .. }, HypothesisChange::ThresholdShift { .. }) => true,
            (HypothesisChange::RetireRule { rule_id: a }, HypothesisChange::RetireRule { rule_id: b }) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum HypothesisCategory {
    ThresholdShift,
    RetireRule,
}

impl HypothesisCategory {
    pub const ALL: [HypothesisCategory; 2] =
        [HypothesisCategory::ThresholdShift, HypothesisCategory::RetireRule];

    pub fn as_str(&self) -> &'static str {
        match self {
            HypothesisCategory::ThresholdShift => "threshold-shift",
            HypothesisCategory::RetireRule => "retire-rule",
        }
    }

    pub fn target_metric(&self) -> TargetMetric {
        match self {
            HypothesisCategory::ThresholdShift => TargetMetric::AcceptanceRate,
            HypothesisCategory::RetireRule => TargetMetric::OverrideRate,
        }
    }

    /// How the candidate is exposed during the observation window
    pub fn test_policy(&self) -> TestPolicy {
        match self {
            HypothesisCategory::ThresholdShift => TestPolicy::Shadow,
            HypothesisCategory::RetireRule => TestPolicy::Sampled,
        }
    }
}

impl FromStr for HypothesisCategory {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HypothesisCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| LoopError::InvalidInput(format!("unknown hypothesis category: {}", s)))
    }
}

/// Per-category test exposure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestPolicy {
    /// Control and candidate judged on the same decisions
    Shadow,
    /// Candidate runs on a deterministic slice
    Sampled,
}

/// Measured value of a target metric
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricSnapshot {
    pub value: f64,
    pub sample_size: usize,
}

/// A proposed, testable change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub owner: String,
    pub category: HypothesisCategory,
    pub description: String,
    pub target_metric: TargetMetric,
    pub reasoning: String,
    pub expected_improvement: f64,
    pub status: HypothesisStatus,
    pub change: HypothesisChange,
    /// Treatment slice fixed when a sampled test starts
    pub split_ratio: Option<f64>,
    pub baseline_metrics: Option<MetricSnapshot>,
    pub post_metrics: Option<Value>,
    pub improvement_score: Option<f64>,
    pub conclusion_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub test_start: Option<DateTime<Utc>>,
    pub concluded_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decision_type_round_trips_through_str() {
        for t in DecisionType::ALL {
            assert_eq!(t.as_str().parse::<DecisionType>().unwrap(), t);
        }
        assert!("summarize".parse::<DecisionType>().is_err());
    }

    #[test]
    fn test_option_sets_are_fixed_per_type() {
        let ids: Vec<String> = DecisionType::ConceptExtraction
            .options()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["accept", "edit", "reject"]);
        assert_eq!(DecisionType::DuplicateMerge.options().len(), 2);
    }

    #[test]
    fn test_primary_value_extraction() {
        let t = DecisionType::ClusterAssignment;
        assert_eq!(t.primary_value(&json!({"cluster": "Finance"})), Some("Finance".into()));
        assert_eq!(t.primary_value(&json!("Finance")), Some("Finance".into()));
        assert_eq!(t.primary_value(&json!({"other": 1})), None);
        assert_eq!(
            DecisionType::ConceptExtraction.concepts(&json!({"concepts": ["Rust", " AI "]})),
            vec!["Rust".to_string(), "AI".to_string()]
        );
    }

    #[test]
    fn test_normalize_label_ignores_case_and_punctuation() {
        assert_eq!(normalize_label("Machine-Learning!"), "machine learning");
        assert_eq!(normalize_label("  Deep   Learning "), "deep learning");
        assert_eq!(normalize_label("deep learning"), normalize_label("Deep Learning."));
    }

    #[test]
    fn test_rule_accuracy_is_derived() {
        let mut rule = LearnedRule {
            id: "r".into(),
            owner: "o".into(),
            rule_type: DecisionType::ClusterAssignment,
            condition: RuleCondition {
                decision_type: DecisionType::ClusterAssignment,
                knowledge_base: None,
                original_value: "Misc".into(),
            },
            action: RuleAction::Assign { value: "Finance".into() },
            confidence: 0.7,
            times_applied: 0,
            times_overridden: 0,
            support: 3,
            active: true,
            created_at: Utc::now(),
        };
        assert_eq!(rule.accuracy(), None);
        rule.times_applied = 3;
        rule.times_overridden = 1;
        assert_eq!(rule.accuracy(), Some(0.75));
    }

    #[test]
    fn test_rule_condition_knowledge_base_wildcard() {
        let cond = RuleCondition {
            decision_type: DecisionType::ClusterAssignment,
            knowledge_base: None,
            original_value: "misc".into(),
        };
        let sig = RuleCondition {
            decision_type: DecisionType::ClusterAssignment,
            knowledge_base: Some("kb1".into()),
            original_value: "Misc".into(),
        };
        assert!(cond.matches(&sig));

        let scoped = RuleCondition { knowledge_base: Some("kb2".into()), ..cond };
        assert!(!scoped.matches(&sig));
    }

    #[test]
    fn test_rule_action_apply_to() {
        let out = RuleAction::Assign { value: "Finance".into() }
            .apply_to(DecisionType::ClusterAssignment, &json!({"cluster": "Misc", "score": 1}));
        assert_eq!(out["cluster"], "Finance");
        assert_eq!(out["score"], 1);

        let out = RuleAction::Suppress.apply_to(DecisionType::DuplicateMerge, &json!({"merge_with": "d2"}));
        assert!(out["merge_with"].is_null());
        assert_eq!(out["suppressed"], true);
    }

    #[test]
    fn test_hypothesis_transitions_are_monotonic() {
        use HypothesisStatus::*;
        assert!(Pending.can_transition_to(Testing));
        assert!(Testing.can_transition_to(Validated));
        assert!(Validated.can_transition_to(Applied));
        assert!(!Applied.can_transition_to(Pending));
        assert!(!Validated.can_transition_to(Testing));
        assert!(!Pending.can_transition_to(Applied));
        assert!(!Pending.can_transition_to(Validated));
        for next in [Pending, Testing, Validated, Applied, Rejected] {
            assert!(!Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn test_strategy_promotion_is_capped() {
        assert_eq!(Strategy::Aggressive.promote(), Strategy::Aggressive);
        assert_eq!(Strategy::Conservative.demote(), Strategy::Conservative);
        assert_eq!(Strategy::Balanced.promote(), Strategy::Aggressive);
        assert_eq!(Strategy::Balanced.demote(), Strategy::Conservative);
    }

    #[test]
    fn test_target_metric_sign_convention() {
        assert!((TargetMetric::AcceptanceRate.improvement(0.8, 0.9) - 0.1).abs() < 1e-9);
        assert!((TargetMetric::OverrideRate.improvement(0.3, 0.1) - 0.2).abs() < 1e-9);
    }
}
