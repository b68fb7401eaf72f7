//! Core data model for the proposal pipeline
//!
//! Evidence, need patterns, workflow proposals, and review events.
//! Evidence rows are immutable; patterns are mutable aggregates; review
//! events are append-only.

use crate::error::AppError;
use crate::pipeline::graph::WorkflowGraph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant identifier, issued by the external identity layer.
pub type TenantId = String;

// =============================================================================
// EVIDENCE
// =============================================================================

/// The fixed enumeration of observable dissatisfaction signals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    WorkflowFailure,
    NegativeFeedback,
    ManualOverride,
    RegenerationRequest,
    SessionAbandonment,
    LowConfidenceCompletion,
    ExplicitRequest,
}

impl EvidenceType {
    pub const ALL: [EvidenceType; 7] = [
        EvidenceType::WorkflowFailure,
        EvidenceType::NegativeFeedback,
        EvidenceType::ManualOverride,
        EvidenceType::RegenerationRequest,
        EvidenceType::SessionAbandonment,
        EvidenceType::LowConfidenceCompletion,
        EvidenceType::ExplicitRequest,
    ];

    /// Parse a wire-format evidence type, rejecting anything outside the
    /// enumeration.
    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "workflow_failure" => Ok(EvidenceType::WorkflowFailure),
            "negative_feedback" => Ok(EvidenceType::NegativeFeedback),
            "manual_override" => Ok(EvidenceType::ManualOverride),
            "regeneration_request" => Ok(EvidenceType::RegenerationRequest),
            "session_abandonment" => Ok(EvidenceType::SessionAbandonment),
            "low_confidence_completion" => Ok(EvidenceType::LowConfidenceCompletion),
            "explicit_request" => Ok(EvidenceType::ExplicitRequest),
            other => Err(AppError::InvalidEvidenceType(format!(
                "'{}' is not a recognized evidence type",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::WorkflowFailure => "workflow_failure",
            EvidenceType::NegativeFeedback => "negative_feedback",
            EvidenceType::ManualOverride => "manual_override",
            EvidenceType::RegenerationRequest => "regeneration_request",
            EvidenceType::SessionAbandonment => "session_abandonment",
            EvidenceType::LowConfidenceCompletion => "low_confidence_completion",
            EvidenceType::ExplicitRequest => "explicit_request",
        }
    }
}

/// Free-text context accompanying an evidence submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceContext {
    /// The request the user originally made.
    pub original_request: String,
    /// Why the existing workflow failed to serve it, if known.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// The workflow that failed or was overridden.
    #[serde(default)]
    pub failed_workflow_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
}

/// An immutable record of one incident. Created once, never mutated,
/// owned by the pattern it is attributed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub pattern_id: Uuid,
    pub evidence_type: EvidenceType,
    /// Tenant-configured weight at time of capture.
    pub weight: f64,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub original_request: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub captured_at: DateTime<Utc>,
}

// =============================================================================
// NEED PATTERNS
// =============================================================================

/// Rule-classified intent of a need signature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Research,
    Analysis,
    Creation,
    Verification,
    Automation,
    General,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::Research => "research",
            IntentCategory::Analysis => "analysis",
            IntentCategory::Creation => "creation",
            IntentCategory::Verification => "verification",
            IntentCategory::Automation => "automation",
            IntentCategory::General => "general",
        }
    }

    /// Intents that conventionally demand a verification step.
    pub fn demands_verification(&self) -> bool {
        matches!(self, IntentCategory::Verification | IntentCategory::Research)
    }

    /// Generative intents get a bounded iteration/quality loop.
    pub fn is_generative(&self) -> bool {
        matches!(self, IntentCategory::Creation | IntentCategory::Analysis)
    }
}

/// Domain hint extracted from free text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DomainHint {
    Medical,
    Legal,
    Financial,
    Technology,
    Education,
    Commerce,
}

impl DomainHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainHint::Medical => "medical",
            DomainHint::Legal => "legal",
            DomainHint::Financial => "financial",
            DomainHint::Technology => "technology",
            DomainHint::Education => "education",
            DomainHint::Commerce => "commerce",
        }
    }

    /// Domains whose proposals attract compliance scrutiny.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            DomainHint::Medical | DomainHint::Legal | DomainHint::Financial
        )
    }
}

/// Normalized signature a pattern is keyed by.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternSignature {
    pub intent: IntentCategory,
    /// Stop-word-filtered keywords, capped at extraction time.
    pub keywords: Vec<String>,
    pub domains: Vec<DomainHint>,
    /// Which existing workflows failed to serve this need.
    pub gap_markers: Vec<String>,
}

/// Lifecycle of a need pattern. Terminal state is `resolved`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Accumulating,
    ThresholdMet,
    ProposalGenerating,
    ProposalGenerated,
    Resolved,
}

/// A mutable aggregate of deduplicated evidence sharing one signature.
///
/// Mutated only by the evidence store (aggregate increments) and the
/// scheduler/synthesizer (status transitions). Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeedPattern {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub signature: PatternSignature,
    /// Exact-match key: deterministic hash of the normalized signature.
    pub content_hash: String,
    /// Similarity-match key.
    pub embedding: Vec<f32>,
    pub evidence_count: u32,
    pub distinct_users: u32,
    pub cumulative_score: f64,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    /// Monotone non-decreasing until a proposal is generated or declined.
    pub occurrence_met: bool,
    pub impact_met: bool,
    /// Set only during synthesis; never evaluated at ingestion time.
    pub confidence_met: bool,
    pub status: PatternStatus,
    /// The one non-declined, non-resolved proposal, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_proposal_id: Option<Uuid>,
}

// =============================================================================
// WORKFLOW PROPOSALS
// =============================================================================

/// Admin-facing proposal lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Awaiting the automated risk governor.
    PendingBrain,
    /// Awaiting a human reviewer.
    PendingAdmin,
    Testing,
    Approved,
    Declined,
    Published,
}

impl ProposalStatus {
    /// A proposal still occupying its pattern's active slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, ProposalStatus::Declined)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityBucket {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Four-axis risk assessment attached by the governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub cost_risk: f64,
    pub latency_risk: f64,
    pub quality_risk: f64,
    pub compliance_risk: f64,
    /// Weighted sum of the four axes.
    pub overall_risk: f64,
    pub factors: Vec<RiskFactor>,
    pub mitigations: Vec<String>,
    pub assessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactor {
    pub code: String,
    pub description: String,
    pub severity: RiskSeverity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A cheaper or more thorough sketch emitted alongside the main draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternativeSketch {
    pub name: String,
    pub summary: String,
    pub confidence: f64,
    pub tradeoff: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Aggregated sandbox test results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub total_runs: u32,
    pub passed_runs: u32,
    pub failed_runs: u32,
    pub pass_rate: f64,
    pub avg_latency_ms: f64,
    pub avg_quality: f64,
    pub completed_at: DateTime<Utc>,
}

/// A synthesized candidate workflow awaiting governance and review.
///
/// One proposal belongs to exactly one pattern; a pattern accumulates
/// historical proposals when earlier ones are declined and a later one is
/// regenerated after cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProposal {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub pattern_id: Uuid,
    pub name: String,
    pub description: String,
    pub graph: WorkflowGraph,
    pub complexity: ComplexityBucket,
    /// Synthesizer confidence, reconciled with coverage.
    pub confidence: f64,
    /// Estimated fraction of the evidence the graph addresses.
    pub coverage: f64,
    pub reasoning: String,
    pub alternatives: Vec<AlternativeSketch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub suggested_modifications: Vec<String>,
    pub status: ProposalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_summary: Option<TestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// REVIEW EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewActor {
    Governor,
    Admin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    /// Governor forwarded the proposal to human review.
    Forward,
    Approve,
    Decline,
    RequestTest,
    Modify,
    TestCompleted,
    Publish,
}

/// Append-only audit record of one proposal state transition.
/// Never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub proposal_id: Uuid,
    pub pattern_id: Uuid,
    pub actor: ReviewActor,
    pub action: ReviewAction,
    pub previous_status: ProposalStatus,
    pub new_status: ProposalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub modifications: Vec<String>,
    pub reviewed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_type_parse_roundtrip() {
        for et in EvidenceType::ALL {
            assert_eq!(EvidenceType::parse(et.as_str()).unwrap(), et);
        }
    }

    #[test]
    fn test_evidence_type_parse_rejects_unknown() {
        let err = EvidenceType::parse("telepathy").unwrap_err();
        assert!(matches!(err, AppError::InvalidEvidenceType(_)));
    }

    #[test]
    fn test_declined_proposal_is_not_active() {
        assert!(!ProposalStatus::Declined.is_active());
        assert!(ProposalStatus::PendingBrain.is_active());
        assert!(ProposalStatus::Published.is_active());
    }

    #[test]
    fn test_sensitive_domains() {
        assert!(DomainHint::Medical.is_sensitive());
        assert!(DomainHint::Legal.is_sensitive());
        assert!(DomainHint::Financial.is_sensitive());
        assert!(!DomainHint::Technology.is_sensitive());
    }
}
