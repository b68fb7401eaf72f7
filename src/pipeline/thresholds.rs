//! Tenant threshold configuration and the pure threshold evaluator
//!
//! The evaluator is side-effect-free: given a pattern's aggregates and a
//! tenant's configuration it returns the three gate flags. Confidence is
//! supplied externally by the synthesizer since it cannot be known before
//! a candidate solution exists.

use crate::pipeline::types::EvidenceType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-tenant pipeline thresholds. Exactly one active config per tenant;
/// defaults apply until overridden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdConfig {
    pub min_evidence_count: u32,
    pub min_unique_users: u32,
    pub min_time_span_hours: i64,
    /// Evidence spread wider than this is considered stale and does not
    /// qualify the occurrence gate.
    pub max_time_span_days: i64,
    pub min_total_evidence_score: f64,
    /// Governor floor: proposals below this synthesizer confidence are
    /// vetoed.
    pub min_synthesis_confidence: f64,
    /// Floor for the reconciled confidence/coverage estimate.
    pub min_coverage_estimate: f64,
    pub max_cost_risk: f64,
    pub max_latency_risk: f64,
    pub max_quality_risk: f64,
    pub max_compliance_risk: f64,
    /// Soft threshold above which the governor attaches non-binding
    /// suggested modifications.
    pub suggestion_risk_threshold: f64,
    pub max_daily_proposals: u32,
    pub max_weekly_proposals: u32,
    pub decline_cooldown_hours: i64,
    /// Synthesis node budget, including reserved input/output slots.
    pub max_graph_nodes: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_evidence_count: 5,
            min_unique_users: 3,
            min_time_span_hours: 24,
            max_time_span_days: 90,
            min_total_evidence_score: 0.60,
            min_synthesis_confidence: 0.6,
            min_coverage_estimate: 0.6,
            max_cost_risk: 0.7,
            max_latency_risk: 0.7,
            max_quality_risk: 0.75,
            max_compliance_risk: 0.6,
            suggestion_risk_threshold: 0.5,
            max_daily_proposals: 3,
            max_weekly_proposals: 10,
            decline_cooldown_hours: 72,
            max_graph_nodes: 10,
        }
    }
}

impl ThresholdConfig {
    pub fn decline_cooldown(&self) -> Duration {
        Duration::hours(self.decline_cooldown_hours)
    }
}

/// Per-evidence-type capture weights.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceWeightConfig {
    pub weights: HashMap<EvidenceType, f64>,
}

impl Default for EvidenceWeightConfig {
    fn default() -> Self {
        let weights = [
            (EvidenceType::WorkflowFailure, 0.50),
            (EvidenceType::NegativeFeedback, 0.35),
            (EvidenceType::ManualOverride, 0.40),
            (EvidenceType::RegenerationRequest, 0.30),
            (EvidenceType::SessionAbandonment, 0.25),
            (EvidenceType::LowConfidenceCompletion, 0.20),
            (EvidenceType::ExplicitRequest, 0.60),
        ]
        .into_iter()
        .collect();
        Self { weights }
    }
}

impl EvidenceWeightConfig {
    /// Weight for an evidence type, falling back to the built-in default
    /// map when the tenant left a type unconfigured.
    pub fn weight_for(&self, evidence_type: EvidenceType) -> f64 {
        if let Some(w) = self.weights.get(&evidence_type) {
            return *w;
        }
        *EvidenceWeightConfig::default()
            .weights
            .get(&evidence_type)
            .unwrap_or(&0.25)
    }
}

/// The full per-tenant configuration record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    pub thresholds: ThresholdConfig,
    pub weights: EvidenceWeightConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Aggregates the evaluator reads; a projection of `NeedPattern`.
#[derive(Debug, Clone, Copy)]
pub struct PatternAggregates {
    pub evidence_count: u32,
    pub distinct_users: u32,
    pub cumulative_score: f64,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
}

/// The three gate flags plus their conjunction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdFlags {
    pub occurrence: bool,
    pub impact: bool,
    pub confidence: bool,
    pub all_met: bool,
}

/// Evaluate the occurrence/impact/confidence gates.
///
/// `confidence` is `None` before synthesis has produced an estimate.
pub fn evaluate(
    aggregates: &PatternAggregates,
    confidence: Option<f64>,
    config: &ThresholdConfig,
) -> ThresholdFlags {
    let span = aggregates.last_occurrence - aggregates.first_occurrence;

    let occurrence = aggregates.evidence_count >= config.min_evidence_count
        && aggregates.distinct_users >= config.min_unique_users
        && span >= Duration::hours(config.min_time_span_hours)
        && span <= Duration::days(config.max_time_span_days);

    let impact = aggregates.cumulative_score >= config.min_total_evidence_score;

    let confidence_met =
        confidence.map_or(false, |c| c >= config.min_synthesis_confidence);

    ThresholdFlags {
        occurrence,
        impact,
        confidence: confidence_met,
        all_met: occurrence && impact && confidence_met,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn aggregates(count: u32, users: u32, score: f64, span_hours: i64) -> PatternAggregates {
        let first = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        PatternAggregates {
            evidence_count: count,
            distinct_users: users,
            cumulative_score: score,
            first_occurrence: first,
            last_occurrence: first + Duration::hours(span_hours),
        }
    }

    #[test]
    fn test_default_scenario_crosses_both_gates() {
        // 5 negative_feedback events (weight 0.35) from 3 users over 30h.
        let config = ThresholdConfig::default();
        let flags = evaluate(&aggregates(5, 3, 1.75, 30), None, &config);
        assert!(flags.occurrence);
        assert!(flags.impact);
        assert!(!flags.confidence);
        assert!(!flags.all_met);
    }

    #[test]
    fn test_occurrence_requires_all_three_conditions() {
        let config = ThresholdConfig::default();
        assert!(!evaluate(&aggregates(4, 3, 1.75, 30), None, &config).occurrence);
        assert!(!evaluate(&aggregates(5, 2, 1.75, 30), None, &config).occurrence);
        assert!(!evaluate(&aggregates(5, 3, 1.75, 23), None, &config).occurrence);
    }

    #[test]
    fn test_stale_span_disqualifies_occurrence() {
        let config = ThresholdConfig::default();
        let flags = evaluate(&aggregates(5, 3, 1.75, 91 * 24), None, &config);
        assert!(!flags.occurrence);
    }

    #[test]
    fn test_impact_gate() {
        let config = ThresholdConfig::default();
        assert!(!evaluate(&aggregates(5, 3, 0.59, 30), None, &config).impact);
        assert!(evaluate(&aggregates(5, 3, 0.60, 30), None, &config).impact);
    }

    #[test]
    fn test_confidence_supplied_externally() {
        let config = ThresholdConfig::default();
        let flags = evaluate(&aggregates(5, 3, 1.75, 30), Some(0.72), &config);
        assert!(flags.confidence);
        assert!(flags.all_met);

        let flags = evaluate(&aggregates(5, 3, 1.75, 30), Some(0.55), &config);
        assert!(!flags.confidence);
    }

    #[test]
    fn test_weight_fallback_to_default_map() {
        let mut config = EvidenceWeightConfig {
            weights: HashMap::new(),
        };
        assert_eq!(config.weight_for(EvidenceType::NegativeFeedback), 0.35);

        config.weights.insert(EvidenceType::NegativeFeedback, 0.9);
        assert_eq!(config.weight_for(EvidenceType::NegativeFeedback), 0.9);
        assert_eq!(config.weight_for(EvidenceType::WorkflowFailure), 0.50);
    }
}
