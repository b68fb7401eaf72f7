//! Risk governor
//!
//! The automated gate between synthesis and human review. Scores every
//! proposal along four independent risk axes, applies the tenant's veto
//! ceilings in a fixed priority order (first match wins), and either
//! vetoes the proposal or forwards it to the human queue with a computed
//! priority and optional non-binding suggestions.

use crate::pipeline::graph::NodeType;
use crate::pipeline::thresholds::ThresholdConfig;
use crate::pipeline::types::{
    NeedPattern, Priority, RiskAssessment, RiskFactor, RiskSeverity, WorkflowProposal,
};
use chrono::Utc;

/// Axis weights for the overall risk score.
const COST_WEIGHT: f64 = 0.25;
const LATENCY_WEIGHT: f64 = 0.25;
const QUALITY_WEIGHT: f64 = 0.30;
const COMPLIANCE_WEIGHT: f64 = 0.20;

/// Similarity above which a proposal duplicates an existing workflow.
pub const DUPLICATE_SIMILARITY_THRESHOLD: f32 = 0.85;

/// Context the governor needs beyond the proposal itself.
#[derive(Debug, Clone, Default)]
pub struct GovernorContext {
    /// Best-matching existing catalog workflow: (name, similarity).
    pub nearest_workflow: Option<(String, f32)>,
    /// Tenant proposal counts, excluding the proposal under assessment.
    pub proposals_today: u32,
    pub proposals_this_week: u32,
}

/// Outcome of a governor pass.
#[derive(Debug, Clone)]
pub enum GovernorDecision {
    Veto {
        reason: String,
        assessment: RiskAssessment,
    },
    Forward {
        priority: Priority,
        suggestions: Vec<String>,
        assessment: RiskAssessment,
    },
}

pub struct RiskGovernor;

impl RiskGovernor {
    /// Score the four risk axes and derive the weighted overall risk.
    pub fn assess(proposal: &WorkflowProposal, pattern: &NeedPattern) -> RiskAssessment {
        let mut factors = Vec::new();
        let mut mitigations = Vec::new();

        let cost_risk = Self::cost_risk(proposal, &mut factors);
        let latency_risk = Self::latency_risk(proposal, &mut factors);
        let quality_risk = Self::quality_risk(proposal, &mut factors, &mut mitigations);
        let compliance_risk = Self::compliance_risk(proposal, pattern, &mut factors);

        let overall_risk = COST_WEIGHT * cost_risk
            + LATENCY_WEIGHT * latency_risk
            + QUALITY_WEIGHT * quality_risk
            + COMPLIANCE_WEIGHT * compliance_risk;

        RiskAssessment {
            cost_risk,
            latency_risk,
            quality_risk,
            compliance_risk,
            overall_risk,
            factors,
            mitigations,
            assessed_at: Utc::now(),
        }
    }

    /// Full governor decision: assessment, then the ordered veto chain,
    /// then priority and suggestions for forwarded proposals.
    pub fn decide(
        proposal: &WorkflowProposal,
        pattern: &NeedPattern,
        config: &ThresholdConfig,
        context: &GovernorContext,
    ) -> GovernorDecision {
        let assessment = Self::assess(proposal, pattern);

        // Veto triggers, evaluated in fixed priority order; the first
        // violation wins and short-circuits.
        if assessment.cost_risk > config.max_cost_risk {
            return GovernorDecision::Veto {
                reason: format!(
                    "cost risk {:.2} exceeds tenant ceiling {:.2}",
                    assessment.cost_risk, config.max_cost_risk
                ),
                assessment,
            };
        }
        if assessment.latency_risk > config.max_latency_risk {
            return GovernorDecision::Veto {
                reason: format!(
                    "latency risk {:.2} exceeds tenant ceiling {:.2}",
                    assessment.latency_risk, config.max_latency_risk
                ),
                assessment,
            };
        }
        if proposal.confidence < config.min_synthesis_confidence {
            return GovernorDecision::Veto {
                reason: format!(
                    "synthesizer confidence {:.2} below tenant floor {:.2}",
                    proposal.confidence, config.min_synthesis_confidence
                ),
                assessment,
            };
        }
        if assessment.compliance_risk > config.max_compliance_risk {
            return GovernorDecision::Veto {
                reason: format!(
                    "compliance risk {:.2} exceeds tenant ceiling {:.2}",
                    assessment.compliance_risk, config.max_compliance_risk
                ),
                assessment,
            };
        }
        if let Some((name, similarity)) = &context.nearest_workflow {
            if *similarity > DUPLICATE_SIMILARITY_THRESHOLD {
                return GovernorDecision::Veto {
                    reason: format!(
                        "near-duplicate of existing workflow '{}' (similarity {:.2})",
                        name, similarity
                    ),
                    assessment,
                };
            }
        }
        if context.proposals_today >= config.max_daily_proposals
            || context.proposals_this_week >= config.max_weekly_proposals
        {
            return GovernorDecision::Veto {
                reason: format!(
                    "tenant proposal cap exhausted ({} today, {} this week)",
                    context.proposals_today, context.proposals_this_week
                ),
                assessment,
            };
        }

        let priority = Self::priority(pattern);
        let suggestions = if assessment.overall_risk > config.suggestion_risk_threshold {
            Self::suggest_modifications(proposal, &assessment, config)
        } else {
            Vec::new()
        };

        GovernorDecision::Forward {
            priority,
            suggestions,
            assessment,
        }
    }

    // =========================================================================
    // RISK AXES
    // =========================================================================

    /// Cost risk: bracketed by estimated cost per 1000 uses, node count,
    /// and distinct model count.
    fn cost_risk(proposal: &WorkflowProposal, factors: &mut Vec<RiskFactor>) -> f64 {
        let cost = proposal.graph.metadata.estimated_cost_per_1k;
        let cost_component: f64 = match cost {
            c if c < 5.0 => 0.05,
            c if c < 10.0 => 0.15,
            c if c < 20.0 => 0.30,
            c if c < 40.0 => 0.50,
            _ => 0.65,
        };
        if cost_component >= 0.30 {
            factors.push(RiskFactor {
                code: "HIGH_COST_ESTIMATE".to_string(),
                description: format!("Estimated cost of {:.1} credits per 1000 uses", cost),
                severity: if cost_component >= 0.50 {
                    RiskSeverity::High
                } else {
                    RiskSeverity::Medium
                },
            });
        }

        let nodes = proposal.graph.node_count();
        let node_component = match nodes {
            0..=4 => 0.02,
            5..=7 => 0.08,
            8..=10 => 0.15,
            _ => 0.25,
        };
        if node_component >= 0.15 {
            factors.push(RiskFactor {
                code: "LARGE_GRAPH".to_string(),
                description: format!("{} nodes in the proposed graph", nodes),
                severity: RiskSeverity::Medium,
            });
        }

        let models = proposal.graph.distinct_model_count();
        let model_component = match models {
            0 | 1 => 0.0,
            2 => 0.05,
            _ => 0.12,
        };

        (cost_component + node_component + model_component).clamp(0.0, 1.0)
    }

    /// Latency risk: bracketed by the latency estimate, with a penalty
    /// for long chains that have no parallel fan-out.
    fn latency_risk(proposal: &WorkflowProposal, factors: &mut Vec<RiskFactor>) -> f64 {
        let latency = proposal.graph.metadata.estimated_latency_ms;
        let mut risk: f64 = match latency {
            l if l < 8_000 => 0.05,
            l if l < 15_000 => 0.20,
            l if l < 30_000 => 0.40,
            l if l < 60_000 => 0.60,
            _ => 0.80,
        };

        if !proposal.graph.has_parallel_fanout() {
            let nodes = proposal.graph.node_count();
            if nodes > 6 {
                risk += 0.20;
                factors.push(RiskFactor {
                    code: "LONG_SEQUENTIAL_CHAIN".to_string(),
                    description: format!("{} nodes execute strictly in sequence", nodes),
                    severity: RiskSeverity::Medium,
                });
            } else if nodes > 4 {
                risk += 0.10;
            }
        }

        if latency >= 30_000 {
            factors.push(RiskFactor {
                code: "HIGH_LATENCY_ESTIMATE".to_string(),
                description: format!("Estimated end-to-end latency {}ms", latency),
                severity: RiskSeverity::High,
            });
        }

        risk.clamp(0.0, 1.0)
    }

    /// Quality risk: grows as confidence and coverage drop; a
    /// verification node buys it back down.
    fn quality_risk(
        proposal: &WorkflowProposal,
        factors: &mut Vec<RiskFactor>,
        mitigations: &mut Vec<String>,
    ) -> f64 {
        let mut risk = 0.5 * (1.0 - proposal.confidence) + 0.5 * (1.0 - proposal.coverage);

        if proposal.confidence < 0.7 {
            factors.push(RiskFactor {
                code: "LOW_SYNTHESIS_CONFIDENCE".to_string(),
                description: format!("Synthesizer confidence {:.2}", proposal.confidence),
                severity: RiskSeverity::Medium,
            });
        }
        if proposal.graph.contains_type(NodeType::Verification) {
            risk -= 0.15;
            mitigations.push("Verification node checks outputs before delivery".to_string());
        }

        risk.clamp(0.0, 1.0)
    }

    /// Compliance risk: each sensitive node type adds exposure, and
    /// proposals in sensitive domains add more.
    fn compliance_risk(
        proposal: &WorkflowProposal,
        pattern: &NeedPattern,
        factors: &mut Vec<RiskFactor>,
    ) -> f64 {
        let sensitive_nodes = proposal
            .graph
            .nodes
            .iter()
            .filter(|n| n.node_type.is_sensitive())
            .count();
        let mut risk = (sensitive_nodes as f64 * 0.2).min(0.6);
        if sensitive_nodes > 0 {
            factors.push(RiskFactor {
                code: "SENSITIVE_NODES".to_string(),
                description: format!(
                    "{} node(s) reach external services or export data",
                    sensitive_nodes
                ),
                severity: RiskSeverity::Medium,
            });
        }

        let sensitive_domain = pattern.signature.domains.iter().any(|d| d.is_sensitive());
        if sensitive_domain {
            risk += 0.3;
            factors.push(RiskFactor {
                code: "SENSITIVE_DOMAIN".to_string(),
                description: "Pattern falls in a regulated domain (medical/legal/financial)"
                    .to_string(),
                severity: RiskSeverity::High,
            });
        }

        risk.clamp(0.0, 1.0)
    }

    // =========================================================================
    // PRIORITY & SUGGESTIONS
    // =========================================================================

    /// Review priority from affected-user count and cumulative score.
    pub fn priority(pattern: &NeedPattern) -> Priority {
        let users = pattern.distinct_users;
        let score = pattern.cumulative_score;
        if users >= 25 || score >= 12.0 {
            Priority::Urgent
        } else if users >= 10 || score >= 6.0 {
            Priority::High
        } else if users >= 5 || score >= 2.5 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    /// Non-binding modification suggestions attached when overall risk
    /// crosses the soft threshold.
    fn suggest_modifications(
        proposal: &WorkflowProposal,
        assessment: &RiskAssessment,
        config: &ThresholdConfig,
    ) -> Vec<String> {
        let mut suggestions = Vec::new();
        if assessment.quality_risk > config.max_quality_risk
            || !proposal.graph.contains_type(NodeType::Verification)
        {
            suggestions.push("Add a verification node before the output stage".to_string());
        }
        if assessment.cost_risk >= 0.4 {
            suggestions.push("Pin expensive stages to a smaller model tier".to_string());
        }
        if assessment.latency_risk >= 0.4 && !proposal.graph.has_parallel_fanout() {
            suggestions.push("Parallelize independent retrieval stages".to_string());
        }
        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::{EntryStrategy, GraphBuilder, StructurePlan};
    use crate::pipeline::types::{
        ComplexityBucket, DomainHint, IntentCategory, PatternSignature, PatternStatus,
        ProposalStatus,
    };
    use uuid::Uuid;

    fn test_pattern(users: u32, score: f64, domains: Vec<DomainHint>) -> NeedPattern {
        let now = Utc::now();
        NeedPattern {
            id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            signature: PatternSignature {
                intent: IntentCategory::Research,
                keywords: vec!["pricing".into()],
                domains,
                gap_markers: vec![],
            },
            content_hash: "hash".to_string(),
            embedding: vec![],
            evidence_count: users * 2,
            distinct_users: users,
            cumulative_score: score,
            first_occurrence: now,
            last_occurrence: now,
            occurrence_met: true,
            impact_met: true,
            confidence_met: true,
            status: PatternStatus::ProposalGenerated,
            active_proposal_id: None,
        }
    }

    fn test_proposal(plan: StructurePlan, confidence: f64, coverage: f64) -> WorkflowProposal {
        let now = Utc::now();
        WorkflowProposal {
            id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            pattern_id: Uuid::new_v4(),
            name: "Test proposal".to_string(),
            description: String::new(),
            graph: GraphBuilder::build(&plan),
            complexity: ComplexityBucket::Moderate,
            confidence,
            coverage,
            reasoning: String::new(),
            alternatives: vec![],
            risk: None,
            priority: None,
            suggested_modifications: vec![],
            status: ProposalStatus::PendingBrain,
            test_status: None,
            test_summary: None,
            external_workflow_id: None,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn expensive_sensitive_plan() -> StructurePlan {
        StructurePlan {
            core_nodes: vec![
                NodeType::ExternalSearch,
                NodeType::ExternalSearch,
                NodeType::ExternalApi,
                NodeType::Analysis,
                NodeType::Reasoning,
                NodeType::Generation,
                NodeType::DataExport,
                NodeType::Formatter,
                NodeType::Reasoning,
            ],
            entry_strategy: EntryStrategy::Sequential,
            include_verification: false,
            include_refinement: true,
        }
    }

    #[test]
    fn test_veto_order_cost_before_compliance() {
        // This graph violates both the cost and compliance ceilings; the
        // recorded veto must cite cost, the first-checked axis.
        let proposal = test_proposal(expensive_sensitive_plan(), 0.8, 0.8);
        let pattern = test_pattern(10, 5.0, vec![DomainHint::Medical]);
        let mut config = ThresholdConfig::default();
        config.max_cost_risk = 0.30;
        config.max_compliance_risk = 0.30;
        config.max_latency_risk = 2.0; // out of the way

        let assessment = RiskGovernor::assess(&proposal, &pattern);
        assert!(assessment.cost_risk > 0.30);
        assert!(assessment.compliance_risk > 0.30);

        match RiskGovernor::decide(&proposal, &pattern, &config, &GovernorContext::default()) {
            GovernorDecision::Veto { reason, .. } => {
                assert!(reason.contains("cost risk"), "reason was: {}", reason)
            }
            GovernorDecision::Forward { .. } => panic!("expected a veto"),
        }
    }

    #[test]
    fn test_confidence_floor_veto() {
        let plan = StructurePlan {
            core_nodes: vec![NodeType::Reasoning],
            entry_strategy: EntryStrategy::Sequential,
            include_verification: true,
            include_refinement: false,
        };
        let proposal = test_proposal(plan, 0.55, 0.9);
        let pattern = test_pattern(5, 2.0, vec![]);
        let config = ThresholdConfig::default();

        match RiskGovernor::decide(&proposal, &pattern, &config, &GovernorContext::default()) {
            GovernorDecision::Veto { reason, .. } => assert!(reason.contains("confidence")),
            GovernorDecision::Forward { .. } => panic!("expected a veto"),
        }
    }

    #[test]
    fn test_duplicate_detection_veto() {
        let plan = StructurePlan {
            core_nodes: vec![NodeType::Reasoning],
            entry_strategy: EntryStrategy::Sequential,
            include_verification: true,
            include_refinement: false,
        };
        let proposal = test_proposal(plan, 0.85, 0.9);
        let pattern = test_pattern(5, 2.0, vec![]);
        let config = ThresholdConfig::default();
        let context = GovernorContext {
            nearest_workflow: Some(("Competitor research".to_string(), 0.91)),
            ..Default::default()
        };

        match RiskGovernor::decide(&proposal, &pattern, &config, &context) {
            GovernorDecision::Veto { reason, .. } => assert!(reason.contains("near-duplicate")),
            GovernorDecision::Forward { .. } => panic!("expected a veto"),
        }
    }

    #[test]
    fn test_rate_cap_backstop_is_checked_last() {
        let plan = StructurePlan {
            core_nodes: vec![NodeType::Reasoning],
            entry_strategy: EntryStrategy::Sequential,
            include_verification: true,
            include_refinement: false,
        };
        let proposal = test_proposal(plan, 0.85, 0.9);
        let pattern = test_pattern(5, 2.0, vec![]);
        let config = ThresholdConfig::default();
        let context = GovernorContext {
            proposals_today: config.max_daily_proposals,
            ..Default::default()
        };

        match RiskGovernor::decide(&proposal, &pattern, &config, &context) {
            GovernorDecision::Veto { reason, .. } => assert!(reason.contains("cap exhausted")),
            GovernorDecision::Forward { .. } => panic!("expected a veto"),
        }
    }

    #[test]
    fn test_forward_with_priority_and_clean_assessment() {
        let plan = StructurePlan {
            core_nodes: vec![NodeType::Reasoning],
            entry_strategy: EntryStrategy::Sequential,
            include_verification: true,
            include_refinement: false,
        };
        let proposal = test_proposal(plan, 0.85, 0.9);
        let pattern = test_pattern(12, 6.5, vec![]);
        let config = ThresholdConfig::default();

        match RiskGovernor::decide(&proposal, &pattern, &config, &GovernorContext::default()) {
            GovernorDecision::Forward {
                priority,
                suggestions,
                assessment,
            } => {
                assert_eq!(priority, Priority::High);
                assert!(assessment.overall_risk <= config.suggestion_risk_threshold);
                assert!(suggestions.is_empty());
            }
            GovernorDecision::Veto { reason, .. } => panic!("unexpected veto: {}", reason),
        }
    }

    #[test]
    fn test_verification_node_reduces_quality_risk() {
        let without = test_proposal(
            StructurePlan {
                core_nodes: vec![NodeType::Reasoning],
                entry_strategy: EntryStrategy::Sequential,
                include_verification: false,
                include_refinement: false,
            },
            0.7,
            0.7,
        );
        let with = test_proposal(
            StructurePlan {
                core_nodes: vec![NodeType::Reasoning],
                entry_strategy: EntryStrategy::Sequential,
                include_verification: true,
                include_refinement: false,
            },
            0.7,
            0.7,
        );
        let pattern = test_pattern(5, 2.0, vec![]);

        let risk_without = RiskGovernor::assess(&without, &pattern).quality_risk;
        let risk_with = RiskGovernor::assess(&with, &pattern).quality_risk;
        assert!(risk_with < risk_without);
    }

    #[test]
    fn test_priority_brackets() {
        assert_eq!(RiskGovernor::priority(&test_pattern(30, 1.0, vec![])), Priority::Urgent);
        assert_eq!(RiskGovernor::priority(&test_pattern(12, 1.0, vec![])), Priority::High);
        assert_eq!(RiskGovernor::priority(&test_pattern(6, 1.0, vec![])), Priority::Medium);
        assert_eq!(RiskGovernor::priority(&test_pattern(2, 1.0, vec![])), Priority::Low);
    }
}
