//! Proposal synthesizer
//!
//! Turns a qualifying pattern plus its evidence into a candidate
//! workflow graph: evidence analysis, structure determination,
//! deterministic graph assembly, and coverage reconciliation. The
//! confidence formula is a tunable heuristic, not a contract; its
//! coefficients live in `SynthesisTuning`.

use crate::error::AppError;
use crate::pipeline::graph::{
    EntryStrategy, GraphBuilder, NodeType, StructurePlan, WorkflowGraph,
};
use crate::pipeline::thresholds::ThresholdConfig;
use crate::pipeline::types::{
    AlternativeSketch, ComplexityBucket, Evidence, NeedPattern,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Coefficients of the synthesis confidence estimate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SynthesisTuning {
    pub base: f64,
    pub weight_coeff: f64,
    pub consistency_coeff: f64,
    pub max_confidence: f64,
    /// Evidence-confidence floor below which synthesis aborts.
    pub insufficient_signal_floor: f64,
    /// Coverage assumed when the evidence carries no capability signals.
    pub default_coverage: f64,
}

impl Default for SynthesisTuning {
    fn default() -> Self {
        Self {
            base: 0.3,
            weight_coeff: 0.3,
            consistency_coeff: 0.4,
            max_confidence: 0.95,
            insufficient_signal_floor: 0.5,
            default_coverage: 0.6,
        }
    }
}

/// Capability signals extractable from evidence free text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Verification,
    MultiSource,
    Depth,
    Reasoning,
    Creativity,
    Structure,
    Iteration,
}

impl Capability {
    /// Fixed capability-to-node-type mapping.
    pub fn node_type(&self) -> NodeType {
        match self {
            Capability::Verification => NodeType::Verification,
            Capability::MultiSource => NodeType::ExternalSearch,
            Capability::Depth => NodeType::Analysis,
            Capability::Reasoning => NodeType::Reasoning,
            Capability::Creativity => NodeType::Generation,
            Capability::Structure => NodeType::Formatter,
            Capability::Iteration => NodeType::Refinement,
        }
    }

    /// Capabilities that become core chain nodes; verification and
    /// iteration occupy reserved slots instead.
    fn is_core(&self) -> bool {
        !matches!(self, Capability::Verification | Capability::Iteration)
    }
}

/// Fixed capability-keyword table, scanned in order against the
/// lowercased evidence text.
static CAPABILITY_TABLE: Lazy<Vec<(Capability, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (
            Capability::Verification,
            vec![
                "verify", "accurate", "accuracy", "wrong", "incorrect", "hallucinat",
                "citation", "fact-check", "unreliable",
            ],
        ),
        (
            Capability::MultiSource,
            vec![
                "multiple sources", "several sources", "cross-reference", "compare sources",
                "different sources", "multi-source", "more sources",
            ],
        ),
        (
            Capability::Depth,
            vec!["shallow", "deeper", "depth", "detailed", "thorough", "comprehensive", "superficial"],
        ),
        (
            Capability::Reasoning,
            vec!["reasoning", "logic", "step by step", "multi-step", "complex"],
        ),
        (
            Capability::Creativity,
            vec!["creative", "original", "tone", "style", "engaging", "bland", "generic"],
        ),
        (
            Capability::Structure,
            vec!["format", "structure", "table", "json", "bullet", "organized", "template"],
        ),
        (
            Capability::Iteration,
            vec!["iterate", "refine", "revision", "polish", "retry", "first draft", "rough"],
        ),
    ]
});

/// Outcome of the evidence-analysis stage.
#[derive(Debug, Clone)]
pub struct EvidenceAnalysis {
    pub dominant_reason: String,
    pub reason_consistency: f64,
    pub avg_weight: f64,
    pub capabilities: Vec<Capability>,
    /// Bounded linear combination of weight and consistency.
    pub confidence: f64,
}

/// A synthesized proposal draft, not yet persisted or governed.
#[derive(Debug, Clone)]
pub struct ProposalDraft {
    pub name: String,
    pub description: String,
    pub graph: WorkflowGraph,
    pub complexity: ComplexityBucket,
    /// Reconciled overall confidence: mean of evidence confidence and
    /// coverage.
    pub confidence: f64,
    pub coverage: f64,
    pub reasoning: String,
    pub alternatives: Vec<AlternativeSketch>,
}

pub struct Synthesizer {
    tuning: SynthesisTuning,
}

impl Synthesizer {
    pub fn new(tuning: SynthesisTuning) -> Self {
        Self { tuning }
    }

    /// Run the full synthesis pipeline for a pattern.
    pub fn synthesize(
        &self,
        pattern: &NeedPattern,
        evidence: &[Evidence],
        config: &ThresholdConfig,
    ) -> Result<ProposalDraft, AppError> {
        let analysis = self.analyze_evidence(evidence)?;
        let plan = Self::determine_structure(pattern, &analysis, config);
        let graph = GraphBuilder::build(&plan);

        let coverage = self.estimate_coverage(&analysis.capabilities, &graph);
        let overall = (analysis.confidence + coverage) / 2.0;
        if overall < config.min_coverage_estimate {
            return Err(AppError::LowCoverage(format!(
                "overall confidence {:.2} below the {:.2} floor (evidence {:.2}, coverage {:.2})",
                overall, config.min_coverage_estimate, analysis.confidence, coverage
            )));
        }

        debug!(
            "Synthesized graph for pattern {}: {} nodes, confidence {:.2}, coverage {:.2}",
            pattern.id,
            graph.node_count(),
            overall,
            coverage
        );

        let complexity = match graph.node_count() {
            0..=5 => ComplexityBucket::Simple,
            6..=8 => ComplexityBucket::Moderate,
            _ => ComplexityBucket::Complex,
        };

        let name = Self::proposal_name(pattern);
        let description = Self::proposal_description(pattern, evidence.len());
        let reasoning = Self::proposal_reasoning(pattern, &analysis, coverage);
        let alternatives = Self::sketch_alternatives(&analysis, overall);

        Ok(ProposalDraft {
            name,
            description,
            graph,
            complexity,
            confidence: overall,
            coverage,
            reasoning,
            alternatives,
        })
    }

    /// Stage 1: failure-reason tally, capability extraction, and the
    /// evidence-confidence estimate.
    pub fn analyze_evidence(&self, evidence: &[Evidence]) -> Result<EvidenceAnalysis, AppError> {
        if evidence.is_empty() {
            return Err(AppError::InsufficientSignal(
                "no evidence attributed to pattern".to_string(),
            ));
        }

        let mut reason_counts: HashMap<String, usize> = HashMap::new();
        for item in evidence {
            let reason = item
                .failure_reason
                .as_deref()
                .map(|r| r.trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "unspecified".to_string());
            *reason_counts.entry(reason).or_insert(0) += 1;
        }
        let (dominant_reason, dominant_count) = reason_counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .unwrap_or_else(|| ("unspecified".to_string(), 0));
        let reason_consistency = dominant_count as f64 / evidence.len() as f64;

        let mut text = String::new();
        for item in evidence {
            text.push_str(&item.original_request.to_lowercase());
            text.push(' ');
            if let Some(reason) = &item.failure_reason {
                text.push_str(&reason.to_lowercase());
                text.push(' ');
            }
        }
        let capabilities: Vec<Capability> = CAPABILITY_TABLE
            .iter()
            .filter(|(_, markers)| markers.iter().any(|m| text.contains(m)))
            .map(|(capability, _)| *capability)
            .collect();

        let total_weight: f64 = evidence.iter().map(|e| e.weight).sum();
        let avg_weight = (total_weight / evidence.len() as f64).min(1.0);

        let confidence = (self.tuning.base
            + self.tuning.weight_coeff * avg_weight
            + self.tuning.consistency_coeff * reason_consistency)
            .clamp(0.0, self.tuning.max_confidence);

        if confidence < self.tuning.insufficient_signal_floor {
            return Err(AppError::InsufficientSignal(format!(
                "evidence confidence {:.2} below the {:.2} floor",
                confidence, self.tuning.insufficient_signal_floor
            )));
        }

        Ok(EvidenceAnalysis {
            dominant_reason,
            reason_consistency,
            avg_weight,
            capabilities,
            confidence,
        })
    }

    /// Stage 2: map capability signals to a node-type plan within the
    /// tenant's node budget.
    pub fn determine_structure(
        pattern: &NeedPattern,
        analysis: &EvidenceAnalysis,
        config: &ThresholdConfig,
    ) -> StructurePlan {
        let intent = pattern.signature.intent;
        let multi_source = analysis.capabilities.contains(&Capability::MultiSource);

        let mut core_nodes: Vec<NodeType> = Vec::new();
        for capability in analysis.capabilities.iter().filter(|c| c.is_core()) {
            let node_type = capability.node_type();
            if !core_nodes.contains(&node_type) {
                core_nodes.push(node_type);
            }
        }
        // Multi-source means more than one retrieval branch.
        if multi_source {
            core_nodes.insert(0, NodeType::ExternalSearch);
        }
        if core_nodes.is_empty() {
            core_nodes.push(if intent.is_generative() {
                NodeType::Generation
            } else {
                NodeType::Reasoning
            });
        }

        let entry_strategy = if multi_source {
            EntryStrategy::Parallel
        } else {
            EntryStrategy::Sequential
        };

        let include_verification = analysis.capabilities.contains(&Capability::Verification)
            || analysis.confidence < 0.7
            || intent.demands_verification();
        let include_refinement =
            analysis.capabilities.contains(&Capability::Iteration) || intent.is_generative();

        // Reserved slots: input, output, optional verification/refinement,
        // and the merge node a parallel entry may add.
        let mut reserved = 2usize;
        if include_verification {
            reserved += 1;
        }
        if include_refinement {
            reserved += 1;
        }
        if entry_strategy == EntryStrategy::Parallel {
            reserved += 1;
        }
        let budget = (config.max_graph_nodes as usize).saturating_sub(reserved).max(1);
        core_nodes.truncate(budget);

        StructurePlan {
            core_nodes,
            entry_strategy,
            include_verification,
            include_refinement,
        }
    }

    /// Stage 4 input: fraction of capability signals whose mapped node
    /// types made it into the assembled graph.
    pub fn estimate_coverage(&self, capabilities: &[Capability], graph: &WorkflowGraph) -> f64 {
        if capabilities.is_empty() {
            return self.tuning.default_coverage;
        }
        let covered = capabilities
            .iter()
            .filter(|c| graph.contains_type(c.node_type()))
            .count();
        covered as f64 / capabilities.len() as f64
    }

    fn proposal_name(pattern: &NeedPattern) -> String {
        let mut intent = pattern.signature.intent.as_str().to_string();
        if let Some(first) = intent.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        let topic = pattern
            .signature
            .keywords
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        if topic.is_empty() {
            format!("{} workflow", intent)
        } else {
            format!("{} workflow: {}", intent, topic)
        }
    }

    fn proposal_description(pattern: &NeedPattern, evidence_count: usize) -> String {
        format!(
            "Addresses a recurring {} need reported across {} evidence events from {} users. \
             Keywords: {}.",
            pattern.signature.intent.as_str(),
            evidence_count,
            pattern.distinct_users,
            pattern.signature.keywords.join(", ")
        )
    }

    fn proposal_reasoning(
        pattern: &NeedPattern,
        analysis: &EvidenceAnalysis,
        coverage: f64,
    ) -> String {
        let capabilities = analysis
            .capabilities
            .iter()
            .map(|c| c.node_type().as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Dominant failure reason '{}' appears in {:.0}% of evidence. \
             Capability signals mapped to: [{}]. Estimated coverage {:.0}% \
             of observed signals for intent '{}'.",
            analysis.dominant_reason,
            analysis.reason_consistency * 100.0,
            capabilities,
            coverage * 100.0,
            pattern.signature.intent.as_str()
        )
    }

    /// One cheaper single-path variant, plus a more thorough ensemble
    /// variant when the signal is rich enough to justify it.
    fn sketch_alternatives(analysis: &EvidenceAnalysis, overall: f64) -> Vec<AlternativeSketch> {
        let mut alternatives = vec![AlternativeSketch {
            name: "Streamlined single-path variant".to_string(),
            summary: "Sequential chain with a single processing step and no \
                      verification or refinement stages."
                .to_string(),
            confidence: (overall - 0.08).max(0.0),
            tradeoff: "Cheaper and faster per run; lower thoroughness on contested content."
                .to_string(),
        }];

        if analysis.capabilities.len() >= 2 {
            alternatives.push(AlternativeSketch {
                name: "Thorough ensemble variant".to_string(),
                summary: "Parallel fan-out across all detected capabilities with \
                          verification and a bounded quality loop."
                    .to_string(),
                confidence: (overall + 0.03).min(0.95),
                tradeoff: "Higher cost and latency; strongest answer quality.".to_string(),
            });
        }

        alternatives
    }
}
