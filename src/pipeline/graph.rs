//! Workflow graph model and deterministic assembly
//!
//! Node types are a closed enumeration with an explicit mapping to the
//! external capability services they require; unknown types cannot exist
//! past synthesis. Graph construction is a pure builder with no side
//! effects so it can be tested independently of persistence.

use serde::{Deserialize, Serialize};

/// Closed set of processing step types a workflow graph may contain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Input,
    Output,
    Merge,
    ExternalSearch,
    Analysis,
    Reasoning,
    Generation,
    Formatter,
    Verification,
    Refinement,
    ExternalApi,
    DataExport,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Input => "input",
            NodeType::Output => "output",
            NodeType::Merge => "merge",
            NodeType::ExternalSearch => "external_search",
            NodeType::Analysis => "analysis",
            NodeType::Reasoning => "reasoning",
            NodeType::Generation => "generation",
            NodeType::Formatter => "formatter",
            NodeType::Verification => "verification",
            NodeType::Refinement => "refinement",
            NodeType::ExternalApi => "external_api",
            NodeType::DataExport => "data_export",
        }
    }

    /// External capability service a node of this type depends on.
    pub fn capability_service(&self) -> Option<&'static str> {
        match self {
            NodeType::ExternalSearch => Some("search-provider"),
            NodeType::Analysis
            | NodeType::Reasoning
            | NodeType::Generation
            | NodeType::Formatter
            | NodeType::Refinement => Some("llm-inference"),
            NodeType::Verification => Some("fact-verification"),
            NodeType::ExternalApi => Some("external-api-gateway"),
            NodeType::DataExport => Some("data-export"),
            NodeType::Input | NodeType::Output | NodeType::Merge => None,
        }
    }

    /// Node types that attract compliance scrutiny: external reach,
    /// data egress, or handling of personal data.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            NodeType::ExternalApi | NodeType::DataExport | NodeType::ExternalSearch
        )
    }

    /// Model tier a synthesized node of this type runs on.
    pub fn default_model(&self) -> Option<&'static str> {
        match self {
            NodeType::Analysis | NodeType::Reasoning => Some("ff-large"),
            NodeType::Generation | NodeType::Verification | NodeType::Refinement => {
                Some("ff-standard")
            }
            NodeType::Formatter => Some("ff-small"),
            _ => None,
        }
    }
}

/// Canvas position, assigned deterministically at assembly time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub config: serde_json::Value,
    pub position: NodePosition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryStrategy {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    pub entry_strategy: EntryStrategy,
    pub estimated_latency_ms: u64,
    /// Estimated execution cost per 1000 uses, in platform credits.
    pub estimated_cost_per_1k: f64,
    pub required_capabilities: Vec<String>,
}

/// A directed workflow graph with a designated entry point and exit
/// point(s).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    pub entry_node_id: String,
    pub exit_node_ids: Vec<String>,
    pub metadata: GraphMetadata,
}

impl WorkflowGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains_type(&self, node_type: NodeType) -> bool {
        self.nodes.iter().any(|n| n.node_type == node_type)
    }

    pub fn has_parallel_fanout(&self) -> bool {
        self.metadata.entry_strategy == EntryStrategy::Parallel
    }

    /// Number of distinct model tiers referenced by the graph's nodes.
    pub fn distinct_model_count(&self) -> usize {
        let mut models: Vec<&str> = self
            .nodes
            .iter()
            .filter_map(|n| n.model.as_deref())
            .collect();
        models.sort_unstable();
        models.dedup();
        models.len()
    }

    pub fn inbound_count(&self, node_id: &str) -> usize {
        self.edges.iter().filter(|e| e.to == node_id).count()
    }
}

// =============================================================================
// GRAPH BUILDER
// =============================================================================

/// Latency estimate: base plus a constant per processing node.
const BASE_LATENCY_MS: u64 = 1_200;
const PER_NODE_LATENCY_MS: u64 = 2_400;

/// Cost estimate per 1000 uses: base plus a constant per processing node.
const BASE_COST_PER_1K: f64 = 0.8;
const PER_NODE_COST_PER_1K: f64 = 1.5;

const COLUMN_SPACING: i32 = 240;
const ROW_SPACING: i32 = 140;

/// Maximum parallel branches out of the entry fan-out.
pub const MAX_PARALLEL_BRANCHES: usize = 3;

/// Assembly plan produced by structure determination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructurePlan {
    /// Core processing nodes, in order, already truncated to the tenant's
    /// node budget.
    pub core_nodes: Vec<NodeType>,
    pub entry_strategy: EntryStrategy,
    pub include_verification: bool,
    pub include_refinement: bool,
}

/// Pure, deterministic graph assembly.
pub struct GraphBuilder;

impl GraphBuilder {
    /// Lay out the graph: one input node, then either a parallel fan-out
    /// (bounded branches, merged when more than one) or a sequential
    /// chain, followed optionally by a verification node and a bounded
    /// refinement node, terminating in one output node.
    pub fn build(plan: &StructurePlan) -> WorkflowGraph {
        let mut nodes: Vec<WorkflowNode> = Vec::new();
        let mut edges: Vec<WorkflowEdge> = Vec::new();
        let mut column = 0;

        let input_id = "input".to_string();
        nodes.push(Self::node(&input_id, NodeType::Input, column, 0));

        // Frontier: node ids that feed the next stage.
        let mut frontier: Vec<String> = vec![input_id.clone()];

        let mut remaining: &[NodeType] = &plan.core_nodes;
        if plan.entry_strategy == EntryStrategy::Parallel && !remaining.is_empty() {
            let branch_count = remaining.len().min(MAX_PARALLEL_BRANCHES);
            column += 1;
            let mut branch_ids = Vec::with_capacity(branch_count);
            for (row, node_type) in remaining[..branch_count].iter().enumerate() {
                let id = format!("{}-{}", node_type.as_str().replace('_', "-"), row + 1);
                nodes.push(Self::node(&id, *node_type, column, row as i32));
                edges.push(WorkflowEdge {
                    from: input_id.clone(),
                    to: id.clone(),
                });
                branch_ids.push(id);
            }
            remaining = &remaining[branch_count..];

            if branch_ids.len() > 1 {
                column += 1;
                let merge_id = "merge".to_string();
                nodes.push(Self::node(&merge_id, NodeType::Merge, column, 0));
                for branch in &branch_ids {
                    edges.push(WorkflowEdge {
                        from: branch.clone(),
                        to: merge_id.clone(),
                    });
                }
                frontier = vec![merge_id];
            } else {
                frontier = branch_ids;
            }
        }

        // Sequential chain for whatever is left (or everything, when the
        // entry strategy is sequential).
        for (idx, node_type) in remaining.iter().enumerate() {
            column += 1;
            let id = format!("{}-{}", node_type.as_str().replace('_', "-"), idx + 1);
            nodes.push(Self::node(&id, *node_type, column, 0));
            for prev in &frontier {
                edges.push(WorkflowEdge {
                    from: prev.clone(),
                    to: id.clone(),
                });
            }
            frontier = vec![id];
        }

        if plan.include_verification {
            column += 1;
            let id = "verify".to_string();
            nodes.push(Self::node(&id, NodeType::Verification, column, 0));
            for prev in &frontier {
                edges.push(WorkflowEdge {
                    from: prev.clone(),
                    to: id.clone(),
                });
            }
            frontier = vec![id];
        }

        if plan.include_refinement {
            column += 1;
            let id = "refine".to_string();
            nodes.push(Self::node(&id, NodeType::Refinement, column, 0));
            for prev in &frontier {
                edges.push(WorkflowEdge {
                    from: prev.clone(),
                    to: id.clone(),
                });
            }
            frontier = vec![id];
        }

        column += 1;
        let output_id = "output".to_string();
        nodes.push(Self::node(&output_id, NodeType::Output, column, 0));
        for prev in &frontier {
            edges.push(WorkflowEdge {
                from: prev.clone(),
                to: output_id.clone(),
            });
        }

        let processing_nodes = nodes
            .iter()
            .filter(|n| !matches!(n.node_type, NodeType::Input | NodeType::Output))
            .count() as u64;

        let mut capabilities: Vec<String> = nodes
            .iter()
            .filter_map(|n| n.node_type.capability_service())
            .map(str::to_string)
            .collect();
        capabilities.sort_unstable();
        capabilities.dedup();

        let metadata = GraphMetadata {
            entry_strategy: plan.entry_strategy,
            estimated_latency_ms: BASE_LATENCY_MS + processing_nodes * PER_NODE_LATENCY_MS,
            estimated_cost_per_1k: BASE_COST_PER_1K
                + processing_nodes as f64 * PER_NODE_COST_PER_1K,
            required_capabilities: capabilities,
        };

        WorkflowGraph {
            nodes,
            edges,
            entry_node_id: input_id,
            exit_node_ids: vec![output_id],
            metadata,
        }
    }

    fn node(id: &str, node_type: NodeType, column: i32, row: i32) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            node_type,
            label: Self::label_for(node_type),
            model: node_type.default_model().map(str::to_string),
            config: serde_json::json!({}),
            position: NodePosition {
                x: column * COLUMN_SPACING,
                y: row * ROW_SPACING,
            },
        }
    }

    fn label_for(node_type: NodeType) -> String {
        match node_type {
            NodeType::Input => "Input".to_string(),
            NodeType::Output => "Output".to_string(),
            NodeType::Merge => "Merge results".to_string(),
            NodeType::ExternalSearch => "Search sources".to_string(),
            NodeType::Analysis => "Deep analysis".to_string(),
            NodeType::Reasoning => "Reasoning".to_string(),
            NodeType::Generation => "Generate draft".to_string(),
            NodeType::Formatter => "Structure output".to_string(),
            NodeType::Verification => "Verify claims".to_string(),
            NodeType::Refinement => "Quality check".to_string(),
            NodeType::ExternalApi => "External API call".to_string(),
            NodeType::DataExport => "Export data".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sequential_plan(core: Vec<NodeType>) -> StructurePlan {
        StructurePlan {
            core_nodes: core,
            entry_strategy: EntryStrategy::Sequential,
            include_verification: false,
            include_refinement: false,
        }
    }

    #[test]
    fn test_sequential_chain_shape() {
        let plan = sequential_plan(vec![NodeType::Reasoning, NodeType::Generation]);
        let graph = GraphBuilder::build(&plan);

        assert_eq!(graph.node_count(), 4); // input, reasoning, generation, output
        assert_eq!(graph.entry_node_id, "input");
        assert_eq!(graph.exit_node_ids, vec!["output".to_string()]);
        // Every node except the input has at least one inbound edge.
        for node in &graph.nodes {
            if node.id != graph.entry_node_id {
                assert!(graph.inbound_count(&node.id) >= 1, "node {} orphaned", node.id);
            }
        }
    }

    #[test]
    fn test_parallel_fanout_with_merge() {
        let plan = StructurePlan {
            core_nodes: vec![
                NodeType::ExternalSearch,
                NodeType::ExternalSearch,
                NodeType::Analysis,
                NodeType::Generation,
            ],
            entry_strategy: EntryStrategy::Parallel,
            include_verification: true,
            include_refinement: false,
        };
        let graph = GraphBuilder::build(&plan);

        assert!(graph.has_parallel_fanout());
        assert!(graph.contains_type(NodeType::Merge));
        // Three branches, then the fourth core node runs after the merge.
        let merge_inbound = graph.inbound_count("merge");
        assert_eq!(merge_inbound, 3);
        assert!(graph.contains_type(NodeType::Verification));
        // verify fans in from the tail of the chain.
        assert_eq!(graph.inbound_count("verify"), 1);
    }

    #[test]
    fn test_fanout_bounded_to_three_branches() {
        let plan = StructurePlan {
            core_nodes: vec![NodeType::ExternalSearch; 5],
            entry_strategy: EntryStrategy::Parallel,
            include_verification: false,
            include_refinement: false,
        };
        let graph = GraphBuilder::build(&plan);

        let fanout = graph
            .edges
            .iter()
            .filter(|e| e.from == graph.entry_node_id)
            .count();
        assert_eq!(fanout, MAX_PARALLEL_BRANCHES);
    }

    #[test]
    fn test_metadata_estimates_scale_with_nodes() {
        let small = GraphBuilder::build(&sequential_plan(vec![NodeType::Generation]));
        let large = GraphBuilder::build(&sequential_plan(vec![
            NodeType::Reasoning,
            NodeType::Generation,
            NodeType::Formatter,
        ]));

        assert!(large.metadata.estimated_latency_ms > small.metadata.estimated_latency_ms);
        assert!(large.metadata.estimated_cost_per_1k > small.metadata.estimated_cost_per_1k);
        assert_eq!(
            small.metadata.estimated_latency_ms,
            BASE_LATENCY_MS + PER_NODE_LATENCY_MS
        );
    }

    #[test]
    fn test_required_capabilities_are_deduped_union() {
        let plan = StructurePlan {
            core_nodes: vec![NodeType::ExternalSearch, NodeType::Reasoning, NodeType::Generation],
            entry_strategy: EntryStrategy::Sequential,
            include_verification: true,
            include_refinement: false,
        };
        let graph = GraphBuilder::build(&plan);
        assert_eq!(
            graph.metadata.required_capabilities,
            vec![
                "fact-verification".to_string(),
                "llm-inference".to_string(),
                "search-provider".to_string(),
            ]
        );
    }

    #[test]
    fn test_distinct_model_count() {
        let plan = sequential_plan(vec![NodeType::Reasoning, NodeType::Formatter]);
        let graph = GraphBuilder::build(&plan);
        // ff-large + ff-small
        assert_eq!(graph.distinct_model_count(), 2);
    }
}
