use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

use crate::KnowledgeGraph;

/// Read-only petgraph projection of a [`KnowledgeGraph`] for graph algorithms.
///
/// Node weights are normalized keys, edge weights relation types.
pub struct GraphView {
    pub graph: DiGraph<String, String>,
    nodes: HashMap<String, NodeIndex>,
}

impl GraphView {
    pub fn build(kg: &KnowledgeGraph) -> Self {
        let mut graph = DiGraph::with_capacity(kg.node_count(), kg.edge_count());
        let mut nodes = HashMap::with_capacity(kg.node_count());

        for entity in kg.entities() {
            let idx = graph.add_node(entity.normalized_key.clone());
            nodes.insert(entity.normalized_key.clone(), idx);
        }

        for rel in kg.relationships() {
            if let (Some(&source), Some(&target)) =
                (nodes.get(&rel.source_key), nodes.get(&rel.target_key))
            {
                graph.add_edge(source, target, rel.relation_type.clone());
            }
        }

        Self { graph, nodes }
    }

    pub fn node(&self, key: &str) -> Option<NodeIndex> {
        self.nodes.get(key).copied()
    }

    pub fn key(&self, idx: NodeIndex) -> &str {
        &self.graph[idx]
    }
}
