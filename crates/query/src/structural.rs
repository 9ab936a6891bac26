use graph::{EntityRecord, GraphView, KnowledgeGraph};
use petgraph::algo::{all_simple_paths, connected_components};
use petgraph::graph::NodeIndex;
use petgraph::{EdgeType, Graph, Undirected};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::context::{sort_by_degree, source_notes};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeInfo {
    pub source: String,
    pub relation: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityInfo {
    pub name: String,
    pub normalized_key: String,
    pub entity_type: String,
    pub description: String,
    pub degree: usize,
    pub sources: Vec<String>,
    pub outgoing: Vec<EdgeInfo>,
    pub incoming: Vec<EdgeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySummary {
    pub name: String,
    pub entity_type: String,
    pub degree: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub density: f64,
    pub weakly_connected: bool,
    pub components: usize,
    pub entity_types: BTreeMap<String, usize>,
    pub top_entities: Vec<EntitySummary>,
}

/// Accepts a user-typed entity name: exact key first, then the best-connected
/// entity whose key contains, or is contained in, the query.
pub(crate) fn resolve<'g>(graph: &'g KnowledgeGraph, name: &str) -> Option<&'g EntityRecord> {
    let cleaned = name.trim().trim_matches(|c: char| c == '"' || c == '\'');
    if let Some(exact) = graph.entity(cleaned) {
        return Some(exact);
    }

    let query = extract::normalize_key(cleaned);
    if query.is_empty() {
        return None;
    }

    let mut candidates: Vec<&EntityRecord> = graph
        .entities()
        .filter(|e| e.normalized_key.contains(&query) || query.contains(&e.normalized_key))
        .collect();
    sort_by_degree(graph, &mut candidates);
    candidates.into_iter().next()
}

fn summary(graph: &KnowledgeGraph, entity: &EntityRecord) -> EntitySummary {
    EntitySummary {
        name: entity.name.clone(),
        entity_type: entity.entity_type.clone(),
        degree: graph.degree(&entity.normalized_key),
    }
}

fn display_name(graph: &KnowledgeGraph, key: &str) -> String {
    graph
        .entity_by_key(key)
        .map_or_else(|| key.to_string(), |e| e.name.clone())
}

pub(crate) fn entity_info(graph: &KnowledgeGraph, name: &str) -> Option<EntityInfo> {
    let entity = resolve(graph, name)?;
    let key = &entity.normalized_key;

    let outgoing = graph
        .outgoing(key)
        .map(|rel| EdgeInfo {
            source: entity.name.clone(),
            relation: rel.relation_type.clone(),
            target: display_name(graph, &rel.target_key),
        })
        .collect();
    let incoming = graph
        .incoming(key)
        .map(|rel| EdgeInfo {
            source: display_name(graph, &rel.source_key),
            relation: rel.relation_type.clone(),
            target: entity.name.clone(),
        })
        .collect();

    Some(EntityInfo {
        name: entity.name.clone(),
        normalized_key: key.clone(),
        entity_type: entity.entity_type.clone(),
        description: entity.description.clone(),
        degree: graph.degree(key),
        sources: source_notes(graph, std::slice::from_ref(key)),
        outgoing,
        incoming,
    })
}

fn simple_paths<Ty: EdgeType>(
    graph: &Graph<String, String, Ty>,
    from: NodeIndex,
    to: NodeIndex,
    max_depth: usize,
    limit: usize,
) -> Vec<Vec<NodeIndex>> {
    // Depth counts edges; petgraph bounds the nodes strictly between the ends
    let max_intermediate = max_depth.saturating_sub(1);
    all_simple_paths::<Vec<NodeIndex>, _>(graph, from, to, 0, Some(max_intermediate))
        .take(limit)
        .collect()
}

/// Simple paths from `source` to `target`, each as display names starting at `source`.
///
/// Edge direction is followed first, then walked backwards; only when neither
/// finds anything is direction ignored.
pub(crate) fn find_paths(
    graph: &KnowledgeGraph,
    view: &GraphView,
    source: &str,
    target: &str,
    max_depth: usize,
    max_paths: usize,
) -> Vec<Vec<String>> {
    let (Some(from), Some(to)) = (resolve(graph, source), resolve(graph, target)) else {
        return Vec::new();
    };
    if from.normalized_key == to.normalized_key {
        return vec![vec![from.name.clone()]];
    }
    let (Some(a), Some(b)) = (view.node(&from.normalized_key), view.node(&to.normalized_key)) else {
        return Vec::new();
    };
    if max_depth == 0 || max_paths == 0 {
        return Vec::new();
    }

    let mut found = simple_paths(&view.graph, a, b, max_depth, max_paths);

    let mut reversed = view.graph.clone();
    reversed.reverse();
    found.extend(simple_paths(&reversed, a, b, max_depth, max_paths));

    if found.is_empty() {
        let undirected = view.graph.clone().into_edge_type::<Undirected>();
        found.extend(simple_paths(&undirected, a, b, max_depth, max_paths));
    }

    // Parallel edges yield the same node sequence more than once
    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .take(max_paths)
        .map(|path| {
            path.into_iter()
                .map(|idx| display_name(graph, view.key(idx)))
                .collect()
        })
        .collect()
}

pub(crate) fn search_entities(graph: &KnowledgeGraph, query: &str, limit: usize) -> Vec<EntitySummary> {
    let needle = extract::normalize_key(query);
    if needle.is_empty() {
        return Vec::new();
    }

    let mut matches: Vec<&EntityRecord> = graph
        .entities()
        .filter(|e| e.normalized_key.contains(&needle))
        .collect();
    sort_by_degree(graph, &mut matches);
    matches
        .into_iter()
        .take(limit)
        .map(|e| summary(graph, e))
        .collect()
}

pub(crate) fn stats(graph: &KnowledgeGraph, view: &GraphView, top_n: usize) -> GraphStats {
    let nodes = graph.node_count();
    let edges = graph.edge_count();
    let density = if nodes > 1 {
        edges as f64 / (nodes as f64 * (nodes as f64 - 1.0))
    } else {
        0.0
    };
    // On a directed graph this counts weakly connected components
    let components = if nodes == 0 {
        0
    } else {
        connected_components(&view.graph)
    };

    let mut entity_types = BTreeMap::new();
    for entity in graph.entities() {
        *entity_types.entry(entity.entity_type.clone()).or_insert(0) += 1;
    }

    let mut ranked: Vec<&EntityRecord> = graph.entities().collect();
    sort_by_degree(graph, &mut ranked);

    GraphStats {
        total_nodes: nodes,
        total_edges: edges,
        density,
        weakly_connected: components == 1,
        components,
        entity_types,
        top_entities: ranked
            .into_iter()
            .take(top_n)
            .map(|e| summary(graph, e))
            .collect(),
    }
}
