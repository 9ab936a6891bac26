pub mod record;
pub mod view;

pub use record::{EdgeKey, EntityRecord, RelationshipRecord};
pub use view::GraphView;

use extract::normalizer::{clean_name, normalize_key};
use extract::schema::ExtractionResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Directed multigraph of entities and labelled relationships.
///
/// One node per normalized name; one edge per `(source, target, type)` triple.
/// Merging is idempotent, so replaying a chunk never changes the graph's shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "StoredGraph")]
pub struct KnowledgeGraph {
    entities: BTreeMap<String, EntityRecord>,
    relationships: Vec<RelationshipRecord>,
    /// chunk id -> originating note path
    chunk_sources: BTreeMap<String, String>,
    #[serde(skip)]
    index: EdgeIndex,
}

#[derive(Deserialize)]
struct StoredGraph {
    #[serde(default)]
    entities: BTreeMap<String, EntityRecord>,
    #[serde(default)]
    relationships: Vec<RelationshipRecord>,
    #[serde(default)]
    chunk_sources: BTreeMap<String, String>,
}

impl From<StoredGraph> for KnowledgeGraph {
    fn from(stored: StoredGraph) -> Self {
        let mut graph = KnowledgeGraph {
            entities: stored.entities,
            relationships: Vec::new(),
            chunk_sources: stored.chunk_sources,
            index: EdgeIndex::default(),
        };
        // Re-inserting through the index also folds any duplicate triples
        for rel in stored.relationships {
            graph.ensure_node(&rel.source_key, &rel.source_key);
            graph.ensure_node(&rel.target_key, &rel.target_key);
            let slot = graph.edge_slot(rel.key());
            graph.relationships[slot]
                .source_chunk_ids
                .extend(rel.source_chunk_ids);
        }
        graph
    }
}

impl PartialEq for KnowledgeGraph {
    fn eq(&self, other: &Self) -> bool {
        self.entities == other.entities
            && self.relationships == other.relationships
            && self.chunk_sources == other.chunk_sources
    }
}

#[derive(Debug, Clone, Default)]
struct EdgeIndex {
    by_key: HashMap<EdgeKey, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub new_entities: usize,
    pub new_relationships: usize,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one chunk's extraction into the graph.
    pub fn merge(&mut self, result: &ExtractionResult, chunk_id: &str) -> MergeSummary {
        let nodes_before = self.entities.len();
        let edges_before = self.relationships.len();

        for entity in &result.entities {
            let key = normalize_key(&entity.name);
            if key.is_empty() {
                continue;
            }
            self.ensure_node(&key, &entity.name)
                .absorb(&entity.entity_type, &entity.description, chunk_id);
        }

        for rel in &result.relationships {
            let source_key = normalize_key(&rel.source);
            let target_key = normalize_key(&rel.target);
            if source_key.is_empty() || target_key.is_empty() {
                continue;
            }

            // Endpoints never extracted as entities still become nodes
            for (key, name) in [(&source_key, &rel.source), (&target_key, &rel.target)] {
                self.ensure_node(key, name)
                    .source_chunk_ids
                    .insert(chunk_id.to_string());
            }

            let record = RelationshipRecord::new(
                source_key,
                target_key,
                normalize_key(&rel.relation_type),
            );
            let slot = self.edge_slot(record.key());
            self.relationships[slot]
                .source_chunk_ids
                .insert(chunk_id.to_string());
        }

        let summary = MergeSummary {
            new_entities: self.entities.len() - nodes_before,
            new_relationships: self.relationships.len() - edges_before,
        };
        debug!(
            chunk_id,
            new_entities = summary.new_entities,
            new_relationships = summary.new_relationships,
            "Merged extraction"
        );
        summary
    }

    pub fn record_source(&mut self, chunk_id: &str, path: &str) {
        self.chunk_sources
            .insert(chunk_id.to_string(), path.to_string());
    }

    pub fn source_path(&self, chunk_id: &str) -> Option<&str> {
        self.chunk_sources.get(chunk_id).map(String::as_str)
    }

    /// Looks an entity up by any spelling that normalizes to its key.
    pub fn entity(&self, name: &str) -> Option<&EntityRecord> {
        self.entities.get(&normalize_key(name))
    }

    pub fn entity_by_key(&self, key: &str) -> Option<&EntityRecord> {
        self.entities.get(key)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    pub fn relationships(&self) -> &[RelationshipRecord] {
        &self.relationships
    }

    pub fn outgoing<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a RelationshipRecord> + use<'a> {
        self.edges_at(self.index.outgoing.get(key))
    }

    pub fn incoming<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a RelationshipRecord> + use<'a> {
        self.edges_at(self.index.incoming.get(key))
    }

    /// In-degree plus out-degree, counting parallel edges.
    pub fn degree(&self, key: &str) -> usize {
        let out = self.index.outgoing.get(key).map_or(0, Vec::len);
        let inc = self.index.incoming.get(key).map_or(0, Vec::len);
        out + inc
    }

    /// Keys adjacent to `key` in either direction.
    pub fn neighbors(&self, key: &str) -> BTreeSet<&str> {
        self.outgoing(key)
            .map(|rel| rel.target_key.as_str())
            .chain(self.incoming(key).map(|rel| rel.source_key.as_str()))
            .filter(|neighbor| *neighbor != key)
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.entities.len()
    }

    pub fn edge_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn view(&self) -> GraphView {
        GraphView::build(self)
    }

    fn edges_at<'a>(
        &'a self,
        slots: Option<&'a Vec<usize>>,
    ) -> impl Iterator<Item = &'a RelationshipRecord> + 'a {
        slots
            .into_iter()
            .flatten()
            .map(move |&slot| &self.relationships[slot])
    }

    fn ensure_node(&mut self, key: &str, raw_name: &str) -> &mut EntityRecord {
        self.entities
            .entry(key.to_string())
            .or_insert_with(|| EntityRecord::new(clean_name(raw_name), key.to_string()))
    }

    /// Slot of the edge for `key`, inserting an empty one if it is new.
    fn edge_slot(&mut self, key: EdgeKey) -> usize {
        if let Some(&slot) = self.index.by_key.get(&key) {
            return slot;
        }

        let slot = self.relationships.len();
        let (source_key, target_key, relation_type) = key.clone();
        self.index
            .outgoing
            .entry(source_key.clone())
            .or_default()
            .push(slot);
        self.index
            .incoming
            .entry(target_key.clone())
            .or_default()
            .push(slot);
        self.relationships
            .push(RelationshipRecord::new(source_key, target_key, relation_type));
        self.index.by_key.insert(key, slot);
        slot
    }
}
