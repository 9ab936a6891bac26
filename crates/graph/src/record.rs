use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use extract::schema::{DEFAULT_ENTITY_TYPE, DEFAULT_RELATION_TYPE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Name as first extracted
    pub name: String,
    pub normalized_key: String,
    pub entity_type: String,
    pub description: String,
    pub source_chunk_ids: BTreeSet<String>,
}

impl EntityRecord {
    pub fn new(name: String, normalized_key: String) -> Self {
        Self {
            name,
            normalized_key,
            entity_type: DEFAULT_ENTITY_TYPE.to_string(),
            description: String::new(),
            source_chunk_ids: BTreeSet::new(),
        }
    }

    pub fn has_type(&self) -> bool {
        !self.entity_type.is_empty() && self.entity_type != DEFAULT_ENTITY_TYPE
    }

    /// Folds a later sighting into this record. Provenance is only ever added.
    pub(crate) fn absorb(&mut self, entity_type: &str, description: &str, chunk_id: &str) {
        if !self.has_type() && !entity_type.is_empty() {
            self.entity_type = entity_type.to_string();
        }
        // Longer description wins; ties keep the existing one
        if description.chars().count() > self.description.chars().count() {
            self.description = description.to_string();
        }
        self.source_chunk_ids.insert(chunk_id.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub source_key: String,
    pub target_key: String,
    pub relation_type: String,
    pub source_chunk_ids: BTreeSet<String>,
}

impl RelationshipRecord {
    pub fn new(source_key: String, target_key: String, relation_type: String) -> Self {
        let relation_type = if relation_type.trim().is_empty() {
            DEFAULT_RELATION_TYPE.to_string()
        } else {
            relation_type
        };
        Self {
            source_key,
            target_key,
            relation_type,
            source_chunk_ids: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> EdgeKey {
        (
            self.source_key.clone(),
            self.target_key.clone(),
            self.relation_type.clone(),
        )
    }
}

/// `(source_key, target_key, relation_type)`
pub type EdgeKey = (String, String, String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_prefers_longer_description() {
        let mut record = EntityRecord::new("Aspirin".into(), "aspirin".into());
        record.absorb("medication", "NSAID", "c1");
        record.absorb("drug", "A nonsteroidal anti-inflammatory drug", "c2");
        record.absorb("", "short", "c2");

        assert_eq!(record.entity_type, "medication");
        assert_eq!(record.description, "A nonsteroidal anti-inflammatory drug");
        assert_eq!(record.source_chunk_ids.len(), 2);
    }

    #[test]
    fn test_blank_relation_type_defaults() {
        let rel = RelationshipRecord::new("a".into(), "b".into(), " ".into());
        assert_eq!(rel.relation_type, DEFAULT_RELATION_TYPE);
    }
}
