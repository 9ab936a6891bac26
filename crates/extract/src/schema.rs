use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::normalizer::clean_name;

pub const DEFAULT_ENTITY_TYPE: &str = "unknown";
pub const DEFAULT_RELATION_TYPE: &str = "relates_to";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// Loosely-typed lists as they came out of the model.
#[derive(Debug, Clone, Default)]
pub struct RawExtraction {
    pub entities: Vec<Value>,
    pub relationships: Vec<Value>,
}

impl RawExtraction {
    /// Validates every item; items missing required fields are dropped.
    pub fn validate(self) -> ExtractionResult {
        let entities: Vec<_> = self.entities.iter().filter_map(entity_from_value).collect();
        let relationships: Vec<_> = self
            .relationships
            .iter()
            .filter_map(relationship_from_value)
            .collect();

        let dropped = self.entities.len() + self.relationships.len()
            - entities.len()
            - relationships.len();
        if dropped > 0 {
            debug!(dropped, "Dropped extraction items missing required fields");
        }

        ExtractionResult {
            entities,
            relationships,
        }
    }
}

fn string_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn entity_from_value(value: &Value) -> Option<ExtractedEntity> {
    let name = clean_name(string_field(value, &["name", "entity"])?);
    if name.is_empty() {
        return None;
    }

    let entity_type = string_field(value, &["type", "entity_type"])
        .map(|t| t.trim().to_lowercase())
        .unwrap_or_else(|| DEFAULT_ENTITY_TYPE.to_string());

    // Older prompts nested the description under `properties`
    let description = string_field(value, &["description"])
        .or_else(|| value.get("properties").and_then(|p| string_field(p, &["description"])))
        .map(|d| d.trim().to_string())
        .unwrap_or_default();

    Some(ExtractedEntity {
        name,
        entity_type,
        description,
    })
}

fn relationship_from_value(value: &Value) -> Option<ExtractedRelationship> {
    let source = clean_name(string_field(value, &["source", "from"])?);
    let target = clean_name(string_field(value, &["target", "to"])?);

    let relation_type = string_field(value, &["type", "relation_type", "relation", "relationship"])
        .map(|t| t.trim().to_string())
        .unwrap_or_else(|| DEFAULT_RELATION_TYPE.to_string());

    Some(ExtractedRelationship {
        source,
        target,
        relation_type,
    })
}
