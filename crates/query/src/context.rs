use extract::normalize_key;
use graph::{EntityRecord, KnowledgeGraph};
use std::collections::{BTreeSet, HashSet};

/// Edges listed per direction for each entity in a context block.
const EDGES_PER_ENTITY: usize = 10;

const STOPWORDS: &[&str] = &[
    "about", "anything", "between", "does", "from", "have", "into", "know", "related", "tell",
    "that", "their", "there", "these", "this", "what", "when", "where", "which", "with",
];

/// Entity keys relevant to a question, most relevant first, at most `max`.
///
/// Whole-name mentions come first, then entities containing a significant word of
/// the question, then one-hop neighbours of everything matched so far. Within
/// each group, better-connected entities win.
pub(crate) fn select_entities(graph: &KnowledgeGraph, question: &str, max: usize) -> Vec<String> {
    let question = normalize_key(question);
    let mut selection = Selection::new(max);

    let mut direct: Vec<&EntityRecord> = graph
        .entities()
        .filter(|e| contains_phrase(&question, &e.normalized_key))
        .collect();
    sort_by_degree(graph, &mut direct);
    selection.extend(direct);

    let tokens = significant_words(&question);
    if !tokens.is_empty() {
        let mut fuzzy: Vec<&EntityRecord> = graph
            .entities()
            .filter(|e| tokens.iter().any(|t| e.normalized_key.contains(t.as_str())))
            .collect();
        sort_by_degree(graph, &mut fuzzy);
        selection.extend(fuzzy);
    }

    let seeds = selection.keys.clone();
    for seed in &seeds {
        let mut neighbors: Vec<&EntityRecord> = graph
            .neighbors(seed)
            .into_iter()
            .filter_map(|key| graph.entity_by_key(key))
            .collect();
        sort_by_degree(graph, &mut neighbors);
        selection.extend(neighbors);
    }

    selection.keys
}

struct Selection {
    keys: Vec<String>,
    seen: HashSet<String>,
    max: usize,
}

impl Selection {
    fn new(max: usize) -> Self {
        Self {
            keys: Vec::new(),
            seen: HashSet::new(),
            max,
        }
    }

    fn extend<'a>(&mut self, entities: impl IntoIterator<Item = &'a EntityRecord>) {
        for entity in entities {
            if self.keys.len() >= self.max {
                return;
            }
            if self.seen.insert(entity.normalized_key.clone()) {
                self.keys.push(entity.normalized_key.clone());
            }
        }
    }
}

pub(crate) fn sort_by_degree(graph: &KnowledgeGraph, entities: &mut [&EntityRecord]) {
    entities.sort_by(|a, b| {
        graph
            .degree(&b.normalized_key)
            .cmp(&graph.degree(&a.normalized_key))
            .then_with(|| a.normalized_key.cmp(&b.normalized_key))
    });
}

/// `needle` occurs in `haystack` as whole words.
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn significant_words(question: &str) -> Vec<String> {
    let mut words: Vec<String> = question
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect();
    words.sort();
    words.dedup();
    words
}

/// Human-readable block describing each entity and its relationships.
pub(crate) fn format_context(graph: &KnowledgeGraph, keys: &[String]) -> String {
    let name_of = |key: &str| {
        graph
            .entity_by_key(key)
            .map_or_else(|| key.to_string(), |e| e.name.clone())
    };

    keys.iter()
        .filter_map(|key| graph.entity_by_key(key))
        .map(|entity| {
            let mut block = format!("Entity: {}\nType: {}\n", entity.name, entity.entity_type);
            if !entity.description.is_empty() {
                block.push_str(&format!("Description: {}\n", entity.description));
            }

            let outgoing: Vec<_> = graph.outgoing(&entity.normalized_key).take(EDGES_PER_ENTITY).collect();
            let incoming: Vec<_> = graph.incoming(&entity.normalized_key).take(EDGES_PER_ENTITY).collect();
            if !outgoing.is_empty() || !incoming.is_empty() {
                block.push_str("Relationships:\n");
            }
            for rel in outgoing {
                block.push_str(&format!(
                    "  - {} --[{}]--> {}\n",
                    entity.name,
                    rel.relation_type,
                    name_of(&rel.target_key)
                ));
            }
            for rel in incoming {
                block.push_str(&format!(
                    "  - {} --[{}]--> {}\n",
                    name_of(&rel.source_key),
                    rel.relation_type,
                    entity.name
                ));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Note paths behind the given entities; chunk ids when no path is known.
pub(crate) fn source_notes(graph: &KnowledgeGraph, keys: &[String]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| graph.entity_by_key(key))
        .flat_map(|entity| entity.source_chunk_ids.iter())
        .map(|chunk_id| {
            graph
                .source_path(chunk_id)
                .unwrap_or(chunk_id.as_str())
                .to_string()
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_phrase_respects_word_boundaries() {
        assert!(contains_phrase("what treats pain?", "pain"));
        assert!(contains_phrase("is car-t therapy new", "car-t therapy"));
        assert!(!contains_phrase("is painting relaxing", "pain"));
        assert!(!contains_phrase("anything", ""));
    }

    #[test]
    fn test_significant_words_drop_short_and_stopwords() {
        assert_eq!(
            significant_words("what does aspirin do for headaches"),
            vec!["aspirin".to_string(), "headaches".to_string()]
        );
    }
}
