use crate::error::truncate;

pub fn build_extraction_prompt(chunk_text: &str, source_name: &str, max_chars: usize) -> String {
    format!(
        r#"Analyze this text from a personal knowledge base and extract:

1. Entities: important concepts, people, places, treatments, technologies, projects, etc.
2. Relationships: how these entities relate to each other

Text to analyze:
<text>
{}
</text>

Source: {}

Return ONLY valid JSON, no markdown, no explanations:

{{
  "entities": [
    {{"name": "Entity Name", "type": "person|treatment|concept|technology|event|project|location|medication|condition", "description": "Brief description"}}
  ],
  "relationships": [
    {{"source": "Entity1 Name", "target": "Entity2 Name", "type": "treats|causes|uses|creates|relates_to|part_of|used_in|leads_to"}}
  ]
}}

RULES:
- Relationship source and target must use entity names exactly as listed in "entities"
- Use lowercase relationship types
- If nothing is worth extracting, return {{"entities": [], "relationships": []}}"#,
        truncate(chunk_text, max_chars),
        source_name
    )
}

/// Prompt for a retry after the previous response could not be parsed.
pub fn build_strict_extraction_prompt(chunk_text: &str, source_name: &str, max_chars: usize) -> String {
    let mut prompt = build_extraction_prompt(chunk_text, source_name, max_chars);
    prompt.push_str(
        "\n\nYour previous answer was not valid JSON. Respond with a single JSON object and nothing else. Keep descriptions short so the object is complete.",
    );
    prompt
}

pub fn build_answer_prompt(question: &str, graph_context: &str) -> String {
    format!(
        r#"You are analyzing a personal knowledge graph. Answer the user's question based on the graph structure and relationships.

Knowledge Graph Context:
<graph>
{}
</graph>

User Question: {}

Provide an answer that:
1. Identifies relevant entities and relationships
2. Explains connections and paths between concepts
3. Cites specific entities when relevant

If the graph doesn't contain enough information, say so clearly."#,
        graph_context, question
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_prompt_truncates_text() {
        let text = "a".repeat(9000);
        let prompt = build_extraction_prompt(&text, "note.md", 8000);
        assert!(prompt.contains(&"a".repeat(8000)));
        assert!(!prompt.contains(&"a".repeat(8001)));
        assert!(prompt.contains("Source: note.md"));
    }

    #[test]
    fn test_strict_prompt_extends_base() {
        let prompt = build_strict_extraction_prompt("Aspirin treats headache.", "meds.md", 8000);
        assert!(prompt.starts_with("Analyze this text"));
        assert!(prompt.contains("not valid JSON"));
    }

    #[test]
    fn test_answer_prompt_embeds_context() {
        let prompt = build_answer_prompt("What treats headache?", "Entity: Aspirin");
        assert!(prompt.contains("<graph>\nEntity: Aspirin\n</graph>"));
        assert!(prompt.contains("User Question: What treats headache?"));
    }
}
