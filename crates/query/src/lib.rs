mod context;
pub mod structural;

pub use structural::{EdgeInfo, EntityInfo, EntitySummary, GraphStats};

use extract::prompt::build_answer_prompt;
use extract::{CompletionRequest, LlmProvider, complete_with_timeout};
use graph::{GraphView, KnowledgeGraph};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const NO_ENTITIES_ANSWER: &str =
    "No relevant entities found in the knowledge graph for this question.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Cap on entities serialized into the answer context
    pub max_entities: usize,
    pub max_path_depth: usize,
    pub max_paths: usize,
    pub max_tokens: u32,
    pub search_limit: usize,
    pub top_entities: usize,
    pub bind: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_entities: 20,
            max_path_depth: 3,
            max_paths: 10,
            max_tokens: 3000,
            search_limit: 20,
            top_entities: 10,
            bind: "0.0.0.0:8002".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// Display names, most relevant first
    pub entities_considered: Vec<String>,
    pub sources: Vec<String>,
    /// Set when synthesis failed and `text` carries the raw graph context
    pub degraded: bool,
    pub trace: QueryTrace,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryTrace {
    pub entities_matched: usize,
    pub context_chars: usize,
    pub llm_calls: usize,
}

/// Read-only question answering and structural lookups over a built graph.
pub struct GraphQueryEngine {
    graph: KnowledgeGraph,
    view: GraphView,
    llm: Option<Arc<dyn LlmProvider>>,
    config: QueryConfig,
    request_timeout: Duration,
}

impl GraphQueryEngine {
    /// An engine without an LLM; `answer` returns the graph context as a degraded answer.
    pub fn new(graph: KnowledgeGraph, config: QueryConfig) -> Self {
        let view = graph.view();
        Self {
            graph,
            view,
            llm: None,
            config,
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>, request_timeout: Duration) -> Self {
        self.llm = Some(llm);
        self.request_timeout = request_timeout;
        self
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn answer(&self, question: &str) -> Answer {
        self.answer_with_limit(question, self.config.max_entities).await
    }

    pub async fn answer_with_limit(&self, question: &str, max_entities: usize) -> Answer {
        let keys = context::select_entities(&self.graph, question, max_entities);
        let entities_considered: Vec<String> = keys
            .iter()
            .filter_map(|key| self.graph.entity_by_key(key))
            .map(|e| e.name.clone())
            .collect();
        let sources = context::source_notes(&self.graph, &keys);

        if keys.is_empty() {
            tracing::info!(question, "No entities matched");
            return Answer {
                text: NO_ENTITIES_ANSWER.to_string(),
                entities_considered,
                sources,
                degraded: false,
                trace: QueryTrace::default(),
            };
        }

        let graph_context = context::format_context(&self.graph, &keys);
        let mut trace = QueryTrace {
            entities_matched: keys.len(),
            context_chars: graph_context.len(),
            llm_calls: 0,
        };
        tracing::debug!(
            entities = keys.len(),
            context_chars = graph_context.len(),
            "Built graph context"
        );

        let Some(llm) = &self.llm else {
            return degraded(graph_context, entities_considered, sources, trace);
        };

        let request = CompletionRequest::new(
            build_answer_prompt(question, &graph_context),
            self.config.max_tokens,
        );
        trace.llm_calls = 1;
        match complete_with_timeout(llm.as_ref(), &request, self.request_timeout).await {
            Ok(completion) => Answer {
                text: completion.text.trim().to_string(),
                entities_considered,
                sources,
                degraded: false,
                trace,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Answer synthesis failed, returning graph context");
                degraded(graph_context, entities_considered, sources, trace)
            }
        }
    }

    pub fn get_entity_info(&self, name: &str) -> Option<EntityInfo> {
        structural::entity_info(&self.graph, name)
    }

    pub fn find_paths(&self, source: &str, target: &str, max_depth: usize) -> Vec<Vec<String>> {
        structural::find_paths(
            &self.graph,
            &self.view,
            source,
            target,
            max_depth,
            self.config.max_paths,
        )
    }

    pub fn search_entities(&self, query: &str, limit: usize) -> Vec<EntitySummary> {
        structural::search_entities(&self.graph, query, limit)
    }

    pub fn stats(&self, top_n: usize) -> GraphStats {
        structural::stats(&self.graph, &self.view, top_n)
    }
}

fn degraded(
    graph_context: String,
    entities_considered: Vec<String>,
    sources: Vec<String>,
    trace: QueryTrace,
) -> Answer {
    Answer {
        text: format!("Answer synthesis unavailable. Relevant graph facts:\n\n{graph_context}"),
        entities_considered,
        sources,
        degraded: true,
        trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use extract::{
        Completion, ExtractedEntity, ExtractedRelationship, ExtractionResult, LlmError, TokenUsage,
    };
    use std::sync::Mutex;

    struct MockLlm {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLlm {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err("service unavailable".to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            match &self.reply {
                Ok(text) => Ok(Completion {
                    text: text.clone(),
                    usage: TokenUsage::default(),
                }),
                Err(e) => Err(LlmError::Transient(e.clone())),
            }
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn entity(name: &str, entity_type: &str) -> ExtractedEntity {
        ExtractedEntity {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            description: format!("{name} description"),
        }
    }

    fn rel(source: &str, relation: &str, target: &str) -> ExtractedRelationship {
        ExtractedRelationship {
            source: source.to_string(),
            target: target.to_string(),
            relation_type: relation.to_string(),
        }
    }

    fn medical_graph() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        graph.merge(
            &ExtractionResult {
                entities: vec![
                    entity("Aspirin", "drug"),
                    entity("Headache", "condition"),
                    entity("Pain", "symptom"),
                ],
                relationships: vec![rel("Aspirin", "treats", "Headache")],
            },
            "c1",
        );
        graph.merge(
            &ExtractionResult {
                entities: vec![entity("Ibuprofen", "drug")],
                relationships: vec![
                    rel("Headache", "causes", "Pain"),
                    rel("Aspirin", "relieves", "Pain"),
                    rel("Ibuprofen", "interacts_with", "Aspirin"),
                ],
            },
            "c2",
        );
        graph.record_source("c1", "notes/pharmacology.md");
        graph
    }

    fn engine() -> GraphQueryEngine {
        GraphQueryEngine::new(medical_graph(), QueryConfig::default())
    }

    #[test]
    fn test_entity_info_has_both_directions() {
        let info = engine().get_entity_info("aspirin").unwrap();
        assert_eq!(info.name, "Aspirin");
        assert_eq!(info.degree, 3);
        assert!(info.outgoing.contains(&EdgeInfo {
            source: "Aspirin".into(),
            relation: "treats".into(),
            target: "Headache".into(),
        }));
        assert_eq!(info.incoming.len(), 1);
        assert_eq!(info.incoming[0].source, "Ibuprofen");
        assert!(info.sources.contains(&"notes/pharmacology.md".to_string()));
        assert!(info.sources.contains(&"c2".to_string()));
    }

    #[test]
    fn test_entity_info_resolves_partial_names() {
        let engine = engine();
        assert_eq!(engine.get_entity_info("\"Ibupro\"").unwrap().name, "Ibuprofen");
        assert!(engine.get_entity_info("Paracetamol").is_none());
    }

    #[test]
    fn test_find_paths_includes_direct_hop() {
        let paths = engine().find_paths("Aspirin", "Pain", 3);
        assert!(paths.contains(&vec!["Aspirin".to_string(), "Pain".to_string()]));
        assert!(paths.contains(&vec![
            "Aspirin".to_string(),
            "Headache".to_string(),
            "Pain".to_string()
        ]));
    }

    #[test]
    fn test_find_paths_respects_depth() {
        let engine = engine();
        let paths = engine.find_paths("Ibuprofen", "Pain", 1);
        assert!(paths.is_empty());
        let paths = engine.find_paths("Ibuprofen", "Pain", 2);
        assert_eq!(
            paths,
            vec![vec![
                "Ibuprofen".to_string(),
                "Aspirin".to_string(),
                "Pain".to_string()
            ]]
        );
    }

    #[test]
    fn test_find_paths_against_edge_direction() {
        let paths = engine().find_paths("Pain", "Aspirin", 1);
        assert_eq!(paths, vec![vec!["Pain".to_string(), "Aspirin".to_string()]]);
    }

    #[test]
    fn test_find_paths_same_entity_and_unknown() {
        let engine = engine();
        assert_eq!(engine.find_paths("Pain", "pain", 3), vec![vec!["Pain".to_string()]]);
        assert!(engine.find_paths("Aspirin", "Nothing here", 3).is_empty());
    }

    #[test]
    fn test_search_is_case_insensitive_and_ranked() {
        let engine = engine();
        let hits = engine.search_entities("asp", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Aspirin");

        let hits = engine.search_entities("A", 10);
        let names: Vec<_> = hits.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["Aspirin", "Headache", "Pain"]);
        assert_eq!(engine.search_entities("a", 1).len(), 1);
    }

    #[test]
    fn test_stats() {
        let stats = engine().stats(2);
        assert_eq!(stats.total_nodes, 4);
        assert_eq!(stats.total_edges, 4);
        assert!((stats.density - 4.0 / 12.0).abs() < 1e-9);
        assert!(stats.weakly_connected);
        assert_eq!(stats.entity_types.get("drug"), Some(&2));
        assert_eq!(stats.top_entities[0].name, "Aspirin");
        assert_eq!(stats.top_entities.len(), 2);
    }

    #[test]
    fn test_stats_on_empty_graph() {
        let stats = GraphQueryEngine::new(KnowledgeGraph::new(), QueryConfig::default()).stats(10);
        assert_eq!(stats.total_nodes, 0);
        assert_eq!(stats.density, 0.0);
        assert!(!stats.weakly_connected);
        assert!(stats.top_entities.is_empty());
    }

    #[tokio::test]
    async fn test_answer_sends_graph_context() {
        let llm = MockLlm::replying("  Aspirin treats headaches.  ");
        let engine = engine().with_llm(llm.clone(), Duration::from_secs(5));

        let answer = engine.answer("What does aspirin treat?").await;
        assert_eq!(answer.text, "Aspirin treats headaches.");
        assert!(!answer.degraded);
        assert_eq!(answer.entities_considered[0], "Aspirin");
        assert_eq!(answer.trace.llm_calls, 1);
        assert_eq!(llm.calls(), 1);

        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Entity: Aspirin"));
        assert!(prompt.contains("Aspirin --[treats]--> Headache"));
        assert!(prompt.contains("What does aspirin treat?"));
    }

    #[tokio::test]
    async fn test_answer_without_matches_skips_llm() {
        let llm = MockLlm::replying("should not be used");
        let engine = engine().with_llm(llm.clone(), Duration::from_secs(5));

        let answer = engine.answer("Who won the football match?").await;
        assert_eq!(answer.text, NO_ENTITIES_ANSWER);
        assert!(answer.entities_considered.is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_answer_degrades_on_llm_failure() {
        let llm = MockLlm::failing();
        let engine = engine().with_llm(llm.clone(), Duration::from_secs(5));

        let answer = engine.answer("Tell me about ibuprofen").await;
        assert!(answer.degraded);
        assert!(answer.text.contains("Entity: Ibuprofen"));
        assert!(answer.entities_considered.contains(&"Ibuprofen".to_string()));
        assert!(answer.entities_considered.contains(&"Aspirin".to_string()));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_answer_limit_caps_entities() {
        let engine = engine();
        let answer = engine.answer_with_limit("aspirin", 2).await;
        assert_eq!(answer.entities_considered.len(), 2);
        assert!(answer.degraded);
    }
}
