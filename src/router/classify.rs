//! Query classification: deterministic rules with an LLM fallback.

use crate::llm::{ChatMessage, ChatOptions, LlmProviderDyn as _, SharedProvider};
use serde::{Deserialize, Serialize};

/// Worker a query is routed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTarget {
    Simple,
    Code,
    Research,
    General,
    Orchestrator,
}

impl WorkerTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerTarget::Simple => "simple",
            WorkerTarget::Code => "code",
            WorkerTarget::Research => "research",
            WorkerTarget::General => "general",
            WorkerTarget::Orchestrator => "orchestrator",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "simple" => Some(WorkerTarget::Simple),
            "code" => Some(WorkerTarget::Code),
            "research" => Some(WorkerTarget::Research),
            "general" => Some(WorkerTarget::General),
            "orchestrator" => Some(WorkerTarget::Orchestrator),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rough effort estimate, used for logging and the event record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    Low,
    Medium,
    High,
}

/// Outcome of classifying one combined query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    pub target: WorkerTarget,
    pub category: String,
    pub complexity: QueryComplexity,
}

impl Classification {
    fn new(target: WorkerTarget, category: &str, complexity: QueryComplexity) -> Self {
        Self {
            target,
            category: category.to_string(),
            complexity,
        }
    }

    /// Compact form stored on the event record.
    pub fn label(&self) -> String {
        format!("{}/{}", self.target, self.category)
    }
}

const CODE_MARKERS: [&str; 10] = [
    "code", "function", "compile", "bug", "stack trace", "refactor", "script", "regex",
    "implement", "debug",
];

const RESEARCH_MARKERS: [&str; 8] = [
    "search", "look up", "latest", "news", "find out", "research", "what happened", "current",
];

const MULTI_STEP_MARKERS: [&str; 6] = [
    "and then", "after that", "step by step", "first ", "finally", "plan",
];

const GREETINGS: [&str; 8] = [
    "hi", "hello", "hey", "thanks", "thank you", "ok", "yes", "no",
];

/// Deterministic classification rules. Returns None when no rule fires.
pub fn classify_rules(query: &str) -> Option<Classification> {
    let lowered = query.to_lowercase();
    let word_count = lowered.split_whitespace().count();

    if word_count <= 4
        && GREETINGS
            .iter()
            .any(|greeting| lowered.trim_end_matches(['!', '.', '?']) == *greeting)
    {
        return Some(Classification::new(
            WorkerTarget::Simple,
            "greeting",
            QueryComplexity::Low,
        ));
    }

    let multi_step = MULTI_STEP_MARKERS
        .iter()
        .filter(|marker| lowered.contains(*marker))
        .count()
        >= 2
        || lowered.lines().filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("1.") || trimmed.starts_with("2.") || trimmed.starts_with("- ")
        }).count()
            >= 2;
    if multi_step {
        return Some(Classification::new(
            WorkerTarget::Orchestrator,
            "multi_step",
            QueryComplexity::High,
        ));
    }

    if CODE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return Some(Classification::new(
            WorkerTarget::Code,
            "code",
            QueryComplexity::Medium,
        ));
    }

    if RESEARCH_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return Some(Classification::new(
            WorkerTarget::Research,
            "research",
            QueryComplexity::Medium,
        ));
    }

    None
}

const CLASSIFY_PROMPT: &str = "Classify the user query into exactly one of: \
simple, code, research, general, orchestrator. \
Use 'orchestrator' only for tasks needing several dependent steps. \
Reply with the single word, nothing else.";

/// Classify via rules first, then one LLM call, then the general fallback.
pub async fn classify(query: &str, provider: &SharedProvider) -> Classification {
    if let Some(classification) = classify_rules(query) {
        return classification;
    }

    let messages = [
        ChatMessage::system(CLASSIFY_PROMPT),
        ChatMessage::user(query),
    ];
    match provider.chat(&messages, &[], &ChatOptions::default()).await {
        Ok(response) => {
            if let Some(target) = WorkerTarget::from_label(&response.content) {
                return Classification::new(target, "llm", QueryComplexity::Medium);
            }
            tracing::debug!(
                label = %response.content,
                "classifier returned an unknown label, using general"
            );
            Classification::new(WorkerTarget::General, "fallback", QueryComplexity::Medium)
        }
        Err(error) => {
            tracing::debug!(%error, "llm classification failed, using general");
            Classification::new(WorkerTarget::General, "fallback", QueryComplexity::Medium)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::test_provider::ScriptedProvider;
    use crate::llm::ChatResponse;
    use std::sync::Arc;

    #[test]
    fn greetings_are_simple() {
        assert_eq!(
            classify_rules("hello").map(|c| c.target),
            Some(WorkerTarget::Simple)
        );
        assert_eq!(
            classify_rules("thanks!").map(|c| c.target),
            Some(WorkerTarget::Simple)
        );
        // Greeting word inside a longer query does not count.
        assert_ne!(
            classify_rules("hello can you refactor this function").map(|c| c.target),
            Some(WorkerTarget::Simple)
        );
    }

    #[test]
    fn code_and_research_markers_route() {
        assert_eq!(
            classify_rules("why does this function not compile").map(|c| c.target),
            Some(WorkerTarget::Code)
        );
        assert_eq!(
            classify_rules("look up the latest release notes").map(|c| c.target),
            Some(WorkerTarget::Research)
        );
    }

    #[test]
    fn multi_step_queries_go_to_the_orchestrator() {
        let query = "first fetch the data and then summarize it, finally email me";
        assert_eq!(
            classify_rules(query).map(|c| c.target),
            Some(WorkerTarget::Orchestrator)
        );

        let listed = "do these:\n1. download logs\n2. count errors";
        assert_eq!(
            classify_rules(listed).map(|c| c.target),
            Some(WorkerTarget::Orchestrator)
        );
    }

    #[tokio::test]
    async fn llm_fallback_parses_single_word_labels() {
        let provider: crate::llm::SharedProvider = Arc::new(ScriptedProvider::new(vec![Ok(
            ChatResponse {
                content: "Research\n".into(),
                ..ChatResponse::default()
            },
        )]));

        let classification = classify("tell me about quiet quiet things", &provider).await;
        assert_eq!(classification.target, WorkerTarget::Research);
        assert_eq!(classification.category, "llm");
    }

    #[tokio::test]
    async fn classifier_failure_falls_back_to_general() {
        let provider: crate::llm::SharedProvider = Arc::new(ScriptedProvider::new(vec![Err(
            crate::error::LlmError::Unavailable("down".into()).into(),
        )]));

        let classification = classify("an unclassifiable query", &provider).await;
        assert_eq!(classification.target, WorkerTarget::General);
        assert_eq!(classification.category, "fallback");
    }
}
