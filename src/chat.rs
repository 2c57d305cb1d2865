//! The tool-calling chat loop: one batch in, one assistant reply out.

use crate::config::{HistoryStrategy, RuntimeConfig};
use crate::error::{LlmError, Result};
use crate::llm::{ChatMessage, ChatOptions, LlmProviderDyn as _, SharedProvider, TokenUsage, ToolSpec};
use crate::progress::{Step, StepRecorder};
use crate::session::state::StoredMessage;
use crate::tools::{McpManager, ToolRegistry};
use std::sync::Arc;

/// Cap on a tool result embedded in a timeline step.
const STEP_RESULT_PREVIEW: usize = 200;

/// Outcome of one chat-loop invocation. The caller appends the
/// `{user, assistant}` pair to session history atomically with its state
/// write, so a failed loop leaves history untouched.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub reply: String,
    pub usage: TokenUsage,
    pub model: Option<String>,
    pub iterations: usize,
}

/// Chat loop over a provider and the session's tool surface.
pub struct ChatLoop {
    provider: SharedProvider,
    tools: Arc<ToolRegistry>,
    mcp: Option<Arc<McpManager>>,
}

impl ChatLoop {
    pub fn new(
        provider: SharedProvider,
        tools: Arc<ToolRegistry>,
        mcp: Option<Arc<McpManager>>,
    ) -> Self {
        Self {
            provider,
            tools,
            mcp,
        }
    }

    /// Run the loop for one combined user message against the given history.
    pub async fn run(
        &self,
        history: &[StoredMessage],
        combined_text: &str,
        config: &RuntimeConfig,
        recorder: &StepRecorder,
    ) -> Result<ChatTurn> {
        recorder.record(Step::Preparing);

        let registry = self.effective_registry().await;
        let specs = effective_specs(&registry, config.limits.max_tools);

        let mut conversation = build_conversation(history, combined_text, config);
        let options = ChatOptions::default();

        let mut usage = TokenUsage::default();
        let mut model = None;
        let mut iterations = 0usize;
        let max_iterations = config.limits.max_tool_iterations;

        recorder.record(Step::Thinking);
        let mut response = self.provider.chat(&conversation, &specs, &options).await?;
        accumulate(&mut usage, &mut model, &response.usage, &response.model);

        while !response.tool_calls.is_empty() && iterations < max_iterations {
            iterations += 1;
            recorder.record(Step::LlmIteration {
                iteration: iterations,
                max: max_iterations,
            });

            if response.tool_calls.len() > 1 {
                recorder.record(Step::ParallelTools {
                    names: response
                        .tool_calls
                        .iter()
                        .map(|call| call.name.clone())
                        .collect(),
                });
            }

            conversation.push(ChatMessage::assistant_with_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                recorder.record(Step::ToolStart {
                    name: call.name.clone(),
                });
                let started = std::time::Instant::now();

                let output = match registry.call(&call.name, &call.arguments).await {
                    Ok(result) => {
                        recorder.record(Step::ToolComplete {
                            name: call.name.clone(),
                            result: preview(&result),
                            duration_ms: started.elapsed().as_millis() as u64,
                        });
                        result
                    }
                    Err(failure) => {
                        recorder.record(Step::ToolError {
                            name: call.name.clone(),
                            error: failure.to_string(),
                        });
                        tracing::debug!(tool = %call.name, error = %failure, "tool call failed");
                        format!("Error: {failure}")
                    }
                };

                conversation.push(ChatMessage::tool_result(call.id.clone(), output));
            }

            response = self.provider.chat(&conversation, &specs, &options).await?;
            accumulate(&mut usage, &mut model, &response.usage, &response.model);
        }

        if !response.tool_calls.is_empty() {
            tracing::warn!(
                max_iterations,
                "tool-call iteration cap reached, replying with last content"
            );
        }

        if response.content.is_empty() {
            return Err(LlmError::BadResponse("assistant returned empty content".into()).into());
        }

        Ok(ChatTurn {
            reply: response.content,
            usage,
            model,
            iterations,
        })
    }

    /// Built-in tools plus any connected remote tools, deduplicated by name
    /// (first definition wins).
    async fn effective_registry(&self) -> ToolRegistry {
        let mut registry = self.tools.as_ref().clone();

        if let Some(mcp) = &self.mcp
            && mcp.is_configured()
        {
            mcp.ensure_initialized().await;
            for tool in mcp.remote_tools().await {
                registry.register(tool);
            }
        }

        registry
    }
}

fn effective_specs(registry: &ToolRegistry, max_tools: Option<usize>) -> Vec<ToolSpec> {
    let mut specs = registry.specs();
    if let Some(max) = max_tools
        && specs.len() > max
    {
        tracing::warn!(
            exposed = max,
            available = specs.len(),
            "tool cap reached, truncating"
        );
        specs.truncate(max);
    }
    specs
}

/// Build the LLM input from system prompt, history, and the combined text.
fn build_conversation(
    history: &[StoredMessage],
    combined_text: &str,
    config: &RuntimeConfig,
) -> Vec<ChatMessage> {
    let trimmed = if history.len() > config.limits.max_history {
        &history[history.len() - config.limits.max_history..]
    } else {
        history
    };

    let mut conversation = Vec::new();
    if let Some(system) = &config.system_prompt {
        conversation.push(ChatMessage::system(system.clone()));
    }

    match config.history_strategy {
        HistoryStrategy::MultiTurn => {
            for message in trimmed {
                conversation.push(ChatMessage {
                    role: message.role,
                    content: message.content.clone(),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                });
            }
            conversation.push(ChatMessage::user(combined_text));
        }
        HistoryStrategy::InlineTagged => {
            let mut text = String::new();
            if !trimmed.is_empty() {
                text.push_str("<conversation_history>\n");
                for message in trimmed {
                    text.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
                }
                text.push_str("</conversation_history>\n\n");
            }
            text.push_str(combined_text);
            conversation.push(ChatMessage::user(text));
        }
    }

    conversation
}

fn accumulate(
    usage: &mut TokenUsage,
    model: &mut Option<String>,
    response_usage: &Option<TokenUsage>,
    response_model: &Option<String>,
) {
    if let Some(response_usage) = response_usage {
        usage.add(*response_usage);
    }
    if model.is_none() {
        model.clone_from(response_model);
    }
}

fn preview(result: &str) -> String {
    if result.len() <= STEP_RESULT_PREVIEW {
        return result.to_string();
    }
    let end = result
        .char_indices()
        .take_while(|(index, _)| *index < STEP_RESULT_PREVIEW)
        .last()
        .map(|(index, c)| index + c.len_utf8())
        .unwrap_or(0);
    format!("{}…", &result[..end])
}

/// Scripted provider shared by the chat-loop, router, and actor tests.
#[cfg(test)]
pub(crate) mod test_provider {
    use crate::error::Result;
    use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmProvider, ToolSpec};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub struct ScriptedProvider {
        script: Mutex<VecDeque<Result<ChatResponse>>>,
        fallback: Option<String>,
        hang_when_exhausted: bool,
        pub calls: Mutex<Vec<(Vec<ChatMessage>, Vec<ToolSpec>)>>,
    }

    impl ScriptedProvider {
        pub fn new(script: Vec<Result<ChatResponse>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                fallback: None,
                hang_when_exhausted: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Provider that answers every call with the same text.
        pub fn always(text: &str) -> Self {
            let mut provider = Self::new(Vec::new());
            provider.fallback = Some(text.to_string());
            provider
        }

        /// After the script runs out, never resolve (for ceiling tests).
        pub fn hang_when_exhausted(mut self) -> Self {
            self.hang_when_exhausted = true;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().expect("calls poisoned").len()
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolSpec],
            _options: &ChatOptions,
        ) -> Result<ChatResponse> {
            self.calls
                .lock()
                .expect("calls poisoned")
                .push((messages.to_vec(), tools.to_vec()));

            if let Some(next) = self.script.lock().expect("script poisoned").pop_front() {
                return next;
            }
            if let Some(fallback) = &self.fallback {
                return Ok(ChatResponse {
                    content: fallback.clone(),
                    ..ChatResponse::default()
                });
            }
            if self.hang_when_exhausted {
                std::future::pending::<()>().await;
            }
            Err(crate::error::LlmError::Unavailable("script exhausted".into()).into())
        }
    }
}
