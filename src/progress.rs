//! Progress reporting: the thinking rotator, the step timeline, and the
//! final render.

use crate::clock::{Clock as _, SharedClock};
use crate::llm::TokenUsage;
use crate::transport::{Markup, SharedTransport, TransportDyn as _};
use crate::{MessageRef, ReplyOrigin};
use chrono::{DateTime, Utc};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Cyclic, semantically neutral thinking messages.
const THINKING_PHRASES: [&str; 5] = [
    "Thinking…",
    "Working on it…",
    "Crunching…",
    "Still on it…",
    "Almost there…",
];

/// First phrase shown when the progress message is created.
pub fn initial_phrase() -> &'static str {
    THINKING_PHRASES[0]
}

/// Typed execution steps accumulated while a batch runs.
#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Thinking,
    Preparing,
    Routing {
        agent: String,
    },
    LlmIteration {
        iteration: usize,
        max: usize,
    },
    ToolStart {
        name: String,
    },
    ToolComplete {
        name: String,
        result: String,
        duration_ms: u64,
    },
    ToolError {
        name: String,
        error: String,
    },
    ParallelTools {
        names: Vec<String>,
    },
    Subagent {
        name: String,
        status: String,
    },
}

/// One step with its timestamp.
#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct RecordedStep {
    pub step: Step,
    pub at: DateTime<Utc>,
}

/// Ordered step trail for one batch execution.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StepTimeline {
    pub steps: Vec<RecordedStep>,
}

impl StepTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Step, at: DateTime<Utc>) {
        self.steps.push(RecordedStep { step, at });
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Expandable line-per-step rendering for admin users.
    pub fn render_admin(&self) -> String {
        let mut output = String::new();
        for recorded in &self.steps {
            let line = match &recorded.step {
                Step::Thinking => "thinking".to_string(),
                Step::Preparing => "preparing".to_string(),
                Step::Routing { agent } => format!("routed to {agent}"),
                Step::LlmIteration { iteration, max } => format!("llm iteration {iteration}/{max}"),
                Step::ToolStart { name } => format!("tool {name} started"),
                Step::ToolComplete {
                    name, duration_ms, ..
                } => format!("tool {name} done in {duration_ms}ms"),
                Step::ToolError { name, error } => format!("tool {name} failed: {error}"),
                Step::ParallelTools { names } => format!("parallel tools: {}", names.join(", ")),
                Step::Subagent { name, status } => format!("subagent {name}: {status}"),
            };
            output.push_str(&format!("• {} {line}\n", recorded.at.format("%H:%M:%S")));
        }
        output
    }

    /// Compact one-line summary for everyone else.
    pub fn render_summary(&self) -> String {
        let tool_calls = self
            .steps
            .iter()
            .filter(|recorded| matches!(recorded.step, Step::ToolComplete { .. }))
            .count();
        let tool_errors = self
            .steps
            .iter()
            .filter(|recorded| matches!(recorded.step, Step::ToolError { .. }))
            .count();
        let iterations = self
            .steps
            .iter()
            .filter(|recorded| matches!(recorded.step, Step::LlmIteration { .. }))
            .count();

        let mut parts = Vec::new();
        if iterations > 0 {
            parts.push(format!("{iterations} llm iterations"));
        }
        if tool_calls > 0 {
            parts.push(format!("{tool_calls} tool calls"));
        }
        if tool_errors > 0 {
            parts.push(format!("{tool_errors} tool errors"));
        }
        parts.join(" · ")
    }
}

/// Shared, cheaply clonable step sink handed to the chat loop and router.
#[derive(Clone)]
pub struct StepRecorder {
    timeline: Arc<Mutex<StepTimeline>>,
    clock: SharedClock,
}

impl StepRecorder {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            timeline: Arc::new(Mutex::new(StepTimeline::new())),
            clock,
        }
    }

    pub fn record(&self, step: Step) {
        let at = self.clock.now();
        self.timeline
            .lock()
            .expect("timeline poisoned")
            .push(step, at);
    }

    pub fn snapshot(&self) -> StepTimeline {
        self.timeline.lock().expect("timeline poisoned").clone()
    }
}

/// Heartbeat receiver the rotator drives.
///
/// Kept separate from the transport edit so UI failures (deleted progress
/// message, rate limits) can never starve stuck detection.
pub trait HeartbeatSink: Send + Sync + 'static {
    fn beat(&self) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;
}

/// Periodic progress updater; doubles as the liveness beacon.
pub struct Rotator {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Rotator {
    /// Start ticking every `interval`. Each tick beats the heartbeat first,
    /// then refreshes typing, then attempts the rotating edit.
    pub fn start(
        transport: SharedTransport,
        origin: ReplyOrigin,
        message_ref: MessageRef,
        heartbeat: Arc<dyn HeartbeatSink>,
        interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut phrase_index = 1usize;
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately; the
            // initial phrase was already sent, so consume it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        heartbeat.beat().await;

                        if let Err(error) = transport.typing(&origin).await {
                            tracing::debug!(%error, "typing refresh failed");
                        }

                        let phrase = THINKING_PHRASES[phrase_index % THINKING_PHRASES.len()];
                        phrase_index += 1;
                        if let Err(error) = transport.edit(&origin, &message_ref, phrase).await {
                            tracing::debug!(%error, "progress edit failed");
                        }
                    }
                    result = stop_rx.changed() => {
                        if result.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { stop_tx, task }
    }

    /// Ask the rotator to stop after any in-flight tick.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Await the rotator task so a stale tick can never clobber the final
    /// edit. Call after `stop`.
    pub async fn wait_for_pending(self) {
        if let Err(error) = self.task.await {
            if !error.is_cancelled() {
                tracing::warn!(%error, "rotator task panicked");
            }
        }
    }
}

/// Reduce assistant markup to what the transport can render.
pub fn sanitize_for(markup: Markup, text: &str) -> String {
    match markup {
        Markup::Markdown => text.to_string(),
        Markup::Html => text
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;"),
        Markup::Plain => strip_markdown(text),
    }
}

fn strip_markdown(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    for line in text.lines() {
        let line = line.trim_start_matches('#').trim_start();
        let mut stripped = line.replace("**", "").replace("__", "").replace('`', "");
        // [label](url) -> label (url)
        while let (Some(open), Some(close)) = (stripped.find('['), stripped.find("](")) {
            if open < close {
                let Some(end) = stripped[close..].find(')') else {
                    break;
                };
                let label = stripped[open + 1..close].to_string();
                let url = stripped[close + 2..close + end].to_string();
                stripped.replace_range(open..close + end + 1, &format!("{label} ({url})"));
            } else {
                break;
            }
        }
        output.push_str(&stripped);
        output.push('\n');
    }
    output.trim_end().to_string()
}

/// Debug footer appended for admin users.
pub struct DebugFooter<'a> {
    pub timeline: &'a StepTimeline,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub model: Option<&'a str>,
}

/// Compose the final message text: sanitised reply plus optional footer.
pub fn render_final(markup: Markup, reply: &str, footer: Option<DebugFooter<'_>>) -> String {
    let mut output = sanitize_for(markup, reply);

    if let Some(footer) = footer {
        output.push_str("\n\n—\n");
        output.push_str(&format!(
            "{}ms · in {} out {} tokens",
            footer.duration_ms, footer.usage.input, footer.usage.output
        ));
        if let Some(model) = footer.model {
            output.push_str(&format!(" · {model}"));
        }
        output.push('\n');
        if !footer.timeline.is_empty() {
            output.push_str(&footer.timeline.render_admin());
        }
    }

    output.trim_end().to_string()
}
