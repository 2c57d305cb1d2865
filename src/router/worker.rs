//! Worker capability: synchronous RPC and fire-and-forget execution.

use crate::chat::ChatLoop;
use crate::clock::SharedClock;
use crate::config::RuntimeConfig;
use crate::error::{Result, SessionError, TransportError};
use crate::llm::TokenUsage;
use crate::progress::{StepRecorder, render_final};
use crate::router::classify::WorkerTarget;
use crate::session::state::StoredMessage;
use crate::transport::{SharedTransport, TransportDyn as _};
use crate::{ExecutionId, Platform, ResponseTarget, SessionKey};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a worker is asked to do.
#[derive(Debug, Clone)]
pub struct WorkerInput {
    pub execution_id: ExecutionId,
    pub query: String,
    pub history: Vec<StoredMessage>,
    pub session: SessionKey,
    pub event_id: Option<String>,
}

/// What a worker produced.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub success: bool,
    pub content: String,
    /// Turns to merge into session history on success.
    pub new_messages: Vec<StoredMessage>,
    pub error: Option<String>,
    pub usage: TokenUsage,
}

/// Receipt for a fire-and-forget dispatch. The caller MUST NOT await the
/// final reply; it arrives through the completion channel.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledExecution {
    pub scheduled: bool,
    pub execution_id: ExecutionId,
}

/// Completion callback from an asynchronous worker.
#[derive(Debug, Clone)]
pub struct WorkerCompletion {
    pub session: SessionKey,
    pub execution_id: ExecutionId,
    pub result: WorkerResult,
    pub target: ResponseTarget,
}

/// Signals async workers send back to the runtime.
#[derive(Debug, Clone)]
pub enum WorkerSignal {
    /// Liveness/progress update; bumps the session heartbeat.
    Progress {
        session: SessionKey,
        execution_id: ExecutionId,
        status: String,
    },
    Complete(Box<WorkerCompletion>),
}

/// Worker lifecycle state for an in-flight execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Done,
    Failed,
}

impl WorkerState {
    /// Check if the worker can transition to a new state.
    pub fn can_transition_to(self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!((self, target), (Running, Done) | (Running, Failed))
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_state: WorkerState) -> Result<()> {
        if !self.can_transition_to(new_state) {
            return Err(SessionError::InvalidStateTransition(format!(
                "can't transition from {self:?} to {new_state:?}"
            ))
            .into());
        }
        *self = new_state;
        Ok(())
    }
}

/// Static trait for workers.
pub trait WorkerClient: Send + Sync + 'static {
    /// Name used in routing data and event records.
    fn name(&self) -> &str;

    /// Synchronous RPC: block until the worker finishes.
    fn execute(
        &self,
        input: WorkerInput,
    ) -> impl std::future::Future<Output = Result<WorkerResult>> + Send;

    /// Fire-and-forget: the worker owns delivery to `target` and completes
    /// the session through the completion channel.
    fn schedule_execution(
        &self,
        input: WorkerInput,
        target: ResponseTarget,
    ) -> impl std::future::Future<Output = Result<ScheduledExecution>> + Send;
}

/// Dynamic trait for runtime polymorphism.
pub trait WorkerClientDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn execute<'a>(
        &'a self,
        input: WorkerInput,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<WorkerResult>> + Send + 'a>>;

    fn schedule_execution<'a>(
        &'a self,
        input: WorkerInput,
        target: ResponseTarget,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<ScheduledExecution>> + Send + 'a>>;
}

/// Blanket implementation: any `WorkerClient` is a `WorkerClientDyn`.
impl<T: WorkerClient> WorkerClientDyn for T {
    fn name(&self) -> &str {
        WorkerClient::name(self)
    }

    fn execute<'a>(
        &'a self,
        input: WorkerInput,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<WorkerResult>> + Send + 'a>> {
        Box::pin(WorkerClient::execute(self, input))
    }

    fn schedule_execution<'a>(
        &'a self,
        input: WorkerInput,
        target: ResponseTarget,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<ScheduledExecution>> + Send + 'a>> {
        Box::pin(WorkerClient::schedule_execution(self, input, target))
    }
}

/// Shared worker handle.
pub type SharedWorker = Arc<dyn WorkerClientDyn>;

/// Explicit worker lookup table, passed in at construction.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerTarget, SharedWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target: WorkerTarget, worker: SharedWorker) {
        self.workers.insert(target, worker);
    }

    pub fn lookup(&self, target: WorkerTarget) -> Option<SharedWorker> {
        self.workers.get(&target).cloned()
    }
}

/// Deliver text to a response target: edit the progress message in place,
/// fall back to a fresh send.
pub async fn deliver(
    transports: &HashMap<Platform, SharedTransport>,
    target: &ResponseTarget,
    text: &str,
) -> Result<()> {
    let transport = transports.get(&target.session.platform).ok_or_else(|| {
        TransportError::Permanent(format!(
            "no transport registered for platform {}",
            target.session.platform
        ))
    })?;

    let rendered = render_final(transport.markup(), text, None);

    if let Some(message_ref) = &target.message_ref {
        match transport.edit(&target.origin, message_ref, &rendered).await {
            Ok(()) => return Ok(()),
            Err(error) => {
                tracing::debug!(%error, "final edit failed, sending a new message");
            }
        }
    }

    transport.send(&target.origin, &rendered).await.map(|_| ())
}

/// In-process worker that answers with the chat loop.
pub struct ChatWorker {
    label: String,
    chat: Arc<ChatLoop>,
    config: Arc<ArcSwap<RuntimeConfig>>,
    transports: Arc<HashMap<Platform, SharedTransport>>,
    clock: SharedClock,
    signal_tx: mpsc::Sender<WorkerSignal>,
}

impl ChatWorker {
    pub fn new(
        label: impl Into<String>,
        chat: Arc<ChatLoop>,
        config: Arc<ArcSwap<RuntimeConfig>>,
        transports: Arc<HashMap<Platform, SharedTransport>>,
        clock: SharedClock,
        signal_tx: mpsc::Sender<WorkerSignal>,
    ) -> Self {
        Self {
            label: label.into(),
            chat,
            config,
            transports,
            clock,
            signal_tx,
        }
    }

    async fn run_chat(&self, input: &WorkerInput) -> Result<WorkerResult> {
        let recorder = StepRecorder::new(self.clock.clone());
        let config = self.config.load_full();
        let turn = self
            .chat
            .run(&input.history, &input.query, &config, &recorder)
            .await?;

        Ok(WorkerResult {
            success: true,
            content: turn.reply.clone(),
            new_messages: vec![
                StoredMessage::user(input.query.clone()),
                StoredMessage::assistant(turn.reply),
            ],
            error: None,
            usage: turn.usage,
        })
    }
}

impl WorkerClient for ChatWorker {
    fn name(&self) -> &str {
        &self.label
    }

    async fn execute(&self, input: WorkerInput) -> Result<WorkerResult> {
        self.run_chat(&input).await
    }

    async fn schedule_execution(
        &self,
        input: WorkerInput,
        target: ResponseTarget,
    ) -> Result<ScheduledExecution> {
        let execution_id = input.execution_id;
        let worker = self.label.clone();
        let chat = self.chat.clone();
        let config = self.config.clone();
        let transports = self.transports.clone();
        let clock = self.clock.clone();
        let signal_tx = self.signal_tx.clone();

        tokio::spawn(async move {
            let mut state = WorkerState::Running;
            let _ = signal_tx
                .send(WorkerSignal::Progress {
                    session: input.session.clone(),
                    execution_id,
                    status: "started".into(),
                })
                .await;

            let recorder = StepRecorder::new(clock.clone());
            let loaded = config.load_full();
            let interval = loaded.timing.rotation_interval;

            let chat_future = chat.run(&input.history, &input.query, &loaded, &recorder);
            tokio::pin!(chat_future);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            let outcome = loop {
                tokio::select! {
                    outcome = &mut chat_future => break outcome,
                    _ = ticker.tick() => {
                        let _ = signal_tx
                            .send(WorkerSignal::Progress {
                                session: input.session.clone(),
                                execution_id,
                                status: "working".into(),
                            })
                            .await;
                    }
                }
            };

            let result = match outcome {
                Ok(turn) => {
                    let _ = state.transition_to(WorkerState::Done);
                    WorkerResult {
                        success: true,
                        content: turn.reply.clone(),
                        new_messages: vec![
                            StoredMessage::user(input.query.clone()),
                            StoredMessage::assistant(turn.reply),
                        ],
                        error: None,
                        usage: turn.usage,
                    }
                }
                Err(error) => {
                    let _ = state.transition_to(WorkerState::Failed);
                    tracing::warn!(%error, worker = %worker, "scheduled execution failed");
                    WorkerResult {
                        success: false,
                        content: "Something went wrong while working on that. Please try again."
                            .into(),
                        new_messages: Vec::new(),
                        error: Some(error.to_string()),
                        usage: TokenUsage::default(),
                    }
                }
            };

            if let Err(error) = deliver(&transports, &target, &result.content).await {
                tracing::warn!(%error, "failed to deliver worker reply");
            }

            let _ = signal_tx
                .send(WorkerSignal::Complete(Box::new(WorkerCompletion {
                    session: input.session.clone(),
                    execution_id,
                    result,
                    target,
                })))
                .await;
        });

        Ok(ScheduledExecution {
            scheduled: true,
            execution_id,
        })
    }
}
