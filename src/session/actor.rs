//! The per-session actor: mailbox loop, alarm, and single-flight batch
//! processing with retry and failover.

use crate::clock::{Clock as _, SharedClock};
use crate::commands::{self, Command};
use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, LlmError, Result, RouterError, SessionError, TransportError};
use crate::llm::{SharedProvider, TokenUsage};
use crate::observability::{EventPatch, EventSink as _, EventStatus, SharedSink, background};
use crate::progress::{
    DebugFooter, HeartbeatSink, Rotator, StepRecorder, initial_phrase, render_final,
};
use crate::router::{Router, RouterContext, WorkerCompletion};
use crate::session::queue::{self, ScheduleReason};
use crate::session::state::{
    Batch, BatchStage, BatchStatus, PendingMessage, SessionState, StoredMessage, StuckPolicy,
    WorkflowRef,
};
use crate::session::store::{SessionStoreDyn as _, SharedStore};
use crate::tools::{McpManager, ToolRegistry};
use crate::transport::{SharedTransport, TransportDyn as _};
use crate::{BatchId, ExecutionId, ParsedInput, Platform, ReplyOrigin, ResponseTarget, SessionKey};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, oneshot};

/// Short debounce between the first message of a batch and its alarm, so a
/// burst lands in one promotion.
const BATCH_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(250);

/// Mailbox depth per session.
const MAILBOX_DEPTH: usize = 64;

/// Generic user-facing failure text.
const APOLOGY_MESSAGE: &str =
    "Sorry, something went wrong while handling that. Please try again.";

/// Receipt returned by `receive`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReceiveReceipt {
    pub trace_id: String,
    pub queued: bool,
    pub batch_id: Option<BatchId>,
}

/// Read-only view of the two batches for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchStateView {
    pub active: Option<BatchView>,
    pub pending: Option<BatchView>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchView {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub message_count: usize,
    pub retry_count: u32,
    pub current_stage: BatchStage,
}

impl BatchView {
    fn from_batch(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            status: batch.status,
            message_count: batch.pending_messages.len(),
            retry_count: batch.retry_count,
            current_stage: batch.current_stage,
        }
    }
}

/// Commands accepted by a session actor.
pub enum SessionCommand {
    Receive {
        input: ParsedInput,
        reply: oneshot::Sender<ReceiveReceipt>,
    },
    /// Synchronous path: no batching, immediate reply delivery.
    HandleDirect {
        input: ParsedInput,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Inline-button callback, already split into `action` and `payload`.
    Callback {
        action: String,
        payload: String,
        reply: oneshot::Sender<Option<String>>,
    },
    WorkerProgress {
        execution_id: ExecutionId,
        status: String,
    },
    WorkerComplete {
        completion: Box<WorkerCompletion>,
    },
    ClearHistory {
        reply: oneshot::Sender<String>,
    },
    Recover {
        reply: oneshot::Sender<String>,
    },
    BatchState {
        reply: oneshot::Sender<BatchStateView>,
    },
    GetMetadata {
        reply: oneshot::Sender<HashMap<String, serde_json::Value>>,
    },
    SetMetadata {
        key: String,
        value: serde_json::Value,
        reply: oneshot::Sender<()>,
    },
}

/// Shared dependency bundle for session actors.
#[derive(Clone)]
pub struct SessionDeps {
    pub clock: SharedClock,
    pub store: SharedStore,
    pub transports: Arc<HashMap<Platform, SharedTransport>>,
    pub provider: SharedProvider,
    pub tools: Arc<ToolRegistry>,
    pub router: Option<Arc<Router>>,
    pub sink: SharedSink,
    pub config: Arc<ArcSwap<RuntimeConfig>>,
}

impl SessionDeps {
    fn transport(&self, platform: Platform) -> Result<SharedTransport> {
        self.transports.get(&platform).cloned().ok_or_else(|| {
            TransportError::Permanent(format!("no transport registered for platform {platform}"))
                .into()
        })
    }
}

/// Cheap handle used by the runtime to talk to one actor.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| SessionError::ActorGone("mailbox closed".into()))?;
        rx.await
            .map_err(|_| SessionError::ActorGone("actor dropped the reply".into()).into())
    }

    pub async fn receive(&self, input: ParsedInput) -> Result<ReceiveReceipt> {
        self.request(|reply| SessionCommand::Receive { input, reply })
            .await
    }

    pub async fn handle_direct(&self, input: ParsedInput) -> Result<String> {
        self.request(|reply| SessionCommand::HandleDirect { input, reply })
            .await?
    }

    pub async fn callback(&self, action: String, payload: String) -> Result<Option<String>> {
        self.request(|reply| SessionCommand::Callback {
            action,
            payload,
            reply,
        })
        .await
    }

    pub async fn clear_history(&self) -> Result<String> {
        self.request(|reply| SessionCommand::ClearHistory { reply })
            .await
    }

    pub async fn recover(&self) -> Result<String> {
        self.request(|reply| SessionCommand::Recover { reply }).await
    }

    pub async fn batch_state(&self) -> Result<BatchStateView> {
        self.request(|reply| SessionCommand::BatchState { reply })
            .await
    }

    pub async fn metadata(&self) -> Result<HashMap<String, serde_json::Value>> {
        self.request(|reply| SessionCommand::GetMetadata { reply })
            .await
    }

    pub async fn set_metadata(&self, key: String, value: serde_json::Value) -> Result<()> {
        self.request(|reply| SessionCommand::SetMetadata { key, value, reply })
            .await
    }

    pub async fn worker_progress(&self, execution_id: ExecutionId, status: String) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::WorkerProgress {
                execution_id,
                status,
            })
            .await
            .map_err(|_| SessionError::ActorGone("mailbox closed".into()).into())
    }

    pub async fn worker_complete(&self, completion: WorkerCompletion) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::WorkerComplete {
                completion: Box::new(completion),
            })
            .await
            .map_err(|_| SessionError::ActorGone("mailbox closed".into()).into())
    }
}

/// What an execution task reports back to its actor.
enum ExecutionEnd {
    Completed {
        batch_id: BatchId,
        outcome: ExecOutcome,
    },
}

enum ExecOutcome {
    /// A rendered reply was delivered; append the turns to history.
    Reply {
        new_messages: Vec<StoredMessage>,
        usage: TokenUsage,
    },
    /// A built-in command was answered; nothing goes into history.
    Command,
    /// The batch was handed to an async worker.
    Delegated {
        execution_id: ExecutionId,
        worker: String,
    },
    Failed {
        error: Error,
    },
}

/// Heartbeat writer shared with the rotator: bump in memory first, then
/// persist best-effort.
struct SessionBeat {
    key: SessionKey,
    state: Arc<RwLock<SessionState>>,
    store: SharedStore,
    clock: SharedClock,
}

impl HeartbeatSink for SessionBeat {
    fn beat(&self) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async {
            let now = self.clock.now();
            let snapshot = {
                let mut state = self.state.write().await;
                if let Some(active) = state.active_batch.as_mut() {
                    active.last_heartbeat = Some(now);
                }
                state.clone()
            };
            if let Err(error) = self.store.save(&self.key, &snapshot).await {
                tracing::warn!(session = %self.key, %error, "heartbeat persist failed");
            }
        })
    }
}

/// A running session actor. One per `(platform, user, chat)`.
pub struct SessionActor {
    key: SessionKey,
    state: Arc<RwLock<SessionState>>,
    deps: SessionDeps,
    mcp: Option<Arc<McpManager>>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    exec_tx: mpsc::Sender<ExecutionEnd>,
    exec_rx: mpsc::Receiver<ExecutionEnd>,
    alarm_deadline: Option<tokio::time::Instant>,
    exec_abort: Option<tokio::task::AbortHandle>,
}

impl SessionActor {
    /// Create an actor over pre-loaded state. The caller spawns `run`.
    pub fn new(key: SessionKey, state: SessionState, deps: SessionDeps) -> (Self, SessionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_DEPTH);
        let (exec_tx, exec_rx) = mpsc::channel(8);

        let config = deps.config.load();
        let mcp = (!config.mcp_servers.is_empty()).then(|| {
            Arc::new(McpManager::new(
                &config.mcp_servers,
                config.mcp_connect_timeout.0,
            ))
        });

        let actor = Self {
            key,
            state: Arc::new(RwLock::new(state)),
            deps,
            mcp,
            cmd_rx,
            exec_tx,
            exec_rx,
            alarm_deadline: None,
            exec_abort: None,
        };

        (actor, SessionHandle { cmd_tx })
    }

    /// Run the actor event loop until the mailbox closes.
    pub async fn run(mut self) {
        tracing::info!(session = %self.key, "session actor started");

        loop {
            let deadline = self.alarm_deadline;
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Some(end) = self.exec_rx.recv() => {
                    self.handle_execution_end(end).await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() =>
                {
                    self.alarm_deadline = None;
                    self.on_alarm().await;
                }
            }
        }

        tracing::info!(session = %self.key, "session actor stopped");
    }

    fn stuck_policy(&self) -> StuckPolicy {
        StuckPolicy::from(&self.deps.config.load().timing)
    }

    fn schedule_alarm(&mut self, delay: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + delay;
        self.alarm_deadline = Some(match self.alarm_deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
    }

    async fn persist(&self) {
        let snapshot = self.state.read().await.clone();
        if let Err(error) = self.deps.store.save(&self.key, &snapshot).await {
            tracing::warn!(session = %self.key, %error, "state persist failed");
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Receive { input, reply } => {
                let receipt = self.on_receive(input).await;
                let _ = reply.send(receipt);
            }
            SessionCommand::HandleDirect { input, reply } => {
                self.on_handle_direct(input, reply).await;
            }
            SessionCommand::Callback {
                action,
                payload,
                reply,
            } => {
                let response = self.on_callback(&action, &payload).await;
                let _ = reply.send(response);
            }
            SessionCommand::WorkerProgress {
                execution_id,
                status,
            } => {
                self.on_worker_progress(execution_id, &status).await;
            }
            SessionCommand::WorkerComplete { completion } => {
                self.on_worker_complete(*completion).await;
            }
            SessionCommand::ClearHistory { reply } => {
                let response = self.on_clear_history().await;
                let _ = reply.send(response);
            }
            SessionCommand::Recover { reply } => {
                let response = self.on_recover().await;
                let _ = reply.send(response);
            }
            SessionCommand::BatchState { reply } => {
                let state = self.state.read().await;
                let _ = reply.send(BatchStateView {
                    active: state.active_batch.as_ref().map(BatchView::from_batch),
                    pending: state.pending_batch.as_ref().map(BatchView::from_batch),
                });
            }
            SessionCommand::GetMetadata { reply } => {
                let state = self.state.read().await;
                let _ = reply.send(state.metadata.clone());
            }
            SessionCommand::SetMetadata { key, value, reply } => {
                {
                    let mut state = self.state.write().await;
                    state.metadata.insert(key, value);
                }
                self.persist().await;
                let _ = reply.send(());
            }
        }
    }

    #[tracing::instrument(skip(self, input), fields(session = %self.key))]
    async fn on_receive(&mut self, input: ParsedInput) -> ReceiveReceipt {
        let now = self.deps.clock.now();
        let policy = self.stuck_policy();

        let outcome = {
            let mut state = self.state.write().await;
            let outcome = queue::receive(&mut state, &input, now, &policy);
            if outcome.recovered_stuck {
                state.metadata.insert(
                    "last_stuck_recovery".into(),
                    serde_json::Value::String(now.to_rfc3339()),
                );
            }
            state.metadata.insert(
                "last_request_id".into(),
                serde_json::Value::String(outcome.trace_id.clone()),
            );
            outcome
        };

        if outcome.recovered_stuck
            && let Some(abort) = self.exec_abort.take()
        {
            abort.abort();
        }

        if outcome.queued
            && let Some(event_id) = input.metadata.event_id()
        {
            self.deps.sink.upsert_event(
                EventPatch::new(event_id)
                    .status(EventStatus::Pending)
                    .started_at(now),
            );
        }

        if let Some(reason) = outcome.schedule {
            tracing::debug!(?reason, "scheduling batch alarm");
            let delay = match reason {
                ScheduleReason::FirstMessage => BATCH_DEBOUNCE,
                ScheduleReason::StuckRecovery | ScheduleReason::OrphanedPending => BATCH_DEBOUNCE,
            };
            self.schedule_alarm(delay);
        }

        self.persist().await;

        ReceiveReceipt {
            trace_id: outcome.trace_id,
            queued: outcome.queued,
            batch_id: outcome.batch_id,
        }
    }

    /// Alarm fire: reclaim or resume, then promote and launch execution.
    async fn on_alarm(&mut self) {
        let now = self.deps.clock.now();
        let policy = self.stuck_policy();

        let snapshot = {
            let mut state = self.state.write().await;

            let active_info = state
                .active_batch
                .as_ref()
                .map(|active| (active.status, active.is_stuck(now, &policy), active.batch_id));

            if let Some((status, stuck, batch_id)) = active_info {
                match status {
                    BatchStatus::Processing | BatchStatus::Delegated => {
                        if stuck {
                            tracing::warn!(
                                session = %self.key,
                                batch_id = %batch_id,
                                "alarm reclaiming stuck batch"
                            );
                            state.active_batch = None;
                            if let Some(abort) = self.exec_abort.take() {
                                abort.abort();
                            }
                        } else {
                            // Healthy single-flight execution; leave it alone.
                            return;
                        }
                    }
                    // A parked batch waiting out its retry backoff.
                    _ => {
                        let active = state.active_batch.as_mut().expect("active present");
                        active.status = BatchStatus::Processing;
                        active.last_heartbeat = Some(now);
                        active.push_stage(BatchStage::Processing, now);
                        let snapshot = active.clone();
                        drop(state);
                        self.persist().await;
                        self.launch_execution(snapshot, true);
                        return;
                    }
                }
            }

            let Some(mut pending) = state.pending_batch.take() else {
                return;
            };
            if pending.pending_messages.is_empty() {
                return;
            }

            // Promotion: the critical transition. Serialised by this actor.
            pending.status = BatchStatus::Processing;
            pending.last_heartbeat = Some(now);
            pending.push_stage(BatchStage::Processing, now);
            state.active_batch = Some(pending);
            state.evict_stale_workflows(now, policy.hard_ceiling);

            state.active_batch.clone().expect("just set")
        };

        for event_id in snapshot
            .pending_messages
            .iter()
            .filter_map(|message| message.event_id.as_deref())
        {
            self.deps
                .sink
                .upsert_event(EventPatch::new(event_id).status(EventStatus::Processing));
        }

        self.persist().await;
        self.launch_execution(snapshot, false);
    }

    fn launch_execution(&mut self, batch: Batch, is_retry: bool) {
        let env = ExecutionEnv {
            key: self.key.clone(),
            state: self.state.clone(),
            deps: self.deps.clone(),
            mcp: self.mcp.clone(),
            exec_tx: self.exec_tx.clone(),
        };

        let handle = tokio::spawn(async move {
            env.run_batch(batch, is_retry).await;
        });
        self.exec_abort = Some(handle.abort_handle());
    }

    async fn handle_execution_end(&mut self, end: ExecutionEnd) {
        let ExecutionEnd::Completed { batch_id, outcome } = end;
        self.exec_abort = None;
        let now = self.deps.clock.now();

        // Stale completion for a batch that was reclaimed underneath us.
        {
            let state = self.state.read().await;
            let matches = state
                .active_batch
                .as_ref()
                .is_some_and(|active| active.batch_id == batch_id);
            if !matches {
                tracing::warn!(
                    session = %self.key,
                    batch_id = %batch_id,
                    "dropping completion for a reclaimed batch"
                );
                return;
            }
        }

        match outcome {
            ExecOutcome::Reply { new_messages, usage } => {
                self.finish_batch(now, |state, batch, config| {
                    for message in new_messages {
                        state.messages.push(message);
                    }
                    state.trim_history(config.limits.max_history);
                    state.updated_at = now;
                    batch.push_stage(BatchStage::Done, now);
                    (EventStatus::Success, usage)
                })
                .await;
            }
            ExecOutcome::Command => {
                self.finish_batch(now, |_state, batch, _config| {
                    batch.push_stage(BatchStage::Done, now);
                    (EventStatus::Success, TokenUsage::default())
                })
                .await;
            }
            ExecOutcome::Delegated {
                execution_id,
                worker,
            } => {
                {
                    let mut state = self.state.write().await;
                    let message_ref = state
                        .active_batch
                        .as_ref()
                        .and_then(|active| active.message_ref.clone());
                    if let Some(active) = state.active_batch.as_mut() {
                        active.status = BatchStatus::Delegated;
                        active.last_heartbeat = Some(now);
                    }
                    state.active_workflows.insert(
                        execution_id,
                        WorkflowRef {
                            execution_id,
                            worker,
                            started_at: now,
                            message_ref,
                        },
                    );
                }
                self.persist().await;
            }
            ExecOutcome::Failed { error } => {
                self.on_execution_failure(error, now).await;
            }
        }
    }

    /// Clear the active batch after recording terminal bookkeeping, then
    /// reschedule if pending work exists.
    async fn finish_batch(
        &mut self,
        now: chrono::DateTime<chrono::Utc>,
        apply: impl FnOnce(&mut SessionState, &mut Batch, &RuntimeConfig) -> (EventStatus, TokenUsage),
    ) {
        let config = self.deps.config.load_full();
        let (event_ids, status, usage, duration_ms, pending_nonempty) = {
            let mut state = self.state.write().await;
            let Some(mut batch) = state.active_batch.take() else {
                return;
            };

            let (status, usage) = apply(&mut state, &mut batch, &config);
            batch.status = BatchStatus::Done;

            let request_ids: Vec<String> = batch
                .pending_messages
                .iter()
                .map(|message| message.request_id.clone())
                .collect();
            state.record_processed_requests(request_ids.iter().map(String::as_str));

            let event_ids: Vec<String> = batch
                .pending_messages
                .iter()
                .filter_map(|message| message.event_id.clone())
                .collect();
            let duration_ms = batch
                .batch_started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64)
                .unwrap_or(0);

            let pending_nonempty = state
                .pending_batch
                .as_ref()
                .is_some_and(|pending| !pending.pending_messages.is_empty());

            (event_ids, status, usage, duration_ms, pending_nonempty)
        };

        for event_id in &event_ids {
            self.deps.sink.upsert_event(
                EventPatch::new(event_id)
                    .status(status)
                    .completed_at(now)
                    .duration_ms(duration_ms)
                    .tokens(usage),
            );
        }

        self.persist().await;

        if pending_nonempty {
            self.schedule_alarm(BATCH_DEBOUNCE);
        }
    }

    async fn on_execution_failure(&mut self, error: Error, now: chrono::DateTime<chrono::Utc>) {
        let retry = self.deps.config.load().retry;

        enum Next {
            Retry(std::time::Duration),
            GiveUp {
                notify: NotifyContext,
            },
        }

        struct NotifyContext {
            origin: ReplyOrigin,
            message_ref: Option<crate::MessageRef>,
            is_admin: bool,
            errors: Vec<String>,
        }

        let next = {
            let mut state = self.state.write().await;
            let fallback_chat = state.chat_id.clone();
            let Some(active) = state.active_batch.as_mut() else {
                return;
            };

            active.retry_errors.push(crate::session::state::RetryError {
                at: now,
                message: error.to_string(),
            });

            if error.retryable() && active.retry_count < retry.max_retries {
                let delay = retry.delay_for(active.retry_count);
                active.retry_count += 1;
                // Park outside the executing statuses so the backoff window
                // cannot be mistaken for a wedged execution.
                active.status = BatchStatus::Collecting;
                active.push_stage(BatchStage::Retrying, now);
                tracing::warn!(
                    session = %self.key,
                    batch_id = %active.batch_id,
                    retry = active.retry_count,
                    ?delay,
                    %error,
                    "batch failed, retrying"
                );
                Next::Retry(delay)
            } else {
                active.push_stage(BatchStage::Failed, now);
                tracing::error!(
                    session = %self.key,
                    batch_id = %active.batch_id,
                    retries = active.retry_count,
                    %error,
                    "batch failed permanently"
                );
                let first = active.pending_messages.first();
                Next::GiveUp {
                    notify: NotifyContext {
                        origin: first
                            .map(|message| message.origin.clone())
                            .unwrap_or(ReplyOrigin::Chat {
                                chat_id: fallback_chat,
                            }),
                        message_ref: active.message_ref.clone(),
                        is_admin: first.map(|message| message.is_admin).unwrap_or(false),
                        errors: active
                            .retry_errors
                            .iter()
                            .rev()
                            .take(3)
                            .map(|retry_error| retry_error.message.clone())
                            .collect(),
                    },
                }
            }
        };

        match next {
            Next::Retry(delay) => {
                self.persist().await;
                self.schedule_alarm(delay);
            }
            Next::GiveUp { notify } => {
                let text = if notify.is_admin {
                    let mut text = String::from(APOLOGY_MESSAGE);
                    text.push_str("\n\nRecent errors:\n");
                    for error in &notify.errors {
                        text.push_str(&format!("• {error}\n"));
                    }
                    text
                } else {
                    APOLOGY_MESSAGE.to_string()
                };

                if let Ok(transport) = self.deps.transport(self.key.platform) {
                    let origin = notify.origin.clone();
                    let message_ref = notify.message_ref.clone();
                    background("failure_notify", async move {
                        if let Some(message_ref) = &message_ref
                            && transport.edit(&origin, message_ref, &text).await.is_ok()
                        {
                            return Ok(());
                        }
                        transport.send(&origin, &text).await.map(|_| ())
                    });
                }

                if notify.is_admin {
                    tracing::error!(session = %self.key, "admin alert: batch exhausted retries");
                }

                self.finish_batch(now, |_state, batch, _config| {
                    batch.push_stage(BatchStage::Notified, now);
                    (EventStatus::Error, TokenUsage::default())
                })
                .await;
            }
        }
    }

    async fn on_worker_progress(&mut self, execution_id: ExecutionId, status: &str) {
        let now = self.deps.clock.now();
        let known = {
            let mut state = self.state.write().await;
            let known = state.active_workflows.contains_key(&execution_id)
                || state
                    .active_batch
                    .as_ref()
                    .is_some_and(|active| active.status == BatchStatus::Delegated);
            if known && let Some(active) = state.active_batch.as_mut() {
                active.last_heartbeat = Some(now);
            }
            known
        };

        if known {
            tracing::debug!(
                session = %self.key,
                execution_id = %execution_id,
                status,
                "worker progress"
            );
            self.persist().await;
        }
    }

    async fn on_worker_complete(&mut self, completion: WorkerCompletion) {
        let now = self.deps.clock.now();
        let execution_id = completion.execution_id;

        let known = {
            let mut state = self.state.write().await;
            state.active_workflows.remove(&execution_id).is_some()
        };
        if !known {
            tracing::warn!(
                session = %self.key,
                execution_id = %execution_id,
                "completion for unknown workflow dropped"
            );
            return;
        }

        tracing::info!(
            session = %self.key,
            execution_id = %execution_id,
            success = completion.result.success,
            "worker completed"
        );

        let usage = completion.result.usage;
        let status = if completion.result.success {
            EventStatus::Success
        } else {
            EventStatus::Error
        };
        let new_messages = completion.result.new_messages;

        self.finish_batch(now, move |state, batch, config| {
            for message in new_messages {
                state.messages.push(message);
            }
            state.trim_history(config.limits.max_history);
            state.updated_at = now;
            batch.push_stage(
                if status == EventStatus::Success {
                    BatchStage::Done
                } else {
                    BatchStage::Notified
                },
                now,
            );
            (status, usage)
        })
        .await;
    }

    async fn on_clear_history(&mut self) -> String {
        {
            let mut state = self.state.write().await;
            state.messages.clear();
            // Pending work is dropped; an in-flight batch keeps running.
            state.pending_batch = None;
            state.updated_at = self.deps.clock.now();
        }
        if let Some(mcp) = &self.mcp {
            mcp.reset().await;
        }
        self.persist().await;
        commands::CLEARED_MESSAGE.to_string()
    }

    async fn on_recover(&mut self) -> String {
        {
            let mut state = self.state.write().await;
            state.active_batch = None;
            state.pending_batch = None;
            state.active_workflows.clear();
            state.updated_at = self.deps.clock.now();
        }
        if let Some(abort) = self.exec_abort.take() {
            abort.abort();
        }
        self.alarm_deadline = None;
        self.persist().await;
        commands::RECOVERED_MESSAGE.to_string()
    }

    async fn on_callback(&mut self, action: &str, payload: &str) -> Option<String> {
        match action {
            "recover" => Some(self.on_recover().await),
            "debug" => {
                let state = self.state.read().await;
                Some(commands::render_debug(&state, &self.deps.config.load()))
            }
            other => {
                tracing::warn!(
                    session = %self.key,
                    action = other,
                    payload,
                    "unknown callback action dropped"
                );
                None
            }
        }
    }

    async fn on_handle_direct(&mut self, input: ParsedInput, reply: oneshot::Sender<Result<String>>) {
        let env = ExecutionEnv {
            key: self.key.clone(),
            state: self.state.clone(),
            deps: self.deps.clone(),
            mcp: self.mcp.clone(),
            exec_tx: self.exec_tx.clone(),
        };

        tokio::spawn(async move {
            let result = env.run_direct(input).await;
            let _ = reply.send(result);
        });
    }
}

/// Everything a spawned execution task owns.
struct ExecutionEnv {
    key: SessionKey,
    state: Arc<RwLock<SessionState>>,
    deps: SessionDeps,
    mcp: Option<Arc<McpManager>>,
    exec_tx: mpsc::Sender<ExecutionEnd>,
}

impl ExecutionEnv {
    async fn persist(&self) {
        let snapshot = self.state.read().await.clone();
        if let Err(error) = self.deps.store.save(&self.key, &snapshot).await {
            tracing::warn!(session = %self.key, %error, "state persist failed");
        }
    }

    fn chat_loop(&self) -> crate::chat::ChatLoop {
        crate::chat::ChatLoop::new(
            self.deps.provider.clone(),
            self.deps.tools.clone(),
            self.mcp.clone(),
        )
    }

    /// Process one promoted batch end to end and report the outcome.
    #[tracing::instrument(skip(self, batch), fields(session = %self.key, batch_id = %batch.batch_id))]
    async fn run_batch(&self, batch: Batch, is_retry: bool) {
        let batch_id = batch.batch_id;
        let outcome = self.run_batch_inner(&batch, is_retry).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => ExecOutcome::Failed { error },
        };

        let _ = self
            .exec_tx
            .send(ExecutionEnd::Completed { batch_id, outcome })
            .await;
    }

    async fn run_batch_inner(&self, batch: &Batch, is_retry: bool) -> Result<ExecOutcome> {
        let config = self.deps.config.load_full();
        let messages = &batch.pending_messages;
        let first = messages
            .first()
            .ok_or_else(|| SessionError::InvalidStateTransition("empty batch promoted".into()))?;

        // Built-in commands short-circuit the LLM entirely. A leading /clear
        // processes alone and the rest of the batch is discarded.
        if let Some(command) = commands::parse(&first.text) {
            match command {
                Command::Other { name, args } => {
                    let mut rewritten = vec![commands::rewrite_other(&name, &args)];
                    rewritten.extend(messages.iter().skip(1).map(|message| message.text.clone()));
                    return self
                        .run_llm_batch(batch, rewritten.join("\n"), is_retry, &config)
                        .await;
                }
                command => {
                    if messages.len() > 1 {
                        tracing::info!(
                            session = %self.key,
                            dropped = messages.len() - 1,
                            "command batch, discarding coalesced remainder"
                        );
                    }
                    let reply = self.run_command(command, first).await;
                    let transport = self.deps.transport(self.key.platform)?;
                    transport.send(&first.origin, &reply).await?;
                    return Ok(ExecOutcome::Command);
                }
            }
        }

        let combined: Vec<String> = messages.iter().map(|message| message.text.clone()).collect();
        self.run_llm_batch(batch, combined.join("\n"), is_retry, &config)
            .await
    }

    async fn run_command(&self, command: Command, first: &PendingMessage) -> String {
        match command {
            Command::Start => commands::WELCOME_MESSAGE.to_string(),
            Command::Help => commands::HELP_MESSAGE.to_string(),
            Command::Clear => {
                {
                    let mut state = self.state.write().await;
                    state.messages.clear();
                    state.pending_batch = None;
                    state.updated_at = self.deps.clock.now();
                }
                if let Some(mcp) = &self.mcp {
                    mcp.reset().await;
                }
                self.persist().await;
                commands::CLEARED_MESSAGE.to_string()
            }
            Command::Recover => {
                {
                    let mut state = self.state.write().await;
                    state.pending_batch = None;
                    state.active_workflows.clear();
                }
                self.persist().await;
                commands::RECOVERED_MESSAGE.to_string()
            }
            Command::Debug => {
                if first.is_admin {
                    let state = self.state.read().await;
                    commands::render_debug(&state, &self.deps.config.load())
                } else {
                    commands::ADMIN_ONLY_MESSAGE.to_string()
                }
            }
            Command::Other { .. } => unreachable!("handled by the caller"),
        }
    }

    async fn run_llm_batch(
        &self,
        batch: &Batch,
        combined_text: String,
        is_retry: bool,
        config: &RuntimeConfig,
    ) -> Result<ExecOutcome> {
        let started = std::time::Instant::now();
        let first = batch.pending_messages.first().expect("non-empty batch");
        let origin = first.origin.clone();
        let is_admin = first.is_admin;
        let event_id = first.event_id.clone();
        let transport = self.deps.transport(self.key.platform)?;

        // Initial progress message. A retry reuses the ref stored on the
        // batch; a failed send degrades to a progress-less run.
        let message_ref = match batch.message_ref.clone() {
            Some(existing) if is_retry => Some(existing),
            _ => match transport.send(&origin, initial_phrase()).await {
                Ok(message_ref) => {
                    let mut state = self.state.write().await;
                    if let Some(active) = state.active_batch.as_mut() {
                        active.message_ref = Some(message_ref.clone());
                    }
                    drop(state);
                    self.persist().await;
                    Some(message_ref)
                }
                Err(error) => {
                    tracing::warn!(%error, "initial progress send failed, continuing without");
                    None
                }
            },
        };

        let recorder = StepRecorder::new(self.deps.clock.clone());
        let heartbeat: Arc<dyn HeartbeatSink> = Arc::new(SessionBeat {
            key: self.key.clone(),
            state: self.state.clone(),
            store: self.deps.store.clone(),
            clock: self.deps.clock.clone(),
        });

        let rotator = message_ref.clone().map(|message_ref| {
            Rotator::start(
                transport.clone(),
                origin.clone(),
                message_ref,
                heartbeat.clone(),
                config.timing.rotation_interval,
            )
        });

        // Without a progress message there is no rotator; keep the heartbeat
        // alive anyway so the run cannot be mistaken for a wedged one.
        let heartbeat_task = rotator.is_none().then(|| {
            let interval = config.timing.rotation_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    heartbeat.beat().await;
                }
            })
        });

        let history = self.state.read().await.messages.clone();
        let execution = self.execute_query(
            &combined_text,
            history,
            &origin,
            message_ref.clone(),
            is_admin,
            event_id.clone(),
            config,
            &recorder,
        );

        let result = tokio::time::timeout(config.timing.hard_ceiling, execution).await;

        if let Some(rotator) = rotator {
            rotator.stop();
            rotator.wait_for_pending().await;
        }
        if let Some(task) = heartbeat_task {
            task.abort();
        }

        let executed = match result {
            Ok(executed) => executed?,
            Err(_) => {
                return Err(SessionError::Stuck {
                    batch_id: batch.batch_id,
                }
                .into());
            }
        };

        let (reply, new_messages, usage, model) = match executed {
            Executed::Delegated {
                execution_id,
                worker,
            } => {
                return Ok(ExecOutcome::Delegated {
                    execution_id,
                    worker,
                });
            }
            Executed::Reply {
                reply,
                new_messages,
                usage,
                model,
            } => (reply, new_messages, usage, model),
        };

        // Final render, edit first, send as fallback. A failure here fails
        // the batch so nothing is persisted for a reply nobody saw.
        let timeline = recorder.snapshot();
        let footer = is_admin.then(|| DebugFooter {
            timeline: &timeline,
            usage,
            duration_ms: started.elapsed().as_millis() as u64,
            model: model.as_deref(),
        });
        let final_text = render_final(transport.markup(), &reply, footer);

        let mut delivered = false;
        if let Some(message_ref) = &message_ref {
            match transport.edit(&origin, message_ref, &final_text).await {
                Ok(()) => delivered = true,
                Err(error) => {
                    tracing::debug!(%error, "final edit failed, falling back to send");
                }
            }
        }
        if !delivered {
            transport.send(&origin, &final_text).await?;
        }

        self.deps
            .sink
            .append_chat_message(&self.key, crate::llm::Role::User, &combined_text);
        self.deps
            .sink
            .append_chat_message(&self.key, crate::llm::Role::Assistant, &reply);

        Ok(ExecOutcome::Reply { new_messages, usage })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_query(
        &self,
        combined_text: &str,
        history: Vec<StoredMessage>,
        origin: &ReplyOrigin,
        message_ref: Option<crate::MessageRef>,
        is_admin: bool,
        event_id: Option<String>,
        config: &RuntimeConfig,
        recorder: &StepRecorder,
    ) -> Result<Executed> {
        if let Some(router) = &self.deps.router {
            let ctx = RouterContext {
                query: combined_text.to_string(),
                session: self.key.clone(),
                history: history.clone(),
                event_id: event_id.clone(),
                target: ResponseTarget {
                    session: self.key.clone(),
                    origin: origin.clone(),
                    message_ref,
                    is_admin,
                },
            };

            let outcome = router.route(ctx, recorder).await;

            if let Some(classification) = outcome
                .data
                .classification
                .as_ref()
                .map(|classification| classification.label())
                && let Some(event_id) = &event_id
            {
                let mut patch = EventPatch::new(event_id).classification(classification);
                if let Some(routed_to) = &outcome.data.routed_to {
                    patch = patch.agents(vec![routed_to.clone()]);
                }
                self.deps.sink.upsert_event(patch);
            }

            if let Some(execution_id) = outcome.delegated {
                return Ok(Executed::Delegated {
                    execution_id,
                    worker: outcome
                        .data
                        .routed_to
                        .unwrap_or_else(|| "worker".to_string()),
                });
            }

            if outcome.success {
                let reply = outcome.content.unwrap_or_default();
                let new_messages = if outcome.data.new_messages.is_empty() {
                    vec![
                        StoredMessage::user(combined_text),
                        StoredMessage::assistant(reply.clone()),
                    ]
                } else {
                    outcome.data.new_messages
                };
                return Ok(Executed::Reply {
                    reply,
                    new_messages,
                    usage: TokenUsage::default(),
                    model: None,
                });
            }

            let kind = outcome.error_kind.unwrap_or(ErrorKind::WorkerUnavailable);
            if kind != ErrorKind::WorkerUnavailable {
                return Err(error_for_kind(kind, "router dispatch failed"));
            }

            // No worker can take the query: degrade to the direct chat loop
            // before any retry is considered. If the chat loop fails too,
            // that failure's own kind governs the retry decision.
            tracing::warn!(
                session = %self.key,
                "router reported no available worker, using direct chat"
            );
            recorder.record(crate::progress::Step::Subagent {
                name: "direct_chat".into(),
                status: "fallback".into(),
            });
        }

        let turn = self
            .chat_loop()
            .run(&history, combined_text, config, recorder)
            .await?;

        Ok(Executed::Reply {
            new_messages: vec![
                StoredMessage::user(combined_text),
                StoredMessage::assistant(turn.reply.clone()),
            ],
            reply: turn.reply,
            usage: turn.usage,
            model: turn.model,
        })
    }

    /// The no-batching path: answer immediately, then persist the turn.
    async fn run_direct(&self, input: ParsedInput) -> Result<String> {
        let config = self.deps.config.load_full();
        let transport = self.deps.transport(self.key.platform)?;

        if let Some(command) = commands::parse(&input.text) {
            let pending = PendingMessage {
                text: input.text.clone(),
                timestamp: self.deps.clock.now(),
                request_id: String::new(),
                user_id: input.user_id.clone(),
                chat_id: input.chat_id.clone(),
                username: input.username.clone(),
                is_admin: input.metadata.is_admin(),
                event_id: None,
                origin: input.origin.clone(),
            };
            let reply = match command {
                Command::Other { name, args } => {
                    let rewritten = commands::rewrite_other(&name, &args);
                    let recorder = StepRecorder::new(self.deps.clock.clone());
                    let history = self.state.read().await.messages.clone();
                    let turn = self
                        .chat_loop()
                        .run(&history, &rewritten, &config, &recorder)
                        .await?;
                    self.append_turn(&rewritten, &turn.reply, &config).await;
                    turn.reply
                }
                command => self.run_command(command, &pending).await,
            };
            transport.send(&input.origin, &reply).await?;
            return Ok(reply);
        }

        let recorder = StepRecorder::new(self.deps.clock.clone());
        let history = self.state.read().await.messages.clone();
        let turn = self
            .chat_loop()
            .run(&history, &input.text, &config, &recorder)
            .await?;

        let rendered = render_final(transport.markup(), &turn.reply, None);
        transport.send(&input.origin, &rendered).await?;

        self.append_turn(&input.text, &turn.reply, &config).await;
        Ok(turn.reply)
    }

    async fn append_turn(&self, user_text: &str, reply: &str, config: &RuntimeConfig) {
        let now = self.deps.clock.now();
        {
            let mut state = self.state.write().await;
            state.push_turn(user_text, reply, config.limits.max_history, now);
        }
        self.persist().await;
    }
}

enum Executed {
    Reply {
        reply: String,
        new_messages: Vec<StoredMessage>,
        usage: TokenUsage,
        model: Option<String>,
    },
    Delegated {
        execution_id: ExecutionId,
        worker: String,
    },
}

fn error_for_kind(kind: ErrorKind, message: &str) -> Error {
    match kind {
        ErrorKind::TransientTransport => TransportError::Transient(message.to_string()).into(),
        ErrorKind::PermanentTransport => TransportError::Permanent(message.to_string()).into(),
        ErrorKind::LlmUnavailable => LlmError::Unavailable(message.to_string()).into(),
        ErrorKind::LlmBadResponse => LlmError::BadResponse(message.to_string()).into(),
        ErrorKind::WorkerUnavailable => RouterError::WorkerUnavailable(message.to_string()).into(),
        ErrorKind::Validation => RouterError::InvalidPlan(message.to_string()).into(),
        ErrorKind::Tool | ErrorKind::Stuck => anyhow::anyhow!("{message} ({kind})").into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::test_provider::ScriptedProvider;
    use crate::clock::SystemClock;
    use crate::llm::{ChatResponse, Role};
    use crate::observability::{EventStatus, MemorySink};
    use crate::router::worker::{ScheduledExecution, WorkerClient, WorkerInput, WorkerResult};
    use crate::router::{WorkerRegistry, WorkerTarget};
    use crate::session::store::{MemorySessionStore, SessionStore};
    use crate::transport::MemoryTransport;
    use crate::{InputMetadata, Platform};
    use std::time::Duration;

    struct Harness {
        handle: SessionHandle,
        transport: Arc<MemoryTransport>,
        provider: Arc<ScriptedProvider>,
        store: Arc<MemorySessionStore>,
        sink: Arc<crate::observability::MemorySink>,
        key: SessionKey,
    }

    impl Harness {
        async fn stored(&self) -> SessionState {
            crate::session::store::SessionStore::load(&*self.store, &self.key)
                .await
                .expect("load")
                .expect("state present")
        }

        /// Let virtual time run until the pipeline settles.
        async fn settle(&self) {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    fn spawn(
        provider: Arc<ScriptedProvider>,
        config: RuntimeConfig,
        router: Option<Arc<Router>>,
        seed: Option<SessionState>,
    ) -> Harness {
        let key = SessionKey::new(Platform::Rest, "u1", "c1");
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let sink = Arc::new(MemorySink::new());

        let mut transports: HashMap<Platform, SharedTransport> = HashMap::new();
        transports.insert(Platform::Rest, transport.clone());

        let deps = SessionDeps {
            clock: Arc::new(SystemClock),
            store: store.clone(),
            transports: Arc::new(transports),
            provider: provider.clone(),
            tools: Arc::new(ToolRegistry::new()),
            router,
            sink: sink.clone(),
            config: Arc::new(ArcSwap::from_pointee(config)),
        };

        let state = seed.unwrap_or_else(|| SessionState::new("u1", "c1", chrono::Utc::now()));
        let (actor, handle) = SessionActor::new(key.clone(), state, deps);
        tokio::spawn(actor.run());

        Harness {
            handle,
            transport,
            provider,
            store,
            sink,
            key,
        }
    }

    fn input(text: &str, request_id: &str) -> ParsedInput {
        ParsedInput {
            text: text.into(),
            user_id: "u1".into(),
            chat_id: "c1".into(),
            username: Some("alice".into()),
            metadata: InputMetadata::Rest {
                request_id: Some(request_id.into()),
                event_id: Some(format!("evt-{request_id}")),
                is_admin: false,
                reply_url: None,
            },
            origin: ReplyOrigin::Chat {
                chat_id: "c1".into(),
            },
        }
    }

    fn admin_input(text: &str, request_id: &str) -> ParsedInput {
        let mut parsed = input(text, request_id);
        parsed.metadata = InputMetadata::Rest {
            request_id: Some(request_id.into()),
            event_id: None,
            is_admin: true,
            reply_url: None,
        };
        parsed
    }

    fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.into(),
            ..ChatResponse::default()
        }
    }

    /// S1: one message in, one alarm, one `{user, assistant}` pair out.
    #[tokio::test(start_paused = true)]
    async fn simple_reply_round_trip() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("Hi!"))]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        let receipt = harness
            .handle
            .receive(input("hello", "r1"))
            .await
            .expect("receipt");
        assert!(receipt.queued);
        assert_eq!(receipt.trace_id, "r1");
        assert!(receipt.batch_id.is_some());

        harness.settle().await;

        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.messages[0].content, "hello");
        assert_eq!(state.messages[1].role, Role::Assistant);
        assert_eq!(state.messages[1].content, "Hi!");
        assert!(state.active_batch.is_none());
        assert!(
            state
                .pending_batch
                .as_ref()
                .is_none_or(|pending| pending.pending_messages.is_empty())
        );

        // Progress message was sent and then edited into the final reply.
        let outbox = harness.transport.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(
            harness
                .transport
                .current_text(&outbox[0].message_ref)
                .as_deref(),
            Some("Hi!")
        );

        // The event log saw the full lifecycle.
        let patches = harness.sink.events_for("evt-r1");
        assert!(patches.iter().any(|p| p.status == Some(EventStatus::Pending)));
        assert!(
            patches
                .iter()
                .any(|p| p.status == Some(EventStatus::Success))
        );
    }

    /// S2: a burst coalesces into one batch and one combined LLM turn.
    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("got all"))]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        for (text, rid) in [("a", "r1"), ("b", "r2"), ("c", "r3")] {
            harness.handle.receive(input(text, rid)).await.expect("receipt");
        }

        harness.settle().await;

        assert_eq!(provider.call_count(), 1);
        let calls = provider.calls.lock().expect("calls");
        let (messages, _) = &calls[0];
        assert_eq!(messages.last().expect("user turn").content, "a\nb\nc");
        drop(calls);

        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 2, "exactly one pair appended");
        assert!(state.seen_request("r1"));
        assert!(state.seen_request("r3"));
    }

    /// S3: a duplicate request ID is dropped and changes nothing.
    #[tokio::test(start_paused = true)]
    async fn duplicate_request_is_idempotent() {
        let provider = Arc::new(ScriptedProvider::always("ok"));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        let first = harness
            .handle
            .receive(input("x", "r1"))
            .await
            .expect("receipt");
        let second = harness
            .handle
            .receive(input("x", "r1"))
            .await
            .expect("receipt");
        assert!(first.queued);
        assert!(!second.queued);

        harness.settle().await;
        assert_eq!(provider.call_count(), 1, "one processed batch");

        // Resending after completion still dedups via the rolling window.
        let third = harness
            .handle
            .receive(input("x", "r1"))
            .await
            .expect("receipt");
        assert!(!third.queued);

        // Same text under a new request ID is a fresh message.
        let fourth = harness
            .handle
            .receive(input("x", "r9"))
            .await
            .expect("receipt");
        assert!(fourth.queued);
        harness.settle().await;
        assert_eq!(harness.stored().await.messages.len(), 4);
    }

    /// S4: a wedged active batch is reclaimed and its messages are dropped.
    #[tokio::test(start_paused = true)]
    async fn stuck_batch_is_reclaimed_and_dropped() {
        let now = chrono::Utc::now();
        let mut seed = SessionState::new("u1", "c1", now);
        let mut wedged = Batch::new();
        wedged.status = BatchStatus::Processing;
        wedged.batch_started_at = Some(now - chrono::Duration::seconds(120));
        wedged.last_heartbeat = Some(now - chrono::Duration::seconds(60));
        wedged.pending_messages.push(PendingMessage {
            text: "orphan".into(),
            timestamp: now - chrono::Duration::seconds(120),
            request_id: "r0".into(),
            user_id: "u1".into(),
            chat_id: "c1".into(),
            username: None,
            is_admin: false,
            event_id: None,
            origin: ReplyOrigin::Chat {
                chat_id: "c1".into(),
            },
        });
        seed.active_batch = Some(wedged);

        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("fresh"))]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, Some(seed));

        let receipt = harness
            .handle
            .receive(input("y", "r2"))
            .await
            .expect("receipt");
        assert!(receipt.queued);

        harness.settle().await;

        let state = harness.stored().await;
        // Only the new message was processed; the orphan is gone for good.
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].content, "y");
        assert!(state.active_batch.is_none());
        assert_eq!(provider.call_count(), 1);
        let calls = provider.calls.lock().expect("calls");
        assert!(!calls[0].0.iter().any(|m| m.content.contains("orphan")));
    }

    /// S5: transient failures retry with backoff, then succeed.
    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(crate::error::LlmError::Unavailable("blip 1".into()).into()),
            Err(crate::error::LlmError::Unavailable("blip 2".into()).into()),
            Ok(text_response("third time lucky")),
        ]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        harness.handle.receive(input("q", "r1")).await.expect("receipt");

        // Backoff is 1s then 2s; give virtual time room for both.
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(provider.call_count(), 3);
        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].content, "third time lucky");
        assert!(state.active_batch.is_none());
    }

    /// Exhausted retries notify the user once and append nothing.
    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_notify_user() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(crate::error::LlmError::Unavailable("down".into()).into()),
            Err(crate::error::LlmError::Unavailable("down".into()).into()),
            Err(crate::error::LlmError::Unavailable("down".into()).into()),
            Err(crate::error::LlmError::Unavailable("down".into()).into()),
        ]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        harness.handle.receive(input("q", "r1")).await.expect("receipt");
        tokio::time::sleep(Duration::from_secs(30)).await;

        // Initial attempt plus max_retries (3) failures.
        assert_eq!(provider.call_count(), 4);
        let state = harness.stored().await;
        assert!(state.messages.is_empty(), "no partial history on failure");
        assert!(state.active_batch.is_none());

        let apology_seen = harness.transport.outbox().iter().any(|entry| {
            entry.text.contains("Sorry")
                || entry.edits.iter().any(|edit| edit.contains("Sorry"))
        });
        assert!(apology_seen, "user saw the apology");

        let patches = harness.sink.events_for("evt-r1");
        assert!(patches.iter().any(|p| p.status == Some(EventStatus::Error)));
    }

    /// Non-retryable failures skip the backoff ladder entirely.
    #[tokio::test(start_paused = true)]
    async fn bad_response_does_not_retry() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(
            crate::error::LlmError::BadResponse("garbage".into()).into(),
        )]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        harness.handle.receive(input("q", "r1")).await.expect("receipt");
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(provider.call_count(), 1, "no retries for bad responses");
        assert!(harness.stored().await.messages.is_empty());
    }

    /// A hung provider is cut off by the hard ceiling and retried.
    #[tokio::test(start_paused = true)]
    async fn hard_ceiling_abandons_hung_executions() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).hang_when_exhausted());
        let mut config = RuntimeConfig::default();
        config.retry.max_retries = 1;
        let harness = spawn(provider.clone(), config, None, None);

        harness.handle.receive(input("q", "r1")).await.expect("receipt");

        // Two ceilings (initial + one retry) plus slack.
        tokio::time::sleep(Duration::from_secs(700)).await;

        let state = harness.stored().await;
        assert!(state.active_batch.is_none(), "wedged batch was cleared");
        assert!(state.messages.is_empty());
        let apology_seen = harness.transport.outbox().iter().any(|entry| {
            entry.text.contains("Sorry")
                || entry.edits.iter().any(|edit| edit.contains("Sorry"))
        });
        assert!(apology_seen);
    }

    /// Messages arriving mid-flight land in pending and process afterwards.
    #[tokio::test(start_paused = true)]
    async fn pending_batch_processes_after_active() {
        let provider = Arc::new(ScriptedProvider::always("answer"));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        harness.handle.receive(input("first", "r1")).await.expect("receipt");
        harness.settle().await;
        harness.handle.receive(input("second", "r2")).await.expect("receipt");
        harness.settle().await;

        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 4, "two pairs in order");
        assert_eq!(state.messages[0].content, "first");
        assert_eq!(state.messages[2].content, "second");
        assert_eq!(provider.call_count(), 2);
    }

    /// A leading /clear wipes history and discards the rest of its batch.
    #[tokio::test(start_paused = true)]
    async fn clear_command_processes_alone() {
        let provider = Arc::new(ScriptedProvider::always("should not be called"));
        let mut seed = SessionState::new("u1", "c1", chrono::Utc::now());
        seed.messages.push(StoredMessage::user("old"));
        seed.messages.push(StoredMessage::assistant("old reply"));

        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, Some(seed));

        harness
            .handle
            .receive(input("/clear", "r1"))
            .await
            .expect("receipt");
        harness
            .handle
            .receive(input("also queued", "r2"))
            .await
            .expect("receipt");
        harness.settle().await;

        let state = harness.stored().await;
        assert!(state.messages.is_empty(), "history cleared");
        assert_eq!(provider.call_count(), 0, "no LLM call for a command batch");

        let cleared_seen = harness
            .transport
            .outbox()
            .iter()
            .any(|entry| entry.text.contains("cleared"));
        assert!(cleared_seen);
    }

    /// /debug is admin-gated.
    #[tokio::test(start_paused = true)]
    async fn debug_command_requires_admin() {
        let provider = Arc::new(ScriptedProvider::always("unused"));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        harness
            .handle
            .receive(input("/debug", "r1"))
            .await
            .expect("receipt");
        harness.settle().await;
        assert!(
            harness
                .transport
                .outbox()
                .iter()
                .any(|entry| entry.text.contains("only available to admins"))
        );

        harness
            .handle
            .receive(admin_input("/debug", "r2"))
            .await
            .expect("receipt");
        harness.settle().await;
        assert!(
            harness
                .transport
                .outbox()
                .iter()
                .any(|entry| entry.text.contains("retry policy"))
        );
    }

    /// Admin senders get the debug footer on normal replies.
    #[tokio::test(start_paused = true)]
    async fn admin_replies_carry_a_footer() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("body"))]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        harness
            .handle
            .receive(admin_input("question", "r1"))
            .await
            .expect("receipt");
        harness.settle().await;

        let outbox = harness.transport.outbox();
        let final_text = harness
            .transport
            .current_text(&outbox[0].message_ref)
            .expect("text");
        assert!(final_text.starts_with("body"));
        assert!(final_text.contains("tokens"));
    }

    /// Edit failure on the final render falls back to a fresh send.
    #[tokio::test(start_paused = true)]
    async fn final_render_falls_back_to_send() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("done"))]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        // Queue first so the progress send succeeds, then break edits.
        harness.handle.receive(input("q", "r1")).await.expect("receipt");
        harness.transport.set_fail_edits(true);
        harness.settle().await;

        let outbox = harness.transport.outbox();
        assert_eq!(outbox.len(), 2, "progress send plus fallback send");
        assert_eq!(outbox[1].text, "done");
        assert_eq!(harness.stored().await.messages.len(), 2);
    }

    /// /recover clears both batches but keeps history.
    #[tokio::test(start_paused = true)]
    async fn recover_clears_batches_keeps_history() {
        let now = chrono::Utc::now();
        let mut seed = SessionState::new("u1", "c1", now);
        seed.messages.push(StoredMessage::user("kept"));
        seed.messages.push(StoredMessage::assistant("kept too"));
        let mut wedged = Batch::new();
        wedged.status = BatchStatus::Processing;
        wedged.last_heartbeat = Some(now);
        seed.active_batch = Some(wedged);

        let provider = Arc::new(ScriptedProvider::always("unused"));
        let harness = spawn(provider, RuntimeConfig::default(), None, Some(seed));

        let response = harness.handle.recover().await.expect("recover");
        assert!(response.contains("History is untouched"));

        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 2);
        assert!(state.active_batch.is_none());
        assert!(state.pending_batch.is_none());
    }

    /// Callbacks parse `action:payload`; unknown actions are dropped.
    #[tokio::test(start_paused = true)]
    async fn callbacks_dispatch_known_actions() {
        let provider = Arc::new(ScriptedProvider::always("unused"));
        let harness = spawn(provider, RuntimeConfig::default(), None, None);

        let recovered = harness
            .handle
            .callback("recover".into(), String::new())
            .await
            .expect("callback");
        assert!(recovered.is_some());

        let unknown = harness
            .handle
            .callback("upgrade".into(), "pro".into())
            .await
            .expect("callback");
        assert!(unknown.is_none());
    }

    /// The synchronous path answers immediately and persists the turn.
    #[tokio::test(start_paused = true)]
    async fn handle_direct_skips_batching() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("direct"))]));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), None, None);

        let reply = harness
            .handle
            .handle_direct(input("quick question", ""))
            .await
            .expect("reply");
        assert_eq!(reply, "direct");

        harness.settle().await;
        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 2);
        assert!(state.active_batch.is_none());
        assert_eq!(harness.transport.outbox().len(), 1);
    }

    /// Stub orchestrator used for the delegation scenario.
    struct InstantScheduler;

    impl WorkerClient for InstantScheduler {
        fn name(&self) -> &str {
            "orchestrator"
        }

        async fn execute(&self, _input: WorkerInput) -> Result<WorkerResult> {
            unreachable!("delegation path only")
        }

        async fn schedule_execution(
            &self,
            input: WorkerInput,
            _target: ResponseTarget,
        ) -> Result<ScheduledExecution> {
            Ok(ScheduledExecution {
                scheduled: true,
                execution_id: input.execution_id,
            })
        }
    }

    /// S6: fire-and-forget delegation marks the batch delegated, and the
    /// worker callback completes the session.
    #[tokio::test(start_paused = true)]
    async fn delegation_completes_via_callback() {
        let provider = Arc::new(ScriptedProvider::always("unused"));
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerTarget::Orchestrator, Arc::new(InstantScheduler));
        let router = Arc::new(Router::new(registry, provider.clone()));

        let harness = spawn(provider.clone(), RuntimeConfig::default(), Some(router), None);

        let query = "first fetch the data and then summarize it, finally email me";
        harness.handle.receive(input(query, "r1")).await.expect("receipt");
        harness.settle().await;

        // The batch is parked as delegated, not cleared, and no retry fires.
        let view = harness.handle.batch_state().await.expect("view");
        let active = view.active.expect("delegated batch");
        assert_eq!(active.status, BatchStatus::Delegated);
        assert_eq!(active.retry_count, 0);

        let state = harness.stored().await;
        assert_eq!(state.active_workflows.len(), 1);
        let execution_id = *state.active_workflows.keys().next().expect("workflow");

        // Worker progress keeps the heartbeat warm.
        harness
            .handle
            .worker_progress(execution_id, "working".into())
            .await
            .expect("progress");

        // Completion callback merges the pair and clears the batch.
        harness
            .handle
            .worker_complete(WorkerCompletion {
                session: harness.key.clone(),
                execution_id,
                result: WorkerResult {
                    success: true,
                    content: "orchestrated answer".into(),
                    new_messages: vec![
                        StoredMessage::user(query),
                        StoredMessage::assistant("orchestrated answer"),
                    ],
                    error: None,
                    usage: TokenUsage::default(),
                },
                target: ResponseTarget {
                    session: harness.key.clone(),
                    origin: ReplyOrigin::Chat {
                        chat_id: "c1".into(),
                    },
                    message_ref: None,
                    is_admin: false,
                },
            })
            .await
            .expect("complete");
        harness.settle().await;

        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].content, "orchestrated answer");
        assert!(state.active_batch.is_none());
        assert!(state.active_workflows.is_empty());
        assert!(state.seen_request("r1"));
    }

    /// A router with no usable workers — specialist and general alike —
    /// degrades to the direct chat loop instead of burning retries.
    #[tokio::test(start_paused = true)]
    async fn router_without_workers_falls_back_to_chat_loop() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response(
            "chat fallback",
        ))]));
        let router = Arc::new(Router::new(WorkerRegistry::new(), provider.clone()));
        let harness = spawn(provider.clone(), RuntimeConfig::default(), Some(router), None);

        harness
            .handle
            .receive(input("hello", "r1"))
            .await
            .expect("receipt");
        harness.settle().await;

        // Exactly one chat-loop call; the unavailable worker was not retried.
        assert_eq!(provider.call_count(), 1);

        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].content, "chat fallback");
        assert!(state.active_batch.is_none());

        let outbox = harness.transport.outbox();
        assert_eq!(
            harness
                .transport
                .current_text(&outbox[0].message_ref)
                .as_deref(),
            Some("chat fallback")
        );
    }

    /// History never exceeds the cap after any number of turns.
    #[tokio::test(start_paused = true)]
    async fn history_stays_bounded() {
        let provider = Arc::new(ScriptedProvider::always("reply"));
        let mut config = RuntimeConfig::default();
        config.limits.max_history = 4;
        let harness = spawn(provider, config, None, None);

        for i in 0..5 {
            harness
                .handle
                .receive(input(&format!("m{i}"), &format!("r{i}")))
                .await
                .expect("receipt");
            harness.settle().await;
        }

        let state = harness.stored().await;
        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.messages[0].content, "m3");
    }
}
