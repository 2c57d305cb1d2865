//! Durable per-session state: message history and the two-batch queue.

use crate::config::TimingConfig;
use crate::llm::Role;
use crate::{BatchId, ExecutionId, MessageRef, ReplyOrigin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Rolling dedup window size for request IDs of completed batches.
pub const REQUEST_ID_WINDOW: usize = 256;

/// One history entry. Only user/assistant/system turns are persisted;
/// tool turns live and die inside a single chat-loop invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
}

impl StoredMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Idle,
    Collecting,
    Processing,
    Delegated,
    Done,
}

/// Coarser user-facing stage trail, kept for diagnostics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStage {
    Queued,
    Processing,
    Retrying,
    Failed,
    Notified,
    Done,
}

/// One recorded stage transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageChange {
    pub stage: BatchStage,
    pub at: DateTime<Utc>,
}

/// One recorded processing failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryError {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// A message waiting in a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMessage {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub username: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    pub event_id: Option<String>,
    pub origin: ReplyOrigin,
}

/// A coalesced group of messages processed as one LLM turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub pending_messages: Vec<PendingMessage>,
    pub batch_started_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Progress message handle, set once after the initial send.
    pub message_ref: Option<MessageRef>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_errors: Vec<RetryError>,
    pub current_stage: BatchStage,
    #[serde(default)]
    pub stage_history: Vec<StageChange>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4(),
            status: BatchStatus::Idle,
            pending_messages: Vec::new(),
            batch_started_at: None,
            last_message_at: None,
            last_heartbeat: None,
            message_ref: None,
            retry_count: 0,
            retry_errors: Vec::new(),
            current_stage: BatchStage::Queued,
            stage_history: Vec::new(),
        }
    }

    /// Record a stage transition with its timestamp.
    pub fn push_stage(&mut self, stage: BatchStage, now: DateTime<Utc>) {
        self.current_stage = stage;
        self.stage_history.push(StageChange { stage, at: now });
    }

    /// Whether this batch holds a message with the given request ID.
    pub fn contains_request(&self, request_id: &str) -> bool {
        self.pending_messages
            .iter()
            .any(|message| message.request_id == request_id)
    }

    /// Stuck predicate: the heartbeat stopped advancing, or a processing
    /// batch never produced one and blew past the hard ceiling.
    pub fn is_stuck(&self, now: DateTime<Utc>, policy: &StuckPolicy) -> bool {
        let executing = matches!(self.status, BatchStatus::Processing | BatchStatus::Delegated);
        if !executing {
            return false;
        }

        match self.last_heartbeat {
            Some(heartbeat) => now.signed_duration_since(heartbeat) > policy.heartbeat_timeout,
            None => {
                self.status == BatchStatus::Processing
                    && self
                        .batch_started_at
                        .is_some_and(|started| now.signed_duration_since(started) > policy.hard_ceiling)
            }
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Stuck-detection windows, lifted out of [`TimingConfig`] so the pure queue
/// functions don't depend on the full runtime config.
#[derive(Debug, Clone, Copy)]
pub struct StuckPolicy {
    pub heartbeat_timeout: chrono::Duration,
    pub hard_ceiling: chrono::Duration,
}

impl From<&TimingConfig> for StuckPolicy {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            heartbeat_timeout: chrono::Duration::from_std(timing.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            hard_ceiling: chrono::Duration::from_std(timing.hard_ceiling)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }
}

/// Reference to a delegated worker execution awaiting its callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowRef {
    pub execution_id: ExecutionId,
    pub worker: String,
    pub started_at: DateTime<Utc>,
    pub message_ref: Option<MessageRef>,
}

/// Durable state of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub messages: Vec<StoredMessage>,
    pub user_id: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Batch currently being processed; immutable while in flight.
    pub active_batch: Option<Batch>,
    /// Batch collecting new messages.
    pub pending_batch: Option<Batch>,
    #[serde(default)]
    pub active_workflows: HashMap<ExecutionId, WorkflowRef>,
    /// Rolling window of request IDs from completed batches.
    #[serde(default)]
    pub processed_request_ids: VecDeque<String>,
}

impl SessionState {
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            messages: Vec::new(),
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            active_batch: None,
            pending_batch: None,
            active_workflows: HashMap::new(),
            processed_request_ids: VecDeque::new(),
        }
    }

    /// Append one `{user, assistant}` turn and trim to the history cap.
    pub fn push_turn(
        &mut self,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        max_history: usize,
        now: DateTime<Utc>,
    ) {
        self.messages.push(StoredMessage::user(user_text));
        self.messages.push(StoredMessage::assistant(assistant_text));
        self.trim_history(max_history);
        self.updated_at = now;
    }

    /// Evict oldest-first until the history fits the cap.
    pub fn trim_history(&mut self, max_history: usize) {
        if self.messages.len() > max_history {
            let excess = self.messages.len() - max_history;
            self.messages.drain(..excess);
        }
    }

    /// Whether a request ID was part of an already-completed batch.
    pub fn seen_request(&self, request_id: &str) -> bool {
        self.processed_request_ids
            .iter()
            .any(|seen| seen == request_id)
    }

    /// Record completed request IDs into the rolling window.
    pub fn record_processed_requests<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            if self.seen_request(id) {
                continue;
            }
            self.processed_request_ids.push_back(id.to_string());
            while self.processed_request_ids.len() > REQUEST_ID_WINDOW {
                self.processed_request_ids.pop_front();
            }
        }
    }

    /// Drop workflow entries whose callback never arrived. Called lazily on
    /// promotion so a dead worker cannot grow the map forever.
    pub fn evict_stale_workflows(&mut self, now: DateTime<Utc>, ceiling: chrono::Duration) {
        self.active_workflows
            .retain(|_, workflow| now.signed_duration_since(workflow.started_at) <= ceiling * 2);
    }
}
