//! Fire-and-forget event log and chat-message log.
//!
//! Writes never block the message path and never raise; a failed write is a
//! logged warning and a bumped counter, nothing more.

use crate::SessionKey;
use crate::llm::{Role, TokenUsage};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Lifecycle status of one event row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Success,
    Error,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Success => "success",
            EventStatus::Error => "error",
        }
    }
}

/// Partial update of one event row, keyed by `event_id`. Absent fields keep
/// their stored values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventPatch {
    pub event_id: String,
    pub status: Option<EventStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub response: Option<String>,
    pub classification: Option<String>,
    pub agents: Option<Vec<String>>,
    pub tokens: Option<TokenUsage>,
}

impl EventPatch {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn duration_ms(mut self, value: u64) -> Self {
        self.duration_ms = Some(value);
        self
    }

    pub fn response(mut self, value: impl Into<String>) -> Self {
        self.response = Some(value.into());
        self
    }

    pub fn classification(mut self, value: impl Into<String>) -> Self {
        self.classification = Some(value.into());
        self
    }

    pub fn agents(mut self, value: Vec<String>) -> Self {
        self.agents = Some(value);
        self
    }

    pub fn tokens(mut self, value: TokenUsage) -> Self {
        self.tokens = Some(value);
        self
    }
}

/// Event sink contract: both calls enqueue and return immediately.
pub trait EventSink: Send + Sync + 'static {
    fn upsert_event(&self, patch: EventPatch);

    fn append_chat_message(&self, session: &SessionKey, role: Role, content: &str);
}

/// Shared sink handle.
pub type SharedSink = Arc<dyn EventSink>;

/// Sink that drops everything.
#[derive(Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn upsert_event(&self, _patch: EventPatch) {}

    fn append_chat_message(&self, _session: &SessionKey, _role: Role, _content: &str) {}
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemorySink {
    pub events: std::sync::Mutex<Vec<EventPatch>>,
    pub messages: std::sync::Mutex<Vec<(String, Role, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, event_id: &str) -> Vec<EventPatch> {
        self.events
            .lock()
            .expect("events poisoned")
            .iter()
            .filter(|patch| patch.event_id == event_id)
            .cloned()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn upsert_event(&self, patch: EventPatch) {
        self.events.lock().expect("events poisoned").push(patch);
    }

    fn append_chat_message(&self, session: &SessionKey, role: Role, content: &str) {
        self.messages.lock().expect("messages poisoned").push((
            session.canonical(),
            role,
            content.to_string(),
        ));
    }
}

enum SinkOp {
    Event(EventPatch),
    ChatMessage {
        session_key: String,
        role: Role,
        content: String,
    },
}

/// SQLite sink: writes flow through a channel drained by a background task.
pub struct SqliteEventSink {
    tx: mpsc::UnboundedSender<SinkOp>,
}

impl SqliteEventSink {
    /// Create the sink and spawn its drain task.
    pub fn new(pool: SqlitePool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = match op {
                    SinkOp::Event(patch) => write_event(&pool, patch).await,
                    SinkOp::ChatMessage {
                        session_key,
                        role,
                        content,
                    } => write_chat_message(&pool, &session_key, role, &content).await,
                };
                if let Err(error) = result {
                    BACKGROUND_FAILURES.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%error, "observability write failed");
                }
            }
        });

        Self { tx }
    }

    /// Initialize the event and chat-message tables.
    pub async fn initialize(pool: &SqlitePool) -> crate::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TIMESTAMP,
                completed_at TIMESTAMP,
                duration_ms INTEGER,
                response TEXT,
                classification TEXT,
                agents TEXT,
                tokens_input INTEGER,
                tokens_output INTEGER,
                tokens_cached INTEGER,
                tokens_reasoning INTEGER
            )
            "#,
        )
        .execute(pool)
        .await
        .context("failed to create events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await
        .context("failed to create chat_messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_key, seq)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

impl EventSink for SqliteEventSink {
    fn upsert_event(&self, patch: EventPatch) {
        if self.tx.send(SinkOp::Event(patch)).is_err() {
            tracing::warn!("observability drain task is gone, event dropped");
        }
    }

    fn append_chat_message(&self, session: &SessionKey, role: Role, content: &str) {
        let op = SinkOp::ChatMessage {
            session_key: session.canonical(),
            role,
            content: content.to_string(),
        };
        if self.tx.send(op).is_err() {
            tracing::warn!("observability drain task is gone, message dropped");
        }
    }
}

async fn write_event(pool: &SqlitePool, patch: EventPatch) -> anyhow::Result<()> {
    sqlx::query("INSERT OR IGNORE INTO events (event_id) VALUES (?)")
        .bind(&patch.event_id)
        .execute(pool)
        .await
        .context("failed to insert event row")?;

    let agents_json = match &patch.agents {
        Some(agents) => Some(serde_json::to_string(agents)?),
        None => None,
    };

    sqlx::query(
        r#"
        UPDATE events SET
            status = COALESCE(?, status),
            started_at = COALESCE(?, started_at),
            completed_at = COALESCE(?, completed_at),
            duration_ms = COALESCE(?, duration_ms),
            response = COALESCE(?, response),
            classification = COALESCE(?, classification),
            agents = COALESCE(?, agents),
            tokens_input = COALESCE(?, tokens_input),
            tokens_output = COALESCE(?, tokens_output),
            tokens_cached = COALESCE(?, tokens_cached),
            tokens_reasoning = COALESCE(?, tokens_reasoning)
        WHERE event_id = ?
        "#,
    )
    .bind(patch.status.map(EventStatus::as_str))
    .bind(patch.started_at)
    .bind(patch.completed_at)
    .bind(patch.duration_ms.map(|value| value as i64))
    .bind(&patch.response)
    .bind(&patch.classification)
    .bind(agents_json)
    .bind(patch.tokens.map(|tokens| tokens.input as i64))
    .bind(patch.tokens.map(|tokens| tokens.output as i64))
    .bind(patch.tokens.map(|tokens| tokens.cached as i64))
    .bind(patch.tokens.map(|tokens| tokens.reasoning as i64))
    .bind(&patch.event_id)
    .execute(pool)
    .await
    .context("failed to update event row")?;

    Ok(())
}

async fn write_chat_message(
    pool: &SqlitePool,
    session_key: &str,
    role: Role,
    content: &str,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO chat_messages (session_key, role, content) VALUES (?, ?, ?)")
        .bind(session_key)
        .bind(role.as_str())
        .bind(content)
        .execute(pool)
        .await
        .context("failed to append chat message")?;
    Ok(())
}

static BACKGROUND_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Spawn fallible post-processing without awaiting it. Failures are logged
/// and counted, never surfaced.
pub fn background<F>(name: &'static str, task: F)
where
    F: std::future::Future<Output = crate::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(error) = task.await {
            BACKGROUND_FAILURES.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task = name, %error, "background task failed");
        }
    });
}

/// Count of background tasks and observability writes that failed so far.
pub fn background_failure_count() -> u64 {
    BACKGROUND_FAILURES.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Platform;

    #[test]
    fn memory_sink_records_patches_in_order() {
        let sink = MemorySink::new();
        sink.upsert_event(EventPatch::new("e1").status(EventStatus::Pending));
        sink.upsert_event(
            EventPatch::new("e1")
                .status(EventStatus::Success)
                .duration_ms(42),
        );

        let patches = sink.events_for("e1");
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].status, Some(EventStatus::Pending));
        assert_eq!(patches[1].duration_ms, Some(42));
    }

    #[tokio::test]
    async fn background_failures_are_counted_not_raised() {
        let before = background_failure_count();
        background("test_failure", async {
            Err(anyhow::anyhow!("expected").into())
        });
        background("test_success", async { Ok(()) });

        // Give the spawned tasks a moment to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(background_failure_count(), before + 1);
    }

    #[test]
    fn chat_messages_carry_session_key() {
        let sink = MemorySink::new();
        let key = SessionKey::new(Platform::Rest, "u", "c");
        sink.append_chat_message(&key, Role::User, "hello");

        let messages = sink.messages.lock().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "rest:u:c");
    }
}
