//! Durable session persistence (SQLite) and the in-memory test double.

use crate::SessionKey;
use crate::error::Result;
use crate::llm::Role;
use crate::session::state::{SessionState, StoredMessage};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

/// Static trait for session state stores.
pub trait SessionStore: Send + Sync + 'static {
    /// Load the session snapshot, if one exists.
    fn load(
        &self,
        key: &SessionKey,
    ) -> impl std::future::Future<Output = Result<Option<SessionState>>> + Send;

    /// Persist the full session snapshot.
    fn save(
        &self,
        key: &SessionKey,
        state: &SessionState,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rebuild a best-effort history from the chat-message log after the
    /// durable snapshot was evicted. Stores without a log return None.
    fn restore(
        &self,
        key: &SessionKey,
        max_history: usize,
    ) -> impl std::future::Future<Output = Result<Option<SessionState>>> + Send {
        let _ = (key, max_history);
        async { Ok(None) }
    }
}

/// Dynamic trait for runtime polymorphism.
pub trait SessionStoreDyn: Send + Sync + 'static {
    fn load<'a>(
        &'a self,
        key: &'a SessionKey,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<SessionState>>> + Send + 'a>>;

    fn save<'a>(
        &'a self,
        key: &'a SessionKey,
        state: &'a SessionState,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn restore<'a>(
        &'a self,
        key: &'a SessionKey,
        max_history: usize,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<SessionState>>> + Send + 'a>>;
}

/// Blanket implementation: any `SessionStore` is a `SessionStoreDyn`.
impl<T: SessionStore> SessionStoreDyn for T {
    fn load<'a>(
        &'a self,
        key: &'a SessionKey,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<SessionState>>> + Send + 'a>> {
        Box::pin(SessionStore::load(self, key))
    }

    fn save<'a>(
        &'a self,
        key: &'a SessionKey,
        state: &'a SessionState,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(SessionStore::save(self, key, state))
    }

    fn restore<'a>(
        &'a self,
        key: &'a SessionKey,
        max_history: usize,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<SessionState>>> + Send + 'a>> {
        Box::pin(SessionStore::restore(self, key, max_history))
    }
}

/// Shared store handle.
pub type SharedStore = Arc<dyn SessionStoreDyn>;

/// In-memory store for tests and the memory transport demo.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: tokio::sync::RwLock<HashMap<String, SessionState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<SessionState>> {
        Ok(self.sessions.read().await.get(&key.canonical()).cloned())
    }

    async fn save(&self, key: &SessionKey, state: &SessionState) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(key.canonical(), state.clone());
        Ok(())
    }
}

/// SQLite-backed session store: one JSON snapshot row per session.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the session tables.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_key TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create sessions table")?;

        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<SessionState>> {
        let row = sqlx::query("SELECT state FROM sessions WHERE session_key = ?")
            .bind(key.canonical())
            .fetch_optional(&self.pool)
            .await
            .context("failed to load session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.try_get("state")?;
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt session snapshot for {key}"))?;
        Ok(Some(state))
    }

    async fn save(&self, key: &SessionKey, state: &SessionState) -> Result<()> {
        let raw = serde_json::to_string(state).context("failed to serialize session state")?;

        sqlx::query(
            r#"
            INSERT INTO sessions (session_key, user_id, chat_id, state, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_key) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.canonical())
        .bind(&state.user_id)
        .bind(&state.chat_id)
        .bind(raw)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to save session")?;

        Ok(())
    }

    async fn restore(&self, key: &SessionKey, max_history: usize) -> Result<Option<SessionState>> {
        let rows = sqlx::query(
            r#"
            SELECT role, content, created_at
            FROM chat_messages
            WHERE session_key = ?
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(key.canonical())
        .bind(max_history as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to read chat-message log")?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut messages: Vec<StoredMessage> = rows
            .into_iter()
            .filter_map(|row| {
                let role: String = row.try_get("role").ok()?;
                let content: String = row.try_get("content").ok()?;
                let role = match role.as_str() {
                    "user" => Role::User,
                    "assistant" => Role::Assistant,
                    "system" => Role::System,
                    _ => return None,
                };
                Some(StoredMessage { role, content })
            })
            .collect();
        messages.reverse();

        let now = chrono::Utc::now();
        let mut state = SessionState::new(key.user_id.clone(), key.chat_id.clone(), now);
        state.messages = messages;
        state.trim_history(max_history);

        tracing::info!(
            session = %key,
            restored = state.messages.len(),
            "restored session history from chat-message log"
        );

        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Platform;
    use chrono::Utc;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemorySessionStore::new();
        let key = SessionKey::new(Platform::Rest, "u", "c");
        assert!(
            SessionStore::load(&store, &key)
                .await
                .expect("load")
                .is_none()
        );

        let mut state = SessionState::new("u", "c", Utc::now());
        state.push_turn("hi", "hello", 100, Utc::now());
        SessionStore::save(&store, &key, &state).await.expect("save");

        let loaded = SessionStore::load(&store, &key)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.messages, state.messages);
    }

    #[tokio::test]
    async fn memory_store_has_no_restore_log() {
        let store = MemorySessionStore::new();
        let key = SessionKey::new(Platform::Rest, "u", "c");
        assert!(
            SessionStore::restore(&store, &key, 10)
                .await
                .expect("restore")
                .is_none()
        );
    }
}
