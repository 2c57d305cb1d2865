//! Session runtime: spawns one actor per session key and fans RPCs into them.

use crate::clock::Clock as _;
use crate::error::{Result, SessionError, TransportError};
use crate::router::WorkerSignal;
use crate::session::actor::{
    BatchStateView, ReceiveReceipt, SessionActor, SessionDeps, SessionHandle,
};
use crate::session::state::SessionState;
use crate::session::store::SessionStoreDyn as _;
use crate::transport::TransportDyn as _;
use crate::{ParsedInput, Platform, SessionKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Owner of all live session actors in this process.
pub struct SessionRuntime {
    deps: SessionDeps,
    actors: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRuntime {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            actors: Mutex::new(HashMap::new()),
        })
    }

    /// Drain worker signals (progress and completion callbacks) into the
    /// owning session actors.
    pub fn spawn_signal_pump(self: &Arc<Self>, mut signal_rx: mpsc::Receiver<WorkerSignal>) {
        let runtime = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let result = match signal {
                    WorkerSignal::Progress {
                        session,
                        execution_id,
                        status,
                    } => match runtime.actor(&session).await {
                        Ok(handle) => handle.worker_progress(execution_id, status).await,
                        Err(error) => Err(error),
                    },
                    WorkerSignal::Complete(completion) => {
                        match runtime.actor(&completion.session).await {
                            Ok(handle) => handle.worker_complete(*completion).await,
                            Err(error) => Err(error),
                        }
                    }
                };
                if let Err(error) = result {
                    tracing::warn!(%error, "failed to route worker signal");
                }
            }
        });
    }

    /// Look up or reconstitute the actor for a session.
    async fn actor(&self, key: &SessionKey) -> Result<SessionHandle> {
        let mut actors = self.actors.lock().await;
        if let Some(handle) = actors.get(&key.canonical()) {
            return Ok(handle.clone());
        }

        let state = self.load_state(key).await?;
        let (actor, handle) = SessionActor::new(key.clone(), state, self.deps.clone());
        tokio::spawn(actor.run());
        actors.insert(key.canonical(), handle.clone());
        tracing::info!(session = %key, "session actor spawned");
        Ok(handle)
    }

    /// Durable snapshot first, chat-log restore second, fresh state last.
    async fn load_state(&self, key: &SessionKey) -> Result<SessionState> {
        if let Some(state) = self.deps.store.load(key).await? {
            return Ok(state);
        }

        let max_history = self.deps.config.load().limits.max_history;
        if let Some(state) = self.deps.store.restore(key, max_history).await? {
            return Ok(state);
        }

        Ok(SessionState::new(
            key.user_id.clone(),
            key.chat_id.clone(),
            self.deps.clock.now(),
        ))
    }

    /// Retry an actor call once after respawning, covering an actor that
    /// crashed or was shut down between lookup and send.
    async fn with_actor<T, F>(&self, key: &SessionKey, call: F) -> Result<T>
    where
        F: Fn(SessionHandle) -> futures::future::BoxFuture<'static, Result<T>>,
    {
        let handle = self.actor(key).await?;
        match call(handle).await {
            Err(crate::Error::Session(SessionError::ActorGone(_))) => {
                tracing::warn!(session = %key, "actor gone, respawning");
                self.actors.lock().await.remove(&key.canonical());
                let handle = self.actor(key).await?;
                call(handle).await
            }
            other => other,
        }
    }

    /// Preferred ingress: queue a parsed message for batch processing.
    pub async fn receive_message(&self, input: ParsedInput) -> Result<ReceiveReceipt> {
        let key = input.session_key();
        self.with_actor(&key, move |handle| {
            let input = input.clone();
            Box::pin(async move { handle.receive(input).await })
        })
        .await
    }

    /// Transport-context ingress: parse a raw event, then queue it.
    pub async fn queue_message(
        &self,
        platform: Platform,
        raw: &serde_json::Value,
    ) -> Result<ReceiveReceipt> {
        let input = self.parse(platform, raw)?;
        self.receive_message(input).await
    }

    /// Synchronous path without batching, for tests and simple transports.
    pub async fn handle(&self, platform: Platform, raw: &serde_json::Value) -> Result<String> {
        let input = self.parse(platform, raw)?;
        let key = input.session_key();
        self.with_actor(&key, move |handle| {
            let input = input.clone();
            Box::pin(async move { handle.handle_direct(input).await })
        })
        .await
    }

    /// Inline-button callback: `data` is `action:payload`.
    pub async fn receive_callback(
        &self,
        key: &SessionKey,
        callback_query_id: &str,
        data: &str,
    ) -> Result<Option<String>> {
        tracing::debug!(
            session = %key,
            callback_query_id,
            "callback received"
        );
        let (action, payload) = data.split_once(':').unwrap_or((data, ""));
        let action = action.to_string();
        let payload = payload.to_string();
        self.with_actor(key, move |handle| {
            let action = action.clone();
            let payload = payload.clone();
            Box::pin(async move { handle.callback(action, payload).await })
        })
        .await
    }

    pub async fn clear_history(&self, key: &SessionKey) -> Result<String> {
        self.with_actor(key, |handle| {
            Box::pin(async move { handle.clear_history().await })
        })
        .await
    }

    pub async fn recover(&self, key: &SessionKey) -> Result<String> {
        self.with_actor(key, |handle| Box::pin(async move { handle.recover().await }))
            .await
    }

    pub async fn batch_state(&self, key: &SessionKey) -> Result<BatchStateView> {
        self.with_actor(key, |handle| {
            Box::pin(async move { handle.batch_state().await })
        })
        .await
    }

    pub async fn metadata(
        &self,
        key: &SessionKey,
    ) -> Result<HashMap<String, serde_json::Value>> {
        self.with_actor(key, |handle| {
            Box::pin(async move { handle.metadata().await })
        })
        .await
    }

    pub async fn set_metadata(
        &self,
        key: &SessionKey,
        name: String,
        value: serde_json::Value,
    ) -> Result<()> {
        self.with_actor(key, move |handle| {
            let name = name.clone();
            let value = value.clone();
            Box::pin(async move { handle.set_metadata(name, value).await })
        })
        .await
    }

    fn parse(&self, platform: Platform, raw: &serde_json::Value) -> Result<ParsedInput> {
        let transport = self
            .deps
            .transports
            .get(&platform)
            .ok_or_else(|| {
                TransportError::Permanent(format!("no transport registered for {platform}"))
            })?;
        transport.parse(raw)
    }
}
