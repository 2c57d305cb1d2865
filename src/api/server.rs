//! HTTP server setup: router and API route wiring.

use crate::runtime::SessionRuntime;
use crate::{Platform, SessionKey};
use axum::Router;
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<SessionRuntime>,
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/messages", post(receive_message))
        .route("/v1/messages/sync", post(handle_sync))
        .route("/v1/callbacks", post(receive_callback))
        .route(
            "/v1/sessions/{platform}/{user}/{chat}/batch",
            get(batch_state),
        )
        .route(
            "/v1/sessions/{platform}/{user}/{chat}/clear",
            post(clear_history),
        )
        .with_state(state)
}

/// Start the HTTP server on the given address.
pub async fn serve(bind: SocketAddr, state: ApiState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "api server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct InboundBody {
    platform: Platform,
    message: serde_json::Value,
}

async fn receive_message(
    State(state): State<ApiState>,
    Json(body): Json<InboundBody>,
) -> Response {
    match state
        .runtime
        .queue_message(body.platform, &body.message)
        .await
    {
        Ok(receipt) => Json(receipt).into_response(),
        Err(error) => error_response(error),
    }
}

async fn handle_sync(State(state): State<ApiState>, Json(body): Json<InboundBody>) -> Response {
    match state.runtime.handle(body.platform, &body.message).await {
        Ok(reply) => Json(serde_json::json!({ "text": reply })).into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    platform: Platform,
    user_id: String,
    chat_id: String,
    callback_query_id: String,
    data: String,
}

async fn receive_callback(
    State(state): State<ApiState>,
    Json(body): Json<CallbackBody>,
) -> Response {
    let key = SessionKey::new(body.platform, body.user_id, body.chat_id);
    match state
        .runtime
        .receive_callback(&key, &body.callback_query_id, &body.data)
        .await
    {
        Ok(text) => Json(serde_json::json!({ "text": text })).into_response(),
        Err(error) => error_response(error),
    }
}

fn session_key(platform: &str, user: &str, chat: &str) -> Result<SessionKey, Response> {
    let platform: Platform = platform.parse().map_err(|error: String| {
        (StatusCode::BAD_REQUEST, error).into_response()
    })?;
    Ok(SessionKey::new(platform, user, chat))
}

async fn batch_state(
    State(state): State<ApiState>,
    Path((platform, user, chat)): Path<(String, String, String)>,
) -> Response {
    let key = match session_key(&platform, &user, &chat) {
        Ok(key) => key,
        Err(response) => return response,
    };
    match state.runtime.batch_state(&key).await {
        Ok(view) => Json(view).into_response(),
        Err(error) => error_response(error),
    }
}

async fn clear_history(
    State(state): State<ApiState>,
    Path((platform, user, chat)): Path<(String, String, String)>,
) -> Response {
    let key = match session_key(&platform, &user, &chat) {
        Ok(key) => key,
        Err(response) => return response,
    };
    match state.runtime.clear_history(&key).await {
        Ok(text) => Json(serde_json::json!({ "text": text })).into_response(),
        Err(error) => error_response(error),
    }
}

fn error_response(error: crate::Error) -> Response {
    let status = match &error {
        crate::Error::Transport(crate::error::TransportError::Parse(_)) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(%error, "api request failed");
    (status, error.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_parses_platform() {
        let key = session_key("rest", "u", "c").expect("key");
        assert_eq!(key.platform, Platform::Rest);
        assert!(session_key("fax", "u", "c").is_err());
    }

    #[test]
    fn inbound_body_deserializes() {
        let body: InboundBody = serde_json::from_value(serde_json::json!({
            "platform": "rest",
            "message": {"text": "hi", "user_id": "u", "chat_id": "c"},
        }))
        .expect("body");
        assert_eq!(body.platform, Platform::Rest);
        assert_eq!(body.message["text"], "hi");
    }
}
