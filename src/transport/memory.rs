//! In-process transport: records everything it is asked to deliver.
//!
//! Backs the test suite and the local demo mode; failure injection covers the
//! edit-fallback and retry paths.

use crate::error::{Result, TransportError};
use crate::transport::traits::{Markup, Transport};
use crate::{InputMetadata, MessageRef, ParsedInput, Platform, ReplyOrigin};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One delivered message and its edit history.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub origin: ReplyOrigin,
    pub message_ref: MessageRef,
    pub text: String,
    pub edits: Vec<String>,
}

#[derive(Default)]
pub struct MemoryTransport {
    outbox: Mutex<Vec<OutboxMessage>>,
    typing_count: std::sync::atomic::AtomicUsize,
    fail_sends: AtomicBool,
    fail_edits: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything sent so far.
    pub fn outbox(&self) -> Vec<OutboxMessage> {
        self.outbox.lock().expect("outbox poisoned").clone()
    }

    /// Latest rendered text of the message with the given ref.
    pub fn current_text(&self, message: &MessageRef) -> Option<String> {
        self.outbox
            .lock()
            .expect("outbox poisoned")
            .iter()
            .find(|entry| entry.message_ref == *message)
            .map(|entry| {
                entry
                    .edits
                    .last()
                    .cloned()
                    .unwrap_or_else(|| entry.text.clone())
            })
    }

    pub fn typing_count(&self) -> usize {
        self.typing_count.load(Ordering::SeqCst)
    }

    /// Make every subsequent send fail with a transient error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent edit fail with a transient error.
    pub fn set_fail_edits(&self, fail: bool) {
        self.fail_edits.store(fail, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn platform(&self) -> Platform {
        Platform::Rest
    }

    fn markup(&self) -> Markup {
        Markup::Plain
    }

    fn parse(&self, raw: &serde_json::Value) -> Result<ParsedInput> {
        let text = raw
            .get("text")
            .and_then(|value| value.as_str())
            .ok_or_else(|| TransportError::Parse("missing text".into()))?
            .to_string();
        let user_id = raw
            .get("user_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| TransportError::Parse("missing user_id".into()))?
            .to_string();
        let chat_id = raw
            .get("chat_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| TransportError::Parse("missing chat_id".into()))?
            .to_string();

        let field = |name: &str| {
            raw.get(name)
                .and_then(|value| value.as_str())
                .map(str::to_string)
        };

        Ok(ParsedInput {
            text,
            user_id,
            chat_id: chat_id.clone(),
            username: field("username"),
            metadata: InputMetadata::Rest {
                request_id: field("request_id"),
                event_id: field("event_id"),
                is_admin: raw
                    .get("is_admin")
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false),
                reply_url: None,
            },
            origin: ReplyOrigin::Chat { chat_id },
        })
    }

    async fn send(&self, origin: &ReplyOrigin, text: &str) -> Result<MessageRef> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Transient("send failed (injected)".into()).into());
        }

        let message_ref = MessageRef::new(uuid::Uuid::new_v4().to_string());
        self.outbox.lock().expect("outbox poisoned").push(OutboxMessage {
            origin: origin.clone(),
            message_ref: message_ref.clone(),
            text: text.to_string(),
            edits: Vec::new(),
        });
        Ok(message_ref)
    }

    async fn edit(&self, _origin: &ReplyOrigin, message: &MessageRef, text: &str) -> Result<()> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(TransportError::Transient("edit failed (injected)".into()).into());
        }

        let mut outbox = self.outbox.lock().expect("outbox poisoned");
        let entry = outbox
            .iter_mut()
            .find(|entry| entry.message_ref == *message)
            .ok_or_else(|| TransportError::Transient(format!("no such message: {message}")))?;
        entry.edits.push(text.to_string());
        Ok(())
    }

    async fn typing(&self, _origin: &ReplyOrigin) -> Result<()> {
        self.typing_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_then_edit_tracks_current_text() {
        let transport = MemoryTransport::new();
        let origin = ReplyOrigin::Chat {
            chat_id: "c".into(),
        };

        let message = transport.send(&origin, "thinking").await.expect("send");
        assert_eq!(
            transport.current_text(&message).as_deref(),
            Some("thinking")
        );

        transport
            .edit(&origin, &message, "done")
            .await
            .expect("edit");
        assert_eq!(transport.current_text(&message).as_deref(), Some("done"));
        assert_eq!(transport.outbox().len(), 1);
    }

    #[tokio::test]
    async fn injected_edit_failures_are_transient() {
        let transport = MemoryTransport::new();
        let origin = ReplyOrigin::Chat {
            chat_id: "c".into(),
        };
        let message = transport.send(&origin, "x").await.expect("send");

        transport.set_fail_edits(true);
        let error = transport
            .edit(&origin, &message, "y")
            .await
            .expect_err("edit should fail");
        assert_eq!(
            error.kind(),
            Some(crate::ErrorKind::TransientTransport)
        );
    }

    #[test]
    fn parse_requires_core_fields() {
        let transport = MemoryTransport::new();
        let ok = transport
            .parse(&serde_json::json!({
                "text": "hi", "user_id": "u", "chat_id": "c", "request_id": "r1"
            }))
            .expect("parse");
        assert_eq!(ok.metadata.request_id(), Some("r1"));

        let missing = transport.parse(&serde_json::json!({"text": "hi"}));
        assert!(missing.is_err());
    }
}
