//! Relaybot: a per-session conversational agent runtime with batched ingress,
//! alarm-driven processing, and worker delegation.

pub mod api;
pub mod chat;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod llm;
pub mod observability;
pub mod progress;
pub mod router;
pub mod runtime;
pub mod session;
pub mod tools;
pub mod transport;

pub use error::{Error, ErrorKind, Result};

use serde::{Deserialize, Serialize};

/// Batch identifier type.
pub type BatchId = uuid::Uuid;

/// Worker execution identifier type.
pub type ExecutionId = uuid::Uuid;

/// Chat platforms a session can be bound to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Telegram,
    Github,
    Rest,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Github => "github",
            Platform::Rest => "rest",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Platform::Telegram),
            "github" => Ok(Platform::Github),
            "rest" => Ok(Platform::Rest),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Durable session identity: one session actor per `(platform, user, chat)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub platform: Platform,
    pub user_id: String,
    pub chat_id: String,
}

impl SessionKey {
    pub fn new(platform: Platform, user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            platform,
            user_id: user_id.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Canonical store key, stable across restarts.
    pub fn canonical(&self) -> String {
        format!("{}:{}:{}", self.platform, self.user_id, self.chat_id)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.user_id, self.chat_id)
    }
}

/// Per-platform inbound metadata.
///
/// Each platform carries a fixed set of fields instead of a loose string map,
/// so missing or mistyped metadata is a parse error at the transport boundary
/// rather than a surprise deep in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum InputMetadata {
    Telegram {
        request_id: Option<String>,
        event_id: Option<String>,
        #[serde(default)]
        is_admin: bool,
        /// Message ID to correlate inline-button callbacks.
        callback_message_id: Option<i64>,
    },
    Github {
        request_id: Option<String>,
        event_id: Option<String>,
        #[serde(default)]
        is_admin: bool,
        repo: String,
        issue_number: u64,
    },
    Rest {
        request_id: Option<String>,
        event_id: Option<String>,
        #[serde(default)]
        is_admin: bool,
        /// Callback URL for reply delivery, when the caller wants one.
        reply_url: Option<String>,
    },
}

impl InputMetadata {
    pub fn platform(&self) -> Platform {
        match self {
            InputMetadata::Telegram { .. } => Platform::Telegram,
            InputMetadata::Github { .. } => Platform::Github,
            InputMetadata::Rest { .. } => Platform::Rest,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            InputMetadata::Telegram { request_id, .. }
            | InputMetadata::Github { request_id, .. }
            | InputMetadata::Rest { request_id, .. } => request_id.as_deref(),
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            InputMetadata::Telegram { event_id, .. }
            | InputMetadata::Github { event_id, .. }
            | InputMetadata::Rest { event_id, .. } => event_id.as_deref(),
        }
    }

    pub fn is_admin(&self) -> bool {
        match self {
            InputMetadata::Telegram { is_admin, .. }
            | InputMetadata::Github { is_admin, .. }
            | InputMetadata::Rest { is_admin, .. } => *is_admin,
        }
    }
}

/// Opaque per-transport context needed to reply on the originating channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyOrigin {
    /// A plain chat conversation (Telegram chats, REST sessions).
    Chat { chat_id: String },
    /// A code-hosting issue or pull-request thread.
    Issue { repo: String, number: u64 },
    /// An HTTP callback endpoint the reply is POSTed to.
    Callback { url: String },
}

/// Transport-specific handle to a previously sent message, used for edits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
}

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// A message parsed from a transport event, normalised across platforms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedInput {
    pub text: String,
    pub user_id: String,
    pub chat_id: String,
    pub username: Option<String>,
    pub metadata: InputMetadata,
    pub origin: ReplyOrigin,
}

impl ParsedInput {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(
            self.metadata.platform(),
            self.user_id.clone(),
            self.chat_id.clone(),
        )
    }
}

/// Everything a worker needs to deliver a reply on the original channel.
///
/// Rebuilt from the inbound message on each delegation; platform credentials
/// live on the transport adapters and are never part of this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseTarget {
    pub session: SessionKey,
    pub origin: ReplyOrigin,
    /// Progress message to edit in place, when one was sent.
    pub message_ref: Option<MessageRef>,
    /// Whether the requesting user gets the admin debug footer.
    pub is_admin: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_canonical_is_stable() {
        let key = SessionKey::new(Platform::Telegram, "42", "chat-9");
        assert_eq!(key.canonical(), "telegram:42:chat-9");
        assert_eq!(key.to_string(), key.canonical());
    }

    #[test]
    fn platform_round_trips_through_str() {
        for platform in [Platform::Telegram, Platform::Github, Platform::Rest] {
            let parsed: Platform = platform.as_str().parse().expect("parse");
            assert_eq!(parsed, platform);
        }
        assert!("irc".parse::<Platform>().is_err());
    }

    #[test]
    fn metadata_accessors_cover_all_platforms() {
        let telegram = InputMetadata::Telegram {
            request_id: Some("r1".into()),
            event_id: Some("e1".into()),
            is_admin: true,
            callback_message_id: None,
        };
        assert_eq!(telegram.request_id(), Some("r1"));
        assert_eq!(telegram.event_id(), Some("e1"));
        assert!(telegram.is_admin());
        assert_eq!(telegram.platform(), Platform::Telegram);

        let github = InputMetadata::Github {
            request_id: None,
            event_id: None,
            is_admin: false,
            repo: "owner/repo".into(),
            issue_number: 7,
        };
        assert_eq!(github.request_id(), None);
        assert!(!github.is_admin());
        assert_eq!(github.platform(), Platform::Github);
    }
}
