//! REST transport: replies are POSTed to the caller-supplied callback URL.

use crate::error::{Result, TransportError};
use crate::transport::traits::{Markup, Transport};
use crate::{InputMetadata, MessageRef, ParsedInput, Platform, ReplyOrigin};
use anyhow::Context as _;
use serde::Deserialize;

pub struct RestTransport {
    client: reqwest::Client,
}

impl RestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .with_context(|| "failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn callback_url<'a>(&self, origin: &'a ReplyOrigin) -> Result<&'a str> {
        match origin {
            ReplyOrigin::Callback { url } => Ok(url),
            other => Err(TransportError::Permanent(format!(
                "rest transport cannot deliver to origin {other:?}"
            ))
            .into()),
        }
    }

    async fn post(&self, url: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|error| TransportError::Transient(error.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(TransportError::Permanent(format!("callback returned {status}")).into());
        }
        if !status.is_success() {
            return Err(TransportError::Transient(format!("callback returned {status}")).into());
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct CallbackAck {
    message_id: Option<String>,
}

impl Transport for RestTransport {
    fn name(&self) -> &str {
        "rest"
    }

    fn platform(&self) -> Platform {
        Platform::Rest
    }

    fn markup(&self) -> Markup {
        Markup::Markdown
    }

    fn parse(&self, raw: &serde_json::Value) -> Result<ParsedInput> {
        let field = |name: &str| {
            raw.get(name)
                .and_then(|value| value.as_str())
                .map(str::to_string)
        };
        let required = |name: &str| {
            field(name).ok_or_else(|| TransportError::Parse(format!("missing {name}")))
        };

        let chat_id = required("chat_id")?;
        let reply_url = field("reply_url");
        let origin = match &reply_url {
            Some(url) => ReplyOrigin::Callback { url: url.clone() },
            None => ReplyOrigin::Chat {
                chat_id: chat_id.clone(),
            },
        };

        Ok(ParsedInput {
            text: required("text")?,
            user_id: required("user_id")?,
            chat_id,
            username: field("username"),
            metadata: InputMetadata::Rest {
                request_id: field("request_id"),
                event_id: field("event_id"),
                is_admin: raw
                    .get("is_admin")
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false),
                reply_url,
            },
            origin,
        })
    }

    async fn send(&self, origin: &ReplyOrigin, text: &str) -> Result<MessageRef> {
        let url = self.callback_url(origin)?;
        let response = self
            .post(url, serde_json::json!({ "text": text }))
            .await?;

        let ack: Option<CallbackAck> = response.json().await.ok();
        let id = ack
            .and_then(|ack| ack.message_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(MessageRef::new(id))
    }

    async fn edit(&self, origin: &ReplyOrigin, message: &MessageRef, text: &str) -> Result<()> {
        let url = self.callback_url(origin)?;
        self.post(
            url,
            serde_json::json!({ "message_id": message.id, "text": text }),
        )
        .await?;
        Ok(())
    }
}
