//! Transport trait and dynamic dispatch companion.

use crate::error::{Result, TransportError};
use crate::{MessageRef, ParsedInput, Platform, ReplyOrigin};
use std::pin::Pin;
use std::sync::Arc;

/// Markup subset a transport can render without mangling the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Markup {
    Plain,
    Markdown,
    Html,
}

/// Static trait for chat transports.
/// Use this for type-safe implementations.
pub trait Transport: Send + Sync + 'static {
    /// Unique name for this adapter.
    fn name(&self) -> &str;

    /// The platform this adapter serves.
    fn platform(&self) -> Platform;

    /// What the adapter can render; replies are sanitised down to this.
    fn markup(&self) -> Markup {
        Markup::Plain
    }

    /// Parse a raw inbound event into a normalised input.
    fn parse(&self, raw: &serde_json::Value) -> Result<ParsedInput>;

    /// Send a new message on the originating channel.
    fn send(
        &self,
        origin: &ReplyOrigin,
        text: &str,
    ) -> impl std::future::Future<Output = Result<MessageRef>> + Send;

    /// Edit a previously sent message. Adapters without edit support keep the
    /// default; callers fall back to `send`.
    fn edit(
        &self,
        origin: &ReplyOrigin,
        message: &MessageRef,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let _ = (origin, message, text);
        async { Err(TransportError::EditUnsupported.into()) }
    }

    /// Refresh the typing indicator.
    fn typing(&self, origin: &ReplyOrigin) -> impl std::future::Future<Output = Result<()>> + Send {
        let _ = origin;
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn TransportDyn>` for storing different adapters.
pub trait TransportDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn platform(&self) -> Platform;

    fn markup(&self) -> Markup;

    fn parse(&self, raw: &serde_json::Value) -> Result<ParsedInput>;

    fn send<'a>(
        &'a self,
        origin: &'a ReplyOrigin,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<MessageRef>> + Send + 'a>>;

    fn edit<'a>(
        &'a self,
        origin: &'a ReplyOrigin,
        message: &'a MessageRef,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn typing<'a>(
        &'a self,
        origin: &'a ReplyOrigin,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing Transport automatically implements TransportDyn.
impl<T: Transport> TransportDyn for T {
    fn name(&self) -> &str {
        Transport::name(self)
    }

    fn platform(&self) -> Platform {
        Transport::platform(self)
    }

    fn markup(&self) -> Markup {
        Transport::markup(self)
    }

    fn parse(&self, raw: &serde_json::Value) -> Result<ParsedInput> {
        Transport::parse(self, raw)
    }

    fn send<'a>(
        &'a self,
        origin: &'a ReplyOrigin,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<MessageRef>> + Send + 'a>> {
        Box::pin(Transport::send(self, origin, text))
    }

    fn edit<'a>(
        &'a self,
        origin: &'a ReplyOrigin,
        message: &'a MessageRef,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Transport::edit(self, origin, message, text))
    }

    fn typing<'a>(
        &'a self,
        origin: &'a ReplyOrigin,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Transport::typing(self, origin))
    }
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn TransportDyn>;
