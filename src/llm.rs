//! LLM provider contract and the bundled HTTP implementation.

pub mod http;
pub mod provider;

pub use http::HttpProvider;
pub use provider::{
    ChatMessage, ChatOptions, ChatResponse, LlmProvider, LlmProviderDyn, Role, SharedProvider,
    TokenUsage, ToolCall, ToolSpec,
};
