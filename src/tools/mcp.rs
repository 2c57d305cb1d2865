//! Remote tools served by MCP servers, connected lazily per session.

use crate::config::{McpServerConfig, McpTransport};
use crate::tools::registry::{SharedTool, Tool, ToolFailure};
use anyhow::{Context as _, anyhow};
use rmcp::ClientHandler;
use rmcp::service::{RoleClient, RunningService};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

type McpClientSession = RunningService<RoleClient, McpClient>;

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum McpConnectionState {
    Connecting,
    Connected,
    Failed(String),
    Disconnected,
}

#[derive(Clone, Default)]
struct McpClient;

impl ClientHandler for McpClient {
    fn get_info(&self) -> rmcp::model::ClientInfo {
        let client_info = rmcp::model::Implementation::new("relaybot", env!("CARGO_PKG_VERSION"))
            .with_description("Relaybot MCP client");
        rmcp::model::ClientInfo::new(rmcp::model::ClientCapabilities::default(), client_info)
    }
}

/// One MCP server connection with cached tool metadata.
pub struct McpConnection {
    config: McpServerConfig,
    state: RwLock<McpConnectionState>,
    client: Mutex<Option<McpClientSession>>,
    tools: RwLock<Vec<rmcp::model::Tool>>,
}

impl McpConnection {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(McpConnectionState::Disconnected),
            client: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn state(&self) -> McpConnectionState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.state().await, McpConnectionState::Connected)
    }

    /// Connect and list tools, bounded by `timeout` so a dead server cannot
    /// block the session actor.
    pub async fn connect(&self, timeout: Duration) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            *state = McpConnectionState::Connecting;
        }

        let attempt = tokio::time::timeout(timeout, self.connect_session()).await;
        let session_result = match attempt {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "mcp server '{}' did not connect within {timeout:?}",
                self.name()
            )),
        };

        match session_result {
            Ok(session) => {
                let tools = session
                    .list_all_tools()
                    .await
                    .with_context(|| format!("failed to list tools for '{}'", self.name()));

                match tools {
                    Ok(tools) => {
                        *self.tools.write().await = tools;
                        *self.client.lock().await = Some(session);
                        *self.state.write().await = McpConnectionState::Connected;
                        Ok(())
                    }
                    Err(error) => {
                        let message = error.to_string();
                        *self.state.write().await = McpConnectionState::Failed(message.clone());
                        Err(anyhow!(message))
                    }
                }
            }
            Err(error) => {
                let message = error.to_string();
                *self.state.write().await = McpConnectionState::Failed(message.clone());
                Err(anyhow!(message))
            }
        }
    }

    pub async fn list_tools(&self) -> Vec<rmcp::model::Tool> {
        self.tools.read().await.clone()
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<rmcp::model::CallToolResult> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            _ => return Err(anyhow!("mcp tool arguments must be a JSON object or null")),
        };

        let client_guard = self.client.lock().await;
        let Some(client) = client_guard.as_ref() else {
            return Err(anyhow!("mcp server '{}' is not connected", self.name()));
        };

        let params = rmcp::model::CallToolRequestParams::new(Cow::Owned(tool_name.to_string()));
        let params = match arguments {
            Some(arguments) => params.with_arguments(arguments),
            None => params,
        };

        client
            .call_tool(params)
            .await
            .map_err(|error| anyhow!("mcp call failed: {error}"))
    }

    async fn connect_session(&self) -> anyhow::Result<McpClientSession> {
        match &self.config.transport {
            McpTransport::Stdio { command, args } => {
                let mut child_command = tokio::process::Command::new(command);
                child_command.args(args);

                let transport = rmcp::transport::TokioChildProcess::new(child_command)
                    .with_context(|| {
                        format!("failed to spawn stdio mcp server '{}'", self.name())
                    })?;

                rmcp::serve_client(McpClient, transport)
                    .await
                    .with_context(|| format!("failed to initialize mcp server '{}'", self.name()))
            }
            McpTransport::Http { url } => {
                let transport_config =
                    rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(
                        url.clone(),
                    );
                let transport =
                    rmcp::transport::StreamableHttpClientTransport::from_config(transport_config);

                rmcp::serve_client(McpClient, transport)
                    .await
                    .with_context(|| format!("failed to initialize mcp server '{}'", self.name()))
            }
        }
    }
}

/// Lazily initialised set of MCP connections owned by one session actor.
pub struct McpManager {
    connections: Vec<Arc<McpConnection>>,
    connect_timeout: Duration,
    initialized: tokio::sync::Mutex<bool>,
}

impl McpManager {
    pub fn new(configs: &[McpServerConfig], connect_timeout: Duration) -> Self {
        let connections = configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| Arc::new(McpConnection::new(config.clone())))
            .collect();

        Self {
            connections,
            connect_timeout,
            initialized: tokio::sync::Mutex::new(false),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.connections.is_empty()
    }

    /// Connect all enabled servers once. Individual failures are logged and
    /// skipped; the session works with whatever connected.
    pub async fn ensure_initialized(&self) {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return;
        }

        for connection in &self.connections {
            if let Err(error) = connection.connect(self.connect_timeout).await {
                tracing::warn!(
                    server = %connection.name(),
                    %error,
                    "failed to connect mcp server"
                );
            }
        }

        *initialized = true;
    }

    /// Forget the lazy-init flag so `/clear` forces a fresh connect pass.
    pub async fn reset(&self) {
        let mut initialized = self.initialized.lock().await;
        *initialized = false;

        for connection in &self.connections {
            let mut client = connection.client.lock().await;
            *client = None;
            *connection.state.write().await = McpConnectionState::Disconnected;
            connection.tools.write().await.clear();
        }
    }

    /// Remote tools as registry adapters, one per connected server tool.
    pub async fn remote_tools(&self) -> Vec<SharedTool> {
        let mut adapters: Vec<SharedTool> = Vec::new();
        for connection in &self.connections {
            if !connection.is_connected().await {
                continue;
            }
            for tool in connection.list_tools().await {
                adapters.push(Arc::new(RemoteTool::new(connection.clone(), tool)));
            }
        }
        adapters
    }
}

/// Adapter exposing one remote MCP tool through the local `Tool` trait.
pub struct RemoteTool {
    connection: Arc<McpConnection>,
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl RemoteTool {
    fn new(connection: Arc<McpConnection>, tool: rmcp::model::Tool) -> Self {
        let parameters = tool.schema_as_json_value();
        let description = tool
            .description
            .map(|description| description.into_owned())
            .unwrap_or_default();

        Self {
            connection,
            name: tool.name.into_owned(),
            description,
            parameters,
        }
    }

    fn collect_result_text(result: &rmcp::model::CallToolResult) -> String {
        let mut blocks = result
            .content
            .iter()
            .map(|content| match &content.raw {
                rmcp::model::RawContent::Text(text) => text.text.clone(),
                other => serde_json::to_string(other)
                    .unwrap_or_else(|_| "[unsupported mcp content]".to_string()),
            })
            .collect::<Vec<_>>();

        if let Some(structured_content) = &result.structured_content {
            blocks.push(structured_content.to_string());
        }

        blocks.join("\n")
    }
}

impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    async fn call(&self, args: serde_json::Value) -> std::result::Result<String, ToolFailure> {
        let result = self
            .connection
            .call_tool(&self.name, args)
            .await
            .map_err(|error| ToolFailure::new(error.to_string()))?;

        let text = Self::collect_result_text(&result);
        if result.is_error.unwrap_or(false) {
            let message = if text.is_empty() {
                format!(
                    "MCP server '{}' reported an error calling '{}'",
                    self.connection.name(),
                    self.name
                )
            } else {
                text
            };
            return Err(ToolFailure::new(message));
        }

        if text.is_empty() {
            return Ok("[tool returned no content]".to_string());
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{McpServerConfig, McpTransport};

    fn config(name: &str, enabled: bool) -> McpServerConfig {
        McpServerConfig {
            name: name.into(),
            transport: McpTransport::Http {
                url: "http://localhost:9/mcp".into(),
            },
            enabled,
        }
    }

    #[tokio::test]
    async fn disabled_servers_are_not_tracked() {
        let manager = McpManager::new(
            &[config("a", true), config("b", false)],
            Duration::from_secs(1),
        );
        assert!(manager.is_configured());
        assert_eq!(manager.connections.len(), 1);
    }

    #[tokio::test]
    async fn empty_config_means_not_configured() {
        let manager = McpManager::new(&[], Duration::from_secs(1));
        assert!(!manager.is_configured());
        // ensure_initialized on nothing is a no-op and does not hang
        manager.ensure_initialized().await;
        assert!(manager.remote_tools().await.is_empty());
    }

    #[tokio::test]
    async fn calling_a_disconnected_server_fails() {
        let connection = McpConnection::new(config("a", true));
        let error = connection
            .call_tool("anything", serde_json::json!({}))
            .await
            .expect_err("not connected");
        assert!(error.to_string().contains("not connected"));
    }
}
