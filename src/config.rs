//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relaybot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path.
    pub data_dir: std::path::PathBuf,

    /// LLM provider configuration.
    pub llm: LlmConfig,

    /// Inbound API server configuration.
    pub api: ApiConfig,

    /// Session runtime tuning.
    pub runtime: RuntimeConfig,
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    pub base_url: String,

    /// API key (from env, never persisted).
    pub api_key: Option<String>,

    /// Model identifier sent with every request.
    pub model: String,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Inbound API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: std::net::SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], 8900).into(),
        }
    }
}

/// Session runtime tuning (the closed option set).
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub limits: LimitsConfig,
    pub timing: TimingConfig,
    pub retry: RetryConfig,
    pub orchestrator: OrchestratorConfig,
    pub history_strategy: HistoryStrategy,
    /// System prompt prepended to every chat-loop conversation.
    pub system_prompt: Option<String>,
    /// Remote MCP tool servers, connected lazily per session.
    pub mcp_servers: Vec<McpServerConfig>,
    /// Hard timeout for each MCP connect attempt.
    pub mcp_connect_timeout: McpConnectTimeout,
}

/// History and tool exposure caps.
#[derive(Debug, Clone, Copy)]
pub struct LimitsConfig {
    /// Cap on session history length.
    pub max_history: usize,

    /// Cap on LLM tool-call loops per batch.
    pub max_tool_iterations: usize,

    /// Cap on tools exposed to the LLM (None = unlimited).
    pub max_tools: Option<usize>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            max_tool_iterations: 5,
            max_tools: None,
        }
    }
}

/// Heartbeat and stuck-detection windows.
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    /// Thinking-message and heartbeat cadence.
    pub rotation_interval: Duration,

    /// Stuck detection window.
    pub heartbeat_timeout: Duration,

    /// Absolute batch wall-clock limit.
    pub hard_ceiling: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            hard_ceiling: Duration::from_secs(300),
        }
    }
}

/// Batch retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: f64,
    pub cap_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff: 2.0,
            cap_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff delay before the given retry attempt, capped.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.backoff.powi(retry_count.min(16) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).round();
        let delay = Duration::from_millis(millis.min(u64::MAX as f64) as u64);
        delay.min(self.cap_delay)
    }
}

/// Orchestrator execution-plan controls.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub max_steps: usize,
    pub max_parallel: usize,
    pub step_timeout: Duration,
    pub continue_on_error: bool,
    /// LLM-assisted aggregation of step results instead of concatenation.
    pub use_llm_aggregation: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_parallel: 3,
            step_timeout: Duration::from_secs(60),
            continue_on_error: false,
            use_llm_aggregation: false,
        }
    }
}

/// How session history is fed to the LLM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStrategy {
    /// Native multi-turn messages.
    #[default]
    MultiTurn,
    /// History embedded inline in the user message, XML-tagged, for gateways
    /// that handle multi-turn poorly.
    InlineTagged,
}

/// MCP connect timeout newtype so the default lives in one place.
#[derive(Debug, Clone, Copy)]
pub struct McpConnectTimeout(pub Duration);

impl Default for McpConnectTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(10))
    }
}

/// One remote MCP tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransport,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// MCP server transport flavours.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        url: String,
    },
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let data_dir = match std::env::var("RELAYBOT_DATA_DIR") {
            Ok(dir) => std::path::PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .map(|d| d.join("relaybot"))
                .unwrap_or_else(|| std::path::PathBuf::from("./data")),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let llm = LlmConfig {
            base_url: std::env::var("RELAYBOT_LLM_BASE_URL")
                .unwrap_or_else(|_| LlmConfig::default().base_url),
            api_key: std::env::var("RELAYBOT_LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            model: std::env::var("RELAYBOT_LLM_MODEL")
                .unwrap_or_else(|_| LlmConfig::default().model),
            request_timeout: env_secs("RELAYBOT_LLM_TIMEOUT_SECS")?
                .unwrap_or(LlmConfig::default().request_timeout),
        };

        let api = ApiConfig {
            bind: match std::env::var("RELAYBOT_BIND") {
                Ok(addr) => addr
                    .parse()
                    .map_err(|_| ConfigError::Invalid(format!("invalid bind address: {addr}")))?,
                Err(_) => ApiConfig::default().bind,
            },
        };

        let runtime = RuntimeConfig::from_env()?;
        runtime.validate()?;

        Ok(Self {
            data_dir,
            llm,
            api,
            runtime,
        })
    }

    /// Get the SQLite database path.
    pub fn sqlite_path(&self) -> std::path::PathBuf {
        self.data_dir.join("relaybot.db")
    }
}

impl RuntimeConfig {
    /// Build runtime tuning from env overrides on top of defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = env_parse::<usize>("RELAYBOT_MAX_HISTORY")? {
            config.limits.max_history = value;
        }
        if let Some(value) = env_parse::<usize>("RELAYBOT_MAX_TOOL_ITERATIONS")? {
            config.limits.max_tool_iterations = value;
        }
        if let Some(value) = env_parse::<usize>("RELAYBOT_MAX_TOOLS")? {
            config.limits.max_tools = Some(value);
        }
        if let Some(value) = env_secs("RELAYBOT_ROTATION_INTERVAL_SECS")? {
            config.timing.rotation_interval = value;
        }
        if let Some(value) = env_secs("RELAYBOT_HEARTBEAT_TIMEOUT_SECS")? {
            config.timing.heartbeat_timeout = value;
        }
        if let Some(value) = env_secs("RELAYBOT_HARD_CEILING_SECS")? {
            config.timing.hard_ceiling = value;
        }
        if let Some(value) = env_parse::<u32>("RELAYBOT_MAX_RETRIES")? {
            config.retry.max_retries = value;
        }
        if let Some(value) = env_parse::<u64>("RELAYBOT_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(value);
        }
        if let Some(value) = env_parse::<f64>("RELAYBOT_BACKOFF")? {
            config.retry.backoff = value;
        }
        if let Some(value) = env_secs("RELAYBOT_CAP_DELAY_SECS")? {
            config.retry.cap_delay = value;
        }
        if let Some(value) = env_parse::<usize>("RELAYBOT_MAX_STEPS")? {
            config.orchestrator.max_steps = value;
        }
        if let Some(value) = env_parse::<usize>("RELAYBOT_MAX_PARALLEL")? {
            config.orchestrator.max_parallel = value;
        }
        if let Some(value) = env_parse::<u64>("RELAYBOT_STEP_TIMEOUT_MS")? {
            config.orchestrator.step_timeout = Duration::from_millis(value);
        }
        if let Some(value) = env_parse::<bool>("RELAYBOT_CONTINUE_ON_ERROR")? {
            config.orchestrator.continue_on_error = value;
        }
        if let Some(value) = env_parse::<bool>("RELAYBOT_LLM_AGGREGATION")? {
            config.orchestrator.use_llm_aggregation = value;
        }
        if let Ok(value) = std::env::var("RELAYBOT_SYSTEM_PROMPT") {
            config.system_prompt = Some(value);
        }
        if let Ok(value) = std::env::var("RELAYBOT_HISTORY_STRATEGY") {
            config.history_strategy = match value.as_str() {
                "multi_turn" => HistoryStrategy::MultiTurn,
                "inline_tagged" => HistoryStrategy::InlineTagged,
                other => {
                    return Err(
                        ConfigError::Invalid(format!("unknown history strategy: {other}")).into(),
                    );
                }
            };
        }
        if let Ok(raw) = std::env::var("RELAYBOT_MCP_SERVERS") {
            config.mcp_servers = serde_json::from_str(&raw)
                .map_err(|error| ConfigError::Invalid(format!("RELAYBOT_MCP_SERVERS: {error}")))?;
        }
        if let Some(value) = env_secs("RELAYBOT_MCP_CONNECT_TIMEOUT_SECS")? {
            config.mcp_connect_timeout = McpConnectTimeout(value);
        }

        Ok(config)
    }

    /// Reject tunings that break the state machine.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_history == 0 {
            return Err(ConfigError::Invalid("max_history must be at least 1".into()).into());
        }
        if self.retry.backoff < 1.0 {
            return Err(ConfigError::Invalid("backoff factor must be >= 1.0".into()).into());
        }
        if self.orchestrator.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be at least 1".into()).into());
        }
        if self.timing.rotation_interval >= self.timing.heartbeat_timeout {
            return Err(ConfigError::Invalid(
                "rotation_interval must be shorter than heartbeat_timeout".into(),
            )
            .into());
        }
        if self.timing.heartbeat_timeout >= self.timing.hard_ceiling {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout must be shorter than hard_ceiling".into(),
            )
            .into());
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse '{raw}'")).into()),
        Err(_) => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}
