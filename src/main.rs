//! Relaybot CLI entry point.

use anyhow::Context as _;
use arc_swap::ArcSwap;
use clap::{Parser, Subcommand};
use relaybot::api::{self, ApiState};
use relaybot::chat::ChatLoop;
use relaybot::clock::{SharedClock, SystemClock};
use relaybot::config::Config;
use relaybot::llm::{HttpProvider, SharedProvider};
use relaybot::observability::SqliteEventSink;
use relaybot::router::{Orchestrator, Router, WorkerRegistry, WorkerTarget, worker::ChatWorker};
use relaybot::runtime::SessionRuntime;
use relaybot::session::actor::SessionDeps;
use relaybot::session::store::SqliteSessionStore;
use relaybot::tools::{CalculatorTool, CurrentTimeTool, ToolRegistry};
use relaybot::transport::{RestTransport, SharedTransport};
use relaybot::Platform;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaybot", version)]
#[command(about = "A per-session conversational agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the runtime and API server (default)
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "relaybot=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Check => check().await,
        Command::Run => run().await,
    }
}

async fn check() -> anyhow::Result<()> {
    let config = Config::load().context("configuration is invalid")?;
    println!("configuration ok");
    println!("  data dir: {}", config.data_dir.display());
    println!("  llm: {} ({})", config.llm.base_url, config.llm.model);
    println!("  bind: {}", config.api.bind);
    println!(
        "  mcp servers: {}",
        config.runtime.mcp_servers.len()
    );
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(config.sqlite_path())
                .create_if_missing(true),
        )
        .await
        .with_context(|| format!("failed to open {}", config.sqlite_path().display()))?;

    let store = Arc::new(SqliteSessionStore::new(pool.clone()));
    store.initialize().await?;
    SqliteEventSink::initialize(&pool).await?;
    let sink = Arc::new(SqliteEventSink::new(pool.clone()));

    let clock: SharedClock = Arc::new(SystemClock);
    let provider: SharedProvider = Arc::new(HttpProvider::new(&config.llm)?);

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(CurrentTimeTool::new(clock.clone())));
    tools.register(Arc::new(CalculatorTool));
    let tools = Arc::new(tools);

    let rest: SharedTransport = Arc::new(RestTransport::new()?);
    let mut transports: HashMap<Platform, SharedTransport> = HashMap::new();
    transports.insert(Platform::Rest, rest);
    let transports = Arc::new(transports);

    let runtime_config = Arc::new(ArcSwap::from_pointee(config.runtime.clone()));
    let (signal_tx, signal_rx) = tokio::sync::mpsc::channel(64);

    // Worker chat loops share the provider and the built-in tools; remote
    // MCP tools stay session-scoped.
    let worker_chat = Arc::new(ChatLoop::new(provider.clone(), tools.clone(), None));
    let chat_worker = |label: &str| {
        Arc::new(ChatWorker::new(
            label,
            worker_chat.clone(),
            runtime_config.clone(),
            transports.clone(),
            clock.clone(),
            signal_tx.clone(),
        ))
    };

    let mut step_workers = WorkerRegistry::new();
    step_workers.register(WorkerTarget::General, chat_worker("general"));
    step_workers.register(WorkerTarget::Code, chat_worker("code"));
    step_workers.register(WorkerTarget::Research, chat_worker("research"));

    let orchestrator = Orchestrator::new(
        provider.clone(),
        step_workers.clone(),
        runtime_config.clone(),
        transports.clone(),
        signal_tx.clone(),
    );

    let mut workers = step_workers;
    workers.register(WorkerTarget::Simple, chat_worker("simple"));
    workers.register(WorkerTarget::Orchestrator, Arc::new(orchestrator));
    let router = Arc::new(Router::new(workers, provider.clone()));

    let deps = SessionDeps {
        clock,
        store,
        transports,
        provider,
        tools,
        router: Some(router),
        sink,
        config: runtime_config,
    };

    let runtime = SessionRuntime::new(deps);
    runtime.spawn_signal_pump(signal_rx);

    api::serve(config.api.bind, ApiState { runtime }).await
}
