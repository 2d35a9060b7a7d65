//! `minder` — the orchestrator daemon, the sandbox-side bridge, and a
//! read-only status probe, in one binary so a single artifact ships to both
//! sides of the deployment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use minder_config::{AppConfig, Secrets};
use minder_engine::EngineClient;
use minder_mcp::bridge::{self, BridgeState};
use minder_mcp::service::McpService;
use minder_memory::{Embedder, Store};
use minder_runtime::coding::RunCodingTaskTool;
use minder_runtime::coordinator::{Coordinator, Engine};
use minder_runtime::github::GithubApp;
use minder_runtime::{Trigger, ambient};
use minder_sandbox::ProcessSandbox;
use minder_scheduler::Scheduler;
use minder_telegram::{TelegramSink, WebhookState};
use minder_tools::{
    CancelReminderTool, FetchPageTool, GetRecentSummariesTool, JournalSearchTool,
    JournalWriteTool, ListRemindersTool, NewsSearchTool, SaveConversationSummaryTool,
    ScheduleOnceTool, ScheduleRecurringTool, SendTelegramTool, StateReadTool, StateWriteTool,
    ToolRegistry, TopicGetTool, TopicListTool, TopicSearchTool, TopicWriteTool, UrlAllowList,
    WebSearchTool,
};

#[derive(Parser)]
#[command(name = "minder", version, about = "Stateful single-tenant AI agent orchestrator")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "minder.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator daemon.
    Run,
    /// Run the sandbox-side MCP bridge.
    Bridge {
        /// Loopback bind for the engine-facing MCP HTTP endpoint.
        #[arg(long, default_value = "127.0.0.1:9191")]
        http_bind: String,
        /// Bind for the WS-UPLINK listener the orchestrator dials.
        #[arg(long, default_value = "0.0.0.0:9292")]
        uplink_bind: String,
    },
    /// Print a snapshot of the store and scheduler state.
    Status,
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_env("MINDER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));

    if config.telemetry.log_dir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    } else {
        let appender = tracing_appender::rolling::daily(&config.telemetry.log_dir, "minder.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config))?;
    let _log_guard = init_tracing(&config);

    match cli.command {
        Command::Run => run_daemon(config).await,
        Command::Bridge { http_bind, uplink_bind } => run_bridge(&http_bind, &uplink_bind).await,
        Command::Status => print_status(&config),
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let secrets = Secrets::from_env();
    let store = Arc::new(Store::open(&config.memory.db_path)?);
    let embedder = Arc::new(Embedder::new(
        &config.embedding.base_url,
        &config.embedding.model,
        Duration::from_secs(config.embedding.timeout_secs),
    )?);

    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel::<Trigger>(64);

    // Reminders fire into the trigger queue as alarm triggers.
    let (fired_tx, mut fired_rx) = tokio::sync::mpsc::channel(16);
    let scheduler = Scheduler::new(store.clone(), fired_tx);
    {
        let trigger_tx = trigger_tx.clone();
        tokio::spawn(async move {
            while let Some(reminder) = fired_rx.recv().await {
                let trigger = Trigger::Alarm {
                    description: reminder.description,
                    payload: reminder.payload,
                };
                if trigger_tx.send(trigger).await.is_err() {
                    break;
                }
            }
        });
    }

    let sink = Arc::new(TelegramSink::new(
        secrets.telegram_bot_token.clone(),
        secrets.owner_chat_id,
    ));
    let allow_list = UrlAllowList::default();

    let engine_client = Arc::new(EngineClient::new(
        &config.engine.base_url,
        Duration::from_secs(config.engine.prompt_timeout_secs),
    )?);
    let engine: Arc<dyn Engine> = engine_client;

    let sandbox = Arc::new(ProcessSandbox::new(
        config.sandbox.workdir.clone(),
        config.sandbox.host.clone(),
        config.sandbox.uplink_port,
    ));

    let github = match (
        &secrets.github_client_id,
        &secrets.github_private_key_pem,
        &secrets.github_installation_id,
    ) {
        (Some(client_id), Some(pem), Some(installation_id)) => Some(GithubApp {
            client_id: client_id.clone(),
            private_key_pem: load_pem(pem)?,
            installation_id: installation_id.clone(),
        }),
        _ => {
            info!("GitHub App credentials not configured — coding tasks use unauthenticated clones");
            None
        }
    };

    let registry = build_registry(
        &config,
        &secrets,
        store.clone(),
        embedder,
        scheduler.clone(),
        sink.clone(),
        allow_list.clone(),
        engine.clone(),
        sandbox.clone(),
        github,
    );
    let service = Arc::new(McpService::new(Arc::new(registry)));

    let mut coordinator = Coordinator::new(
        store.clone(),
        engine,
        sandbox,
        service,
        sink.clone(),
        allow_list,
        config.clone(),
    );
    if let Some(key) = &secrets.engine_api_key {
        coordinator
            .sandbox_env
            .insert("ANTHROPIC_API_KEY".to_string(), key.clone());
    }
    tokio::spawn(coordinator.run(trigger_rx));

    // Reminders saved by a previous process get their alarm back; missed
    // one-shots are cleaned on the first scan.
    scheduler.reschedule().await?;

    ambient::spawn_ambient(config.ambient.interval_minutes, trigger_tx.clone());

    let webhook_state = Arc::new(WebhookState {
        secret: secrets.webhook_secret.clone(),
        allowed_user_ids: config.telegram.allowed_user_ids.clone(),
        triggers: trigger_tx,
        store,
        sink,
    });
    let listener = tokio::net::TcpListener::bind(&config.telegram.webhook_bind)
        .await
        .with_context(|| format!("binding webhook on {}", config.telegram.webhook_bind))?;
    info!(bind = %config.telegram.webhook_bind, "webhook listening");

    tokio::select! {
        served = axum::serve(listener, minder_telegram::router(webhook_state)) => {
            served.context("webhook server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_registry(
    config: &AppConfig,
    secrets: &Secrets,
    store: Arc<Store>,
    embedder: Arc<Embedder>,
    scheduler: Scheduler,
    sink: Arc<TelegramSink>,
    allow_list: UrlAllowList,
    engine: Arc<dyn Engine>,
    sandbox: Arc<ProcessSandbox>,
    github: Option<GithubApp>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::default();

    registry.register(Box::new(JournalWriteTool {
        store: store.clone(),
        embedder: embedder.clone(),
    }));
    registry.register(Box::new(JournalSearchTool {
        store: store.clone(),
        embedder: embedder.clone(),
    }));
    registry.register(Box::new(TopicWriteTool {
        store: store.clone(),
        embedder: embedder.clone(),
    }));
    registry.register(Box::new(TopicGetTool { store: store.clone() }));
    registry.register(Box::new(TopicListTool { store: store.clone() }));
    registry.register(Box::new(TopicSearchTool {
        store: store.clone(),
        embedder,
    }));
    registry.register(Box::new(StateReadTool { store: store.clone() }));
    registry.register(Box::new(StateWriteTool { store: store.clone() }));

    registry.register(Box::new(ScheduleRecurringTool {
        store: store.clone(),
        scheduler: scheduler.clone(),
    }));
    registry.register(Box::new(ScheduleOnceTool {
        store: store.clone(),
        scheduler: scheduler.clone(),
    }));
    registry.register(Box::new(CancelReminderTool {
        store: store.clone(),
        scheduler,
    }));
    registry.register(Box::new(ListRemindersTool { store: store.clone() }));

    registry.register(Box::new(SendTelegramTool { sink }));

    registry.register(Box::new(SaveConversationSummaryTool { store: store.clone() }));
    registry.register(Box::new(GetRecentSummariesTool { store: store.clone() }));

    registry.register(Box::new(WebSearchTool {
        api_key: secrets.brave_api_key.clone(),
        allow_list: allow_list.clone(),
    }));
    registry.register(Box::new(NewsSearchTool {
        api_key: secrets.brave_api_key.clone(),
        allow_list: allow_list.clone(),
    }));
    registry.register(Box::new(FetchPageTool { allow_list }));

    registry.register(Box::new(RunCodingTaskTool {
        store,
        engine,
        sandbox,
        coding: config.coding.clone(),
        fast_model: config.engine.fast_model.clone(),
        model: config.engine.model.clone(),
        workdir: config.sandbox.workdir.clone(),
        github,
    }));

    registry
}

async fn run_bridge(http_bind: &str, uplink_bind: &str) -> Result<()> {
    let state = BridgeState::new(bridge::DEFAULT_REQUEST_TIMEOUT);
    let http = tokio::net::TcpListener::bind(http_bind)
        .await
        .with_context(|| format!("binding MCP HTTP on {http_bind}"))?;
    let uplink = tokio::net::TcpListener::bind(uplink_bind)
        .await
        .with_context(|| format!("binding WS-UPLINK on {uplink_bind}"))?;
    info!(%http_bind, %uplink_bind, "bridge listening");
    bridge::serve(http, uplink, state).await
}

fn print_status(config: &AppConfig) -> Result<()> {
    let store = Store::open(&config.memory.db_path)?;
    let stats = store.conversation_stats(config.memory.compact_threshold)?;
    let reminders = store.list_reminders()?;
    let topics = store.list_topics()?;

    println!("store: {}", config.memory.db_path);
    println!(
        "conversation: {} messages, ~{} tokens (compaction {})",
        stats.count,
        stats.approx_tokens,
        if stats.needs_compaction { "needed" } else { "not needed" },
    );
    println!("topics: {}", topics.len());
    println!("reminders: {}", reminders.len());
    for reminder in &reminders {
        println!("  - [{}] {}", reminder.id, reminder.description);
    }
    match store.last_summary()? {
        Some(summary) => println!(
            "last summary: {} messages absorbed at {}",
            summary.message_count, summary.timestamp
        ),
        None => println!("last summary: (none)"),
    }
    match store.embedding_dim()? {
        Some(dim) => println!("embedding dimension: {dim}"),
        None => println!("embedding dimension: (no embeddings yet)"),
    }
    Ok(())
}

/// Accept a PEM either inline or as a path to a key file.
fn load_pem(value: &str) -> Result<String> {
    if value.starts_with("-----BEGIN") {
        return Ok(value.to_string());
    }
    std::fs::read_to_string(value).with_context(|| format!("reading private key from {value}"))
}
