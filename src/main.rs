mod agent;
mod auth;
mod channel;
mod classifier;
mod commands;
mod config;
mod engine;
mod gate;
mod llm;
mod logging;
mod paths;
mod rules;
mod server;
mod session;
mod signature;

use crate::config::Config;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "carapace", version)]
#[command(about = "Carapace — security-first AI-agent gateway", long_about = None)]
struct Cli {
    /// Data root. Overrides $CARAPACE_DATA_DIR (default ~/.carapace).
    #[arg(long, global = true)]
    data_dir: Option<std::path::PathBuf>,

    /// Port for the server
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show gateway status
    Status,
    /// Print the server bearer token and its path
    Token,
    /// List sessions straight from disk
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(dir) = cli.data_dir.clone() {
        paths::set_data_root(dir);
    }

    let config = match Config::load(&paths::config_file()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    // Lightweight subcommands — no tracing or server stack needed.
    match &cli.cmd {
        Some(Command::Token) => {
            let path = paths::token_file();
            let token = auth::load_or_generate_token(&path)?;
            println!("{}", path.display());
            println!("{}", token);
            return Ok(());
        }
        Some(Command::Sessions) => {
            let store = session::SessionStore::new(paths::sessions_dir());
            for info in store.list()? {
                println!(
                    "{}  {}  last_active={}{}",
                    info.session_id,
                    info.channel_type,
                    info.last_active.to_rfc3339(),
                    if info.retired { "  (retired)" } else { "" }
                );
            }
            return Ok(());
        }
        Some(Command::Status) => {
            let port = cli.port.unwrap_or(config.server.port);
            // Client side: $CARAPACE_TOKEN wins over the local token file.
            let token = match std::env::var("CARAPACE_TOKEN") {
                Ok(t) if !t.is_empty() => t,
                _ => auth::load_or_generate_token(&paths::token_file())?,
            };
            let url = format!("http://{}:{}/sessions", config.server.host, port);
            let client = reqwest::Client::new();
            match client
                .get(&url)
                .header("Authorization", format!("Bearer {}", token))
                .timeout(Duration::from_secs(3))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    let sessions: Vec<serde_json::Value> = resp.json().await.unwrap_or_default();
                    println!("carapace is running at {} ({} active session(s))", url, sessions.len());
                }
                Ok(resp) => println!("carapace answered with status {}", resp.status()),
                Err(_) => println!("carapace is not running at {}", url),
            }
            return Ok(());
        }
        None => {}
    }

    // Serve path.
    let log_dir = match logging::init(&config.logging) {
        Ok(path) => Some(path),
        Err(err) => {
            eprintln!("Failed to initialize logging: {err:#}");
            None
        }
    };

    let rules = match rules::RuleStore::load(paths::rules_file()) {
        Ok(rules) => Arc::new(rules),
        Err(e) => {
            eprintln!("Configuration error in rule file: {e:#}");
            std::process::exit(1);
        }
    };

    let token = auth::load_or_generate_token(&paths::token_file())?;

    let store = Arc::new(session::SessionStore::new(paths::sessions_dir()));
    let manager = Arc::new(session::SessionManager::new(store));
    match manager.sweep_idle(config.retention.days) {
        Ok(0) => {}
        Ok(n) => tracing::info!("Retention sweep removed {} idle session(s)", n),
        Err(e) => tracing::warn!("Retention sweep failed: {e:#}"),
    }

    let model: Arc<dyn llm::ChatModel> = Arc::new(llm::LlmClient::new(
        config.llm.url.clone(),
        config.llm_api_key(),
    ));
    let registry = Arc::new(channel::ConnectionRegistry::new());
    let gate = Arc::new(gate::SecurityGate::new(
        classifier::Classifier::new(model.clone(), config.llm.classifier_model.clone()),
        engine::RuleEngine::new(model.clone(), config.llm.classifier_model.clone()),
        rules.clone(),
        registry.clone(),
        Duration::from_secs(config.approval.timeout_secs),
    ));
    let runner = Arc::new(agent::AgentRunner::new(
        model,
        config.llm.model.clone(),
        Arc::new(agent::EchoRuntime),
        gate,
        manager.clone(),
        config.agent.max_iters,
    ));

    tracing::info!("--- Carapace Startup ---");
    tracing::info!("Data Root: {}", paths::data_root().display());
    if let Some(dir) = log_dir.as_ref() {
        tracing::info!("Log Directory: {}", dir.display());
    }
    tracing::info!("LLM Endpoint: {}", config.llm.url);
    tracing::info!(
        "Models: agent={}, auxiliary={}",
        config.llm.model,
        config.llm.classifier_model
    );
    tracing::info!("Rules Loaded: {}", rules.snapshot().len());
    tracing::info!(
        "Approval Timeout: {}s, Max Tool Iterations: {}",
        config.approval.timeout_secs,
        config.agent.max_iters
    );
    tracing::info!("------------------------");

    let state = Arc::new(server::AppState {
        manager,
        rules,
        registry,
        runner,
        token,
    });

    // SIGHUP reloads the rule file; a malformed file keeps the running set.
    #[cfg(unix)]
    {
        let rules = state.rules.clone();
        tokio::spawn(async move {
            let Ok(mut hup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hup.recv().await.is_some() {
                let _ = rules.reload();
            }
        });
    }

    let port = cli.port.unwrap_or(config.server.port);
    let listener = match server::bind(&config.server.host, port).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {}:{}: {e}", config.server.host, port);
            std::process::exit(2);
        }
    };

    server::serve(listener, state).await
}
