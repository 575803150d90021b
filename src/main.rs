mod application;
mod config;
mod domain;
mod infrastructure;

pub use application::{decider, engine, registry, tooling};
pub use domain::types;
pub use infrastructure::{model, server};

use clap::{Parser, ValueEnum};
use config::AppConfig;
use engine::DispatchEngine;
use model::{ModelDecider, OllamaClient};
use registry::ToolRegistry;
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "mcp-dispatch",
    version,
    about = "Tool dispatcher over MCP stdio servers, powered by Ollama"
)]
struct Cli {
    #[arg(long)]
    ollama_url: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    config: Option<String>,
    #[arg(long, value_enum, default_value_t = RunMode::Cli)]
    mode: RunMode,
    #[arg(long, default_value = "127.0.0.1:8080")]
    rest_addr: SocketAddr,
    #[arg()]
    prompt: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunMode {
    Cli,
    Rest,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    dotenvy::dotenv().ok();
    info!("Starting mcp-dispatch");

    let cli = Cli::parse();
    debug!(?cli.mode, config = ?cli.config, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let mut app_config = AppConfig::load(config_path)?;
    if let Some(url) = cli.ollama_url.clone() {
        app_config.ollama_url = url;
    }
    if let Some(model) = cli.model.clone() {
        app_config.model = model;
    }
    info!(
        model = %app_config.model,
        servers = app_config.servers.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(ToolRegistry::from_config(
        app_config.servers.clone(),
        app_config.timeouts,
    ));
    let (tools, failures) = registry.rebuild().await;
    if tools == 0 {
        warn!(
            failures = failures.len(),
            "No tools discovered; dispatch requests will be rejected until a refresh succeeds"
        );
    }

    let provider = OllamaClient::new(app_config.ollama_url.clone());
    let decider = ModelDecider::new(provider, app_config.model.clone());
    let engine = Arc::new(DispatchEngine::new(
        registry.clone(),
        decider,
        app_config.timeouts.decider,
    ));

    match cli.mode {
        RunMode::Cli => {
            let prompt = cli.prompt.join(" ");
            if prompt.trim().is_empty() {
                return Err("no prompt given; pass the request as positional arguments".into());
            }
            info!("Dispatching single prompt via CLI mode");
            let result = engine.dispatch(&prompt).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_error() {
                std::process::exit(1);
            }
        }
        RunMode::Rest => {
            info!(addr = %cli.rest_addr, "Starting REST server");
            server::serve(engine, registry, cli.rest_addr).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
