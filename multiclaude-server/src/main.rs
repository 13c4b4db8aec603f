//! multiclaude - Headless multi-account LLM proxy
//!
//! A pure Rust HTTP daemon that:
//! - Exposes an Anthropic-compatible Messages API
//! - Rotates requests across pooled Antigravity, Z.AI, and Copilot accounts
//! - Translates between the Anthropic wire format and each backend

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "multiclaude", version, about = "Multi-account Anthropic-compatible proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy server.
    Serve {
        /// Listen port (overrides PORT).
        #[arg(long)]
        port: Option<u16>,
        /// Bind address (overrides BIND_ADDRESS).
        #[arg(long)]
        bind: Option<String>,
        /// Verbose logging (overrides DEBUG).
        #[arg(long)]
        debug: bool,
    },
    /// Manage pooled accounts.
    Accounts {
        #[command(subcommand)]
        command: commands::AccountsCommand,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve { port, bind, debug } => serve(port, bind, debug).await,
        Command::Accounts { command } => commands::run(command).await,
    }
}

async fn serve(port: Option<u16>, bind: Option<String>, debug: bool) -> Result<()> {
    let mut config = multiclaude_core::ProxyConfig::from_env()?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind_address = bind;
    }
    if debug {
        config.debug = true;
    }

    let filter = if config.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("multiclaude starting");

    let http = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .read_timeout(std::time::Duration::from_secs(config.read_timeout_sec))
        .build()?;

    let pool: multiclaude_core::pool::SharedPool = Arc::new(
        multiclaude_core::AccountPool::load(config.accounts_path.clone(), http.clone()),
    );
    pool.apply_threshold_override(config.soft_limit_threshold);

    let total = pool.list_accounts().len();
    tracing::info!("Loaded {} account(s) from {}", total, config.accounts_path.display());

    let registry = Arc::new(multiclaude_core::providers::ProviderRegistry::new(vec![
        multiclaude_core::providers::antigravity::new_dispatch(
            pool.clone(),
            http.clone(),
            config.enable_fallback,
        ),
        Arc::new(multiclaude_core::providers::zai::ZaiDispatch::new(
            pool.clone(),
            http.clone(),
            config.enable_fallback,
        )),
        Arc::new(multiclaude_core::providers::copilot::CopilotDispatch::new(
            pool.clone(),
            http.clone(),
        )),
    ]));

    let state = multiclaude_core::server::AppState {
        pool,
        registry,
        config: Arc::new(config),
    };

    multiclaude_core::server::run(state).await.map_err(|e| anyhow::anyhow!(e))
}
