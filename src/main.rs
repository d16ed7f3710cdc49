use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use deployd::config::Config;
use deployd::engine::Engine;
use deployd::http::{self, AppState};
use deployd::store::users::UserStore;

#[derive(Parser)]
#[command(name = "deployd", version, about = "Self-hosted deployment orchestrator")]
struct Cli {
    /// Address to bind the API server on
    #[arg(long, default_value = "127.0.0.1:8044")]
    bind: String,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let cfg = Config::from_env()?;
    cfg.ensure_dirs()?;

    if which::which("git").is_err() {
        warn!("git not found on PATH; deployments will fail at the sync step");
    }
    if cfg.secrets_master_key.is_none() {
        warn!("SECRETS_MASTER_KEY not set; projects with secret env entries cannot deploy");
    }

    let users = UserStore::new(&cfg.projects_dir);
    if let Some(seeded) = users.ensure_seed(cfg.admin_token.as_deref())? {
        info!(token = %seeded.token, "seeded admin user; keep this token somewhere safe");
    }

    let engine = Engine::new(cfg);
    let state = AppState {
        engine,
        users: Arc::new(users),
    };

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!(addr = %cli.bind, "deployd listening");
    axum::serve(listener, http::router(state)).await?;

    Ok(())
}
