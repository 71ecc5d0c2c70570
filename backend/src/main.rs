use anyhow::{Context, Result};
use santa_backend::config::Config;
use santa_backend::{app, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let state = AppState::from_config(&config).context("failed to open store")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(
        addr = %config.bind_addr,
        admins = config.admins.len(),
        persistent = config.store_path.is_some(),
        "Starting server"
    );

    axum::serve(listener, app(state))
        .await
        .context("server error")
}
