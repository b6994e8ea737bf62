use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use newtube_hosting::{
    api::{AppState, router},
    config::{DEFAULT_CONFIG_PATH, Settings, load_env_config},
};
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the video hosting API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
    config: String,
    #[arg(long = "host", value_name = "ADDR", help = "Address to bind (overrides HOST)")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Port to bind (overrides PORT)")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("newtube_hosting=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = load_env_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    if let Some(host) = cli.host {
        cfg.host = Some(host);
    }
    if let Some(port) = cli.port {
        cfg.port = Some(port);
    }
    let settings = Settings::resolve(cfg)?;

    let state = AppState::from_settings(&settings).await?;
    tracing::info!(
        backend = %settings.storage_backend,
        db = %settings.db_path.display(),
        max_upload_bytes = settings.max_upload_bytes,
        "storage ready"
    );
    let app = router(state);

    let addr = SocketAddr::new(
        settings
            .host
            .parse()
            .with_context(|| format!("invalid HOST {:?}", settings.host))?,
        settings.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(%addr, public_base_url = %settings.public_base_url, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}
