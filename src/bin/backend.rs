#![forbid(unsafe_code)]

//! HTTP front end: `GET /` form, `POST /download`, `GET /downloads/{filename}`.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use mediagrab::{
    config::{DEFAULT_CONFIG_PATH, EnvConfig, load_runtime_config},
    engine::YtDlp,
    retrieval::JobRunner,
    security::ensure_not_root,
    server::{AppState, build_router},
    store::ArtifactStore,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the mediagrab download form and API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(
        long = "storage-root",
        value_name = "PATH",
        help = "Directory finished downloads are stored in (default ./downloads)"
    )]
    storage_root: Option<PathBuf>,
    #[arg(long = "host", value_name = "ADDR", help = "Address to listen on")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Port to listen on")]
    port: Option<u16>,
    #[arg(long = "ytdlp", value_name = "PATH", help = "yt-dlp executable to invoke")]
    ytdlp: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> EnvConfig {
        EnvConfig {
            storage_root: self.storage_root.clone(),
            host: self.host.clone(),
            port: self.port,
            ytdlp_bin: self.ytdlp.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediagrab=info,backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    ensure_not_root("mediagrab backend")?;

    let config = load_runtime_config(&cli.config, cli.overrides())?;

    let store = ArtifactStore::new(&config.storage_root);
    store
        .prepare()
        .with_context(|| format!("creating {}", config.storage_root.display()))?;

    let engine = YtDlp::new(&config.ytdlp_bin);
    match engine.version() {
        Ok(version) => info!(program = %engine.program().display(), %version, "extraction engine found"),
        Err(err) => warn!(error = %err, "extraction engine check failed; downloads will fail until it is installed"),
    }

    let runner = JobRunner::new(&config.storage_root, Arc::new(engine));
    let app = build_router(AppState::new(runner, store));

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(storage_root = %config.storage_root.display(), "listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
}
