//! userstore server binary.
//!
//! Reads `config.toml` (or the path specified with `--config`) plus
//! `USERSTORE_*` environment variables, opens one SQLite store per region,
//! and serves the JSON API over HTTP until ctrl-c.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use tokio::{net::TcpListener, sync::watch};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use userstore_server::{ServerConfig, open_store, router};

#[derive(Parser)]
#[command(author, version, about = "Multi-region userstore server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("USERSTORE"))
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let store = Arc::new(open_store(&server_cfg, shutdown_rx).await?);

  let app = router(store, &server_cfg);
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(async move {
      if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for ctrl-c");
        return;
      }
      tracing::info!("shutting down");
      let _ = shutdown_tx.send(true);
    })
    .await
    .context("server error")?;

  Ok(())
}
