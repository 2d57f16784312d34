mod api;
mod client;
mod config;
mod models;
mod relay;
mod services;
mod terminal;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use api::AppState;
use config::{Cli, Command, ServeArgs};
use relay::WorkerClient;
use services::Database;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Command::Serve(_) => "info,casechat=debug",
        Command::Chat(_) => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Chat(args) => terminal::run(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let db_path = args.database_path()?;
    let db = Database::open(&db_path)?;
    let worker_base = args.worker_base()?;
    tracing::info!(worker = %worker_base, "Chat relay configured");

    let state = AppState {
        db,
        worker: Arc::new(WorkerClient::new(&worker_base)),
    };
    let cors = api::cors_layer(args.allow_origin.as_deref())?;
    let app = api::app(state, cors);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    tracing::info!("Listening on {}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
