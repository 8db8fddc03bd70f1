//! pxbox entry point.
//!
//! Thin by design: parse the CLI, set up tracing, assemble the broker, wire
//! middleware, serve. Route handlers live in `routes.rs`, session handling in
//! `session.rs`, shared state in `state.rs`.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::Method;
use clap::{Parser, Subcommand};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use pxb_config::BrokerConfig;
use pxb_daemon::{routes, state::AppState};
use pxb_runtime::Broker;

#[derive(Parser)]
#[command(name = "pxbox")]
#[command(about = "PxBox data-entry broker", long_about = None)]
struct Cli {
    /// YAML config files, merged in order (later overrides earlier).
    #[arg(long = "config", global = true)]
    config: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker.
    Serve,
    /// Apply schema migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // dev convenience; silent if the file does not exist
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    let paths: Vec<&str> = cli.config.iter().map(String::as_str).collect();
    let loaded = BrokerConfig::load(&paths).context("load configuration")?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    match cli.cmd {
        Commands::Migrate => migrate(&loaded.config).await,
        Commands::Serve => serve(loaded.config).await,
    }
}

async fn migrate(config: &BrokerConfig) -> Result<()> {
    let url = config
        .storage_url
        .as_deref()
        .context("migrate requires a storage URL (PXB_DATABASE_URL)")?;
    let pool = pxb_db::connect(url).await?;
    pxb_db::migrate(&pool).await?;
    println!("migrations_applied=true");
    Ok(())
}

async fn serve(config: BrokerConfig) -> Result<()> {
    let bind = config.bind_addr.clone();

    let broker = if config.storage_url.is_some() {
        Broker::connect(config).await?
    } else {
        Broker::in_memory(config)
    };
    broker.warn_if_ephemeral();

    // crash-safe startup: flow recovery, then timer re-arm
    broker.start().await?;

    let shared = AppState::new(broker);
    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(Any),
        );

    let addr: SocketAddr = bind.parse().with_context(|| format!("bad bind addr {bind}"))?;
    info!("pxbox listening on http://{addr}");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
