//! Portlink control plane
//!
//! Runs the panel: database, node command channel, management API,
//! federation endpoints and the agent/admin WebSocket endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use portlink_api::{build_router, AppState};
use portlink_control::{CommandChannel, Orchestrator};
use portlink_federation::FederationClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "portlink",
    about = "Control plane for a fleet of proxy/forwarding agents",
    version
)]
struct Cli {
    /// Address to bind the HTTP/WebSocket server
    #[arg(short = 'l', long, default_value = "0.0.0.0:8080", env = "PORTLINK_LISTEN")]
    listen: SocketAddr,

    /// Database URL (sqlite file or postgres)
    #[arg(
        long,
        default_value = "sqlite://portlink.db?mode=rwc",
        env = "PORTLINK_DATABASE_URL"
    )]
    database_url: String,

    /// Secret for validating admin tokens
    #[arg(long, env = "PORTLINK_JWT_SECRET")]
    jwt_secret: String,

    /// This panel's domain, sent with federation calls so peers can
    /// attribute usage
    #[arg(long, default_value = "", env = "PORTLINK_PANEL_DOMAIN")]
    panel_domain: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "portlink=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "portlink=info".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting portlink control plane");
    info!(listen = %cli.listen, "listen address");

    let db = portlink_db::connect(&cli.database_url)
        .await
        .context("failed to connect to database")?;
    portlink_db::migrate(&db)
        .await
        .context("failed to run migrations")?;

    let channel = Arc::new(CommandChannel::new());
    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        channel.clone(),
        FederationClient::new(),
        cli.panel_domain.clone(),
    ));
    let state = Arc::new(AppState::new(db, channel, orchestrator, cli.jwt_secret));

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
