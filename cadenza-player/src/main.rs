//! Cadenza Player - Main entry point
//!
//! Playback-orchestrator service: binds the rendering-node pool, the
//! session registry, and the HTTP/SSE control surface, then runs until a
//! shutdown signal arrives. Shutdown flushes session snapshots before the
//! process exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadenza_player::api;
use cadenza_player::config;
use cadenza_player::node::{Node, NodePool, RestNodeClient};
use cadenza_player::persist::SqliteSnapshotStore;
use cadenza_player::platform::LoggingPlatform;
use cadenza_player::registry::SessionRegistry;
use cadenza_player::session::HttpRecommender;

/// Command-line arguments for cadenza-player
#[derive(Parser, Debug)]
#[command(name = "cadenza-player")]
#[command(about = "Playback orchestrator service for Cadenza")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CADENZA_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "CADENZA_PORT")]
    port: Option<u16>,

    /// Snapshot database path (overrides the config file)
    #[arg(short, long, env = "CADENZA_DB")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadenza_player=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    if let Some(database) = args.database {
        config.database.path = database.to_string_lossy().to_string();
    }

    info!("Starting Cadenza Player on port {}", config.listen.port);

    // Snapshot store
    let db_options = SqliteConnectOptions::new()
        .filename(&config.database.path)
        .create_if_missing(true);
    let db_pool = SqlitePoolOptions::new()
        .connect_with(db_options)
        .await
        .context("Failed to open snapshot database")?;
    let snapshots = Arc::new(
        SqliteSnapshotStore::new(db_pool)
            .await
            .context("Failed to initialize snapshot store")?,
    );

    // Rendering-node pool
    let pool = Arc::new(NodePool::new());
    for node_config in &config.nodes {
        let client = RestNodeClient::connect(node_config);
        let node = Node::new(node_config.id.clone(), client);
        node.start_event_pump()
            .context("Failed to start node event pump")?;
        node.start_stats_poll(std::time::Duration::from_secs(60))
            .context("Failed to start node stats poll")?;
        pool.register(node);
    }
    if pool.is_empty() {
        warn!("No rendering nodes configured; sessions cannot be created until one is registered");
    }

    // Collaborators and registry
    let platform: Arc<dyn cadenza_player::platform::ChatPlatform> = Arc::new(LoggingPlatform);
    let recommender: Option<Arc<dyn cadenza_player::session::Recommender>> = config
        .recommender_url
        .as_ref()
        .map(|url| Arc::new(HttpRecommender::new(url.clone())) as Arc<_>);
    let snapshots: Arc<dyn cadenza_player::persist::SnapshotStore> = snapshots;
    let registry = SessionRegistry::new(
        pool,
        platform,
        recommender,
        Some(snapshots),
        Arc::new(config.player.clone()),
    );

    // HTTP control surface
    let app_state = api::AppState {
        registry: Arc::clone(&registry),
        default_skin: config.default_skin.clone().unwrap_or_else(|| "default".into()),
    };
    let app = api::create_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.listen.host, config.listen.port)
        .parse()
        .context("Invalid listen address")?;
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Flush snapshots and tear sessions down before exiting
    registry.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
