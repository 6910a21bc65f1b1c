use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::{api, AuditLedger, Database, LedgerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting audit ledger");

    // Load configuration
    let config = LedgerConfig::load().context("loading ledger configuration")?;
    info!("Configuration loaded");

    // Initialize database
    let database = Database::new(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    info!("Database connected");

    // Run migrations
    database
        .run_migrations()
        .await
        .context("applying ledger schema")?;
    info!("Database migrations completed");

    let ledger = Arc::new(AuditLedger::new(Arc::new(database), &config)?);

    // Background checkpoint scheduler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = ledger.spawn_checkpoint_scheduler(shutdown_rx);

    // Build application
    let app = api::router(ledger);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }

    Ok(())
}
