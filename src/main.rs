//! ViperGrid - real-money grid survival matches
//!
//! One process hosts the HTTP surface, the per-session tick loops, and the
//! settlement layer against the SQLite ledger and the PIX gateway.

use anyhow::{Context, Result};
use axum::middleware as axum_middleware;
use clap::Parser;
use dotenv::dotenv;
use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vipergrid_backend::{
    api::{create_router, AppState},
    config::{ConfigHandle, ConfigSnapshot},
    gateway::pix::PixClient,
    ledger::LedgerDb,
    manager::SessionManager,
    middleware::request_logging,
    settlement::SettlementCoordinator,
};

#[derive(Parser, Debug)]
#[command(name = "vipergrid", about = "ViperGrid match and settlement server")]
struct Args {
    /// Address to bind the HTTP server to
    #[arg(long, env = "VG_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Path to the SQLite ledger database
    #[arg(long, env = "VG_DB_PATH", default_value = "vipergrid_ledger.db")]
    db_path: String,

    /// PIX gateway base URL
    #[arg(long, env = "VG_GATEWAY_URL", default_value = "https://api.pix-gateway.example")]
    gateway_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = Args::parse();
    info!("ViperGrid server starting");

    let config = Arc::new(ConfigHandle::new(ConfigSnapshot::from_env()));

    let ledger = Arc::new(LedgerDb::new(&args.db_path).context("Failed to open ledger")?);
    info!("Ledger initialized at: {}", args.db_path);

    let gateway_key = env::var("VG_GATEWAY_API_KEY").unwrap_or_else(|_| "dev-key".to_string());
    let gateway = Arc::new(
        PixClient::new(&args.gateway_url, &gateway_key)
            .context("Failed to build gateway client")?,
    );

    let coordinator = Arc::new(SettlementCoordinator::new(
        ledger.clone(),
        gateway.clone(),
        config.clone(),
    ));
    let manager = Arc::new(SessionManager::new(coordinator.clone(), config.clone()));

    let state = AppState {
        manager,
        coordinator,
        ledger,
        gateway,
        config,
    };

    let app = create_router(state)
        .layer(axum_middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!("Listening on {}", args.bind);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vipergrid_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
