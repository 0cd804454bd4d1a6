use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};
use wagate_core::{GatewayClient, PgSessionStore, WagateConfig};

use wagate_server::http::{start_http_server, AppState};
use wagate_server::locks::TenantLocks;

/// Startup DB ping retries: the database container often comes up after us.
const DB_PING_ATTEMPTS: u32 = 5;
const DB_PING_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "wagate.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match WagateConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging: RUST_LOG wins, the config's log level is the fallback
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    // Connect to DB, waiting for it to come up
    let pool = connect_with_retries(&config).await;

    if args.health {
        match wagate_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Wagate DB health check passed");
        return Ok(());
    }

    if let Err(e) = wagate_core::db::ensure_schema(&pool).await {
        eprintln!("Failed to bootstrap schema: {}", e);
        std::process::exit(1);
    }

    let gateway = match GatewayClient::new(&config.gateway) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to create gateway client: {}", e);
            std::process::exit(1);
        }
    };

    let state = AppState {
        store: Arc::new(PgSessionStore::new(pool.clone())),
        gateway: Arc::new(gateway),
        locks: Arc::new(TenantLocks::new()),
        pool: Some(pool),
    };

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let addr = format!("{}:{}", config.http.host, config.http.port);
    start_http_server(addr, state, tx.subscribe()).await?;

    Ok(())
}

async fn connect_with_retries(config: &WagateConfig) -> sqlx::PgPool {
    let mut last_err = None;
    for attempt in 1..=DB_PING_ATTEMPTS {
        match wagate_core::db::create_pool(&config.database).await {
            Ok(pool) => return pool,
            Err(e) => {
                tracing::warn!(attempt, error = %e, "database not ready");
                last_err = Some(e);
                tokio::time::sleep(DB_PING_DELAY).await;
            }
        }
    }
    eprintln!(
        "Failed to connect to database after {} attempts: {}",
        DB_PING_ATTEMPTS,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    );
    std::process::exit(1);
}
