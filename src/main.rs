use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use mpesa_bridge::{
    config::AppConfig,
    database::{connection::get_db_client, InMemoryTransactionStore, MongoTransactionStore, TransactionStore},
    routes::build_router,
    services::timeout_sweep::spawn_timeout_sweep,
    state::AppState,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    if let Err(e) = run().await {
        tracing::error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load M-Pesa configuration")?;

    let store = initialize_store(&config).await?;
    let app_state = AppState::from_config(&config, store.clone())
        .context("Failed to initialize payment services")?;

    spawn_timeout_sweep(store, config.pending_timeout, config.sweep_interval);
    tracing::info!(
        "Timeout sweep every {}s, pending timeout {}s",
        config.sweep_interval.as_secs(),
        config.pending_timeout.as_secs()
    );

    let app = build_router(app_state);

    let ip = config
        .host
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("HOST is not an IP address: {}", config.host))?;
    let addr = SocketAddr::from((ip, config.port));

    tracing::info!("Server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

async fn initialize_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TransactionStore>> {
    match &config.database_url {
        Some(url) => {
            let db = get_db_client(config, url)
                .await
                .context("Failed to connect to MongoDB")?;
            let store = MongoTransactionStore::new(&db)
                .await
                .context("Failed to prepare transaction collection")?;
            tracing::info!("Using MongoDB transaction store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, transactions will not survive a restart");
            Ok(Arc::new(InMemoryTransactionStore::new()))
        }
    }
}
