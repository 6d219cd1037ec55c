// Consent Gateway Service
// Creates bank consents for users, reconciles pending ones in the background
// and pushes approvals to waiting clients

use consent_engine::{
    BankApiClient, BankRegistry, Config, ConsentRepository, ConsentService, CredentialCache,
    Database, NotificationHub, PgConsentRepository, PollerConfig, ReconciliationPoller,
    RedisCredentialStore,
};
use consent_gateway::{router, AppState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_line_number(true)
        .init();

    info!("Starting Consent Gateway Service");

    let config = Config::from_env()?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    // Connect to PostgreSQL
    info!("Connecting to database");
    let db = Arc::new(Database::new(&config.database.url, config.database.max_connections).await?);

    info!("Running database migrations");
    sqlx::migrate!("./migrations").run(db.pool()).await?;

    // Connect to Redis
    info!("Connecting to Redis: {}", config.redis.url);
    let redis_client = redis::Client::open(config.redis.url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client).await?;

    let banks = Arc::new(BankRegistry::new(config.banks.clone()));
    info!("Configured banks: {:?}", banks.codes().collect::<Vec<_>>());

    let client = BankApiClient::new(
        config.bank_request_timeout(),
        config.aggregator.requesting_bank.clone(),
    )?;
    let credentials = Arc::new(CredentialCache::new(
        Arc::new(RedisCredentialStore::new(redis)),
        client.clone(),
        config.credential_fallback_lifetime(),
    ));
    let hub = Arc::new(NotificationHub::new(config.hub.subscriber_buffer));

    let repositories: Vec<Arc<dyn ConsentRepository>> = vec![
        Arc::new(PgConsentRepository::account_access(db.clone())),
        Arc::new(PgConsentRepository::product_agreement(db.clone())),
    ];
    let poller = ReconciliationPoller::new(
        repositories,
        banks.clone(),
        credentials.clone(),
        client.clone(),
        hub.clone(),
        PollerConfig::from(&config.poller),
    );

    let shutdown = CancellationToken::new();
    let poller_handle = poller.spawn(shutdown.clone());

    let consents = Arc::new(ConsentService::new(
        db.clone(),
        banks,
        credentials,
        client,
        config.aggregator.clone(),
    ));

    let state = AppState {
        db,
        consents,
        hub,
        wait: config.hub.clone(),
    };
    let app = router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Gateway listening on: {}", bind_addr);
    info!("   POST /api/account-consent - Request account access (X-Bank-Code)");
    info!("   POST /api/product-consents - Request product-agreement access (X-Bank-Code)");
    info!("   GET  /api/consents/:id/wait - Wait for approval");
    info!("   GET  /ws - Live approval events");
    info!("   GET  /health - Health check");
    info!("   GET  /metrics - Prometheus metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = poller_handle.await {
        warn!("Reconciliation loop ended abnormally: {}", e);
    }

    info!("Consent Gateway stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
