//! ClinicDesk API Server
//!
//! Serves the billing routes and receives PayPal webhooks.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use clinicdesk_api::{create_router, AppState, Config};
use clinicdesk_billing::BillingService;
use clinicdesk_shared::{create_migration_pool, create_pool, run_migrations};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,clinicdesk_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ClinicDesk API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    if config.run_migrations {
        let migration_pool = create_migration_pool(&config.database_url).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;

    let billing = BillingService::from_env(pool)?;
    tracing::info!(plans = billing.catalog.len(), "Billing service initialized");

    let state = AppState::new(config.clone(), Arc::new(billing));

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
