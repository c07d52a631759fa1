//! JustData Server - analytics engine
//!
//! A Rust REST API server running long-lived analysis jobs against a
//! columnar analytics warehouse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use justdata_server::{
    ai::AiClient,
    api,
    census::CensusClient,
    config::AppConfig,
    engine::EngineContext,
    jobs::{Orchestrator, ReportStore},
    warehouse::{resolve_warehouse_url, PgWarehouse},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().expect("Failed to load configuration");

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("justdata_server={},tower_http=debug", config.logging.level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting JustData Server v{}", env!("CARGO_PKG_VERSION"));

    // Resolve warehouse credentials: explicit config, then environment.
    // Absence is fatal at startup.
    let warehouse_url = resolve_warehouse_url(None, config.warehouse.url.as_deref())
        .expect("Warehouse credentials not resolvable (set JUSTDATA_WAREHOUSE_URL or DATABASE_URL)");

    // Create warehouse connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.warehouse.max_connections)
        .min_connections(config.warehouse.min_connections)
        .connect(&warehouse_url)
        .await
        .expect("Failed to connect to warehouse");

    tracing::info!("Connected to warehouse");

    let warehouse = Arc::new(PgWarehouse::new(
        pool,
        config.warehouse.max_concurrent,
        Duration::from_secs(config.warehouse.query_timeout_secs),
    ));

    let census = Arc::new(CensusClient::new(&config.census).expect("Failed to build census client"));
    if config.census.api_key.is_none() {
        tracing::warn!("No census API key configured; demographic context will degrade");
    }

    let ai = AiClient::from_config(&config.ai).map(Arc::new);
    if ai.is_none() {
        tracing::warn!("No narrative provider configured; narratives will degrade");
    }

    let store = Arc::new(ReportStore::new(
        config.artifacts.dir.clone().into(),
        Duration::from_secs(config.limits.report_ttl_secs),
    ));

    // Periodic sweep of expired reports.
    {
        let store = Arc::clone(&store);
        let interval = Duration::from_secs(config.limits.gc_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.gc_sweep().await;
            }
        });
    }

    // Save server address before moving config
    let server_host = config.server.host.clone();
    let server_port = config.server.port;
    let config = Arc::new(config);

    let orchestrator = Orchestrator::new(Arc::new(EngineContext {
        config: Arc::clone(&config),
        warehouse,
        census,
        ai,
        store: Arc::clone(&store),
    }));

    // Create application state
    let state = AppState {
        config: Arc::clone(&config),
        orchestrator,
        store,
        warehouse_ready: true,
    };

    // Build router
    let app = create_router(state, &config);

    // Start server
    let addr = SocketAddr::new(
        server_host.parse().expect("Invalid host address"),
        server_port,
    );

    tracing::info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Create the application router with all routes
fn create_router(state: AppState, config: &AppConfig) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Rate limit analysis submissions per client address.
    let governor_conf = Box::new(
        GovernorConfigBuilder::default()
            .per_second(config.limits.analyze_rate_per_sec)
            .burst_size(config.limits.analyze_burst)
            .finish()
            .expect("Invalid rate limit configuration"),
    );

    let analyze = Router::new()
        .route("/analyze", post(api::analyze::analyze))
        .layer(GovernorLayer {
            config: Box::leak(governor_conf),
        })
        .with_state(state.clone());

    let engine_routes = Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Jobs
        .route("/progress/:job_id", get(api::progress::progress))
        .route("/status/:job_id", get(api::report::status))
        .route("/cancel/:job_id", post(api::report::cancel))
        // Reports
        .route("/report-data", get(api::report::report_data))
        .route("/download", get(api::report::download))
        .with_state(state);

    // OpenAPI documentation
    let openapi = api::openapi::create_openapi_router();

    Router::new()
        .merge(analyze)
        .merge(engine_routes)
        .merge(openapi)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
}
