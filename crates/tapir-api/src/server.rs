use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use tapir_core::query::connection::ConnectionPool;
use tapir_core::{Config, Result, ServiceComponents, SqlxConnectionPool, TapService};

use crate::routes::create_router;
use crate::state::AppState;

/// Run the HTTP server
pub async fn run(config: Config) -> Result<()> {
    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| tapir_core::Error::Config(format!("Invalid host: {}", e)))?,
        config.server.port,
    ));

    // Initialize application state
    let app_state = create_app_state(&config).await?;

    // Build router
    let app = create_router(app_state);

    info!("TAPIR listening on http://{}", addr);
    log_routes();

    // Start server
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| tapir_core::Error::Network(e.to_string()))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| tapir_core::Error::Network(e.to_string()))?;

    Ok(())
}

/// Wire the pool, the service core and its background tasks
pub async fn create_app_state(config: &Config) -> Result<AppState> {
    let pg_pool = tapir_core::db::create_pool(&config.database).await?;
    let pool = Arc::new(SqlxConnectionPool::new(pg_pool));
    let pool_dyn: Arc<dyn ConnectionPool> = pool.clone();

    let service = TapService::new(
        config.service.clone(),
        ServiceComponents::standard(pool_dyn),
    );
    // Released connections wake the scheduler
    pool.attach_refresh_notify(service.refresh_notify());
    service.start().await;

    Ok(AppState::new(service))
}

fn log_routes() {
    info!("  GET|POST /sync                  synchronous queries");
    info!("  GET|POST /async                 asynchronous jobs (UWS)");
    info!("  GET      /tables                published tables");
    info!("  GET      /availability          liveness document");
    info!("  GET      /capabilities          capability document");
}
