pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod storage;
pub mod store;

pub use api::routes::create_app;
pub use config::AppConfig;
pub use error::{CatalogError, CatalogResult};
pub use logic::Catalog;

// Export all model types
pub use model::*;

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};

use std::sync::Arc;
use std::time::Duration;

use crate::storage::{BucketBackend, S3Bucket};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Object storage backend for the configured bucket, if active.
pub fn bucket_from_config(config: &AppConfig) -> anyhow::Result<Option<Arc<dyn BucketBackend>>> {
    if !config.storage.active {
        return Ok(None);
    }
    let bucket = S3Bucket::new(&config.storage)?;
    log::info!(
        "Object storage active: bucket '{}' at {}",
        config.storage.bucket_name,
        config.storage.url
    );
    Ok(Some(Arc::new(bucket)))
}

/// Wire the catalog over `store`, start its background loops and serve HTTP
/// until ctrl-c.
pub async fn serve<S: Store + 'static>(store: Arc<S>, config: AppConfig) -> anyhow::Result<()> {
    use tokio::net::TcpListener;

    let bucket = bucket_from_config(&config)?;
    let bind_address = config.server_address();
    let catalog = Arc::new(Catalog::new(store, config, bucket));
    catalog.auth.bootstrap(&catalog.config.identity).await?;
    let handles = catalog.start()?;

    let app = create_app(catalog.clone());
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("APIHUB catalog listening on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
            log::info!("Shutdown signal received");
        })
        .await?;

    catalog.shutdown(handles, SHUTDOWN_GRACE).await;
    Ok(())
}

/// Load configuration, pick the store backend and run the server.
pub async fn run_server() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    match config.database.backend.as_str() {
        "memory" => {
            log::warn!("Using in-memory store, data is lost on restart");
            serve(Arc::new(MemoryStore::new()), config).await
        }
        _ => {
            log::info!("Connecting to PostgreSQL at {}:{}", config.database.host, config.database.port);
            let max_connections = config.database.max_connections.unwrap_or(10);
            let postgres_store = PostgresStore::new(&config.database_url(), max_connections).await?;
            postgres_store.migrate().await?;
            log::info!("Database migrations applied");
            serve(Arc::new(postgres_store), config).await
        }
    }
}
