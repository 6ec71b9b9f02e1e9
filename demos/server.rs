//! Example server: loads the catalog directory, picks PostgreSQL when DATABASE_URL
//! is set (creating the database and missing tables) or the in-memory store otherwise,
//! and serves the operational and table routes.

use crudstream::{
    app, ensure_database_exists, ensure_tables, load_from_dir, resolve, AppState, MemoryStore, PgStore, Settings,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let settings = Settings::from_env()?;

    let filter = match settings.logging.as_deref() {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crudstream=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_from_dir(&settings.catalog_path).await?;
    let catalog = Arc::new(resolve(&config)?);

    let state = match &settings.database_url {
        Some(database_url) => {
            ensure_database_exists(database_url).await?;
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(settings.db_max_connections)
                .connect(database_url)
                .await?;
            let store = PgStore::new(pool, catalog.clone());
            ensure_tables(store.pool(), &catalog).await?;
            AppState::new(catalog, Arc::new(store))
        }
        None => {
            tracing::info!("DATABASE_URL not set; using the in-memory store");
            AppState::new(catalog.clone(), Arc::new(MemoryStore::new(catalog)))
        }
    }
    .with_heartbeat(settings.stream_heartbeat)
    .with_nested_writes(settings.nested_writes);

    let listener = TcpListener::bind(settings.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state, settings.body_limit_bytes)).await?;
    Ok(())
}
