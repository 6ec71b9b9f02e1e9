//! crudstream: catalog-driven REST CRUD over relational tables, with live change streams.

pub mod catalog;
pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod notifier;
pub mod query;
pub mod response;
pub mod routes;
pub mod serialize;
pub mod service;
pub mod settings;
pub mod sql;
pub mod state;
pub mod store;
pub mod value;

pub use catalog::{Catalog, TableDescriptor};
pub use config::{load_from_dir, resolve, CatalogConfig};
pub use error::{AppError, ConfigError};
pub use notifier::Notifier;
pub use routes::{app, common_routes, table_routes};
pub use settings::Settings;
pub use state::AppState;
pub use store::{ensure_database_exists, ensure_tables, Database, MemoryStore, PgStore};
