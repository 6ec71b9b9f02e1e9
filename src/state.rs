//! Shared application state for all routes.

use crate::catalog::Catalog;
use crate::notifier::Notifier;
use crate::store::{Database, Store};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    /// Commits on this database notify `notifier`.
    pub db: Database,
    pub notifier: Arc<Notifier>,
    pub heartbeat: Duration,
    pub nested_writes: bool,
}

impl AppState {
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn Store>) -> Self {
        let notifier = Arc::new(Notifier::new(catalog.clone()));
        let db = Database::new(store).with_listener(notifier.clone());
        AppState {
            catalog,
            db,
            notifier,
            heartbeat: Duration::from_secs(15),
            nested_writes: false,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_nested_writes(mut self, enabled: bool) -> Self {
        self.nested_writes = enabled;
        self
    }
}
