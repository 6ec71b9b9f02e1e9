//! Transactional execution surface.
//!
//! Backends implement [`Store`] and [`Transaction`]. Request code goes through a
//! [`Session`], which records every written row and hands the changes to the
//! [`CommitListener`] once the backend transaction has committed.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{ensure_database_exists, ensure_tables, PgStore};

use crate::catalog::TableDescriptor;
use crate::error::AppError;
use crate::notifier::ChangeEvent;
use crate::query::{ColumnRef, Filter, Order};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Row image keyed by column key (or by dotted path for column projections).
pub type Row = Map<String, Value>;

/// Extra `column IN (values)` condition, used for batch eager loading.
#[derive(Clone, Copy, Debug)]
pub struct Restriction<'a> {
    pub column: &'a str,
    pub values: &'a [Value],
}

/// A read against one table.
#[derive(Clone, Copy, Debug)]
pub struct Select<'a> {
    pub table: &'a TableDescriptor,
    /// Empty selects every column of `table`.
    pub columns: &'a [ColumnRef],
    pub filter: &'a Filter,
    pub restrict: Option<Restriction<'a>>,
    /// Empty orders by primary key.
    pub order: &'a [Order],
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Lock selected rows until the transaction ends.
    pub lock: bool,
}

impl<'a> Select<'a> {
    pub fn all(table: &'a TableDescriptor, filter: &'a Filter) -> Self {
        Select {
            table,
            columns: &[],
            filter,
            restrict: None,
            order: &[],
            limit: None,
            offset: None,
            lock: false,
        }
    }
}

#[async_trait]
pub trait Transaction: Send {
    async fn select(&mut self, query: &Select<'_>) -> Result<Vec<Row>, AppError>;

    /// Number of rows `select` would return.
    async fn count(&mut self, query: &Select<'_>) -> Result<u64, AppError>;

    /// Insert one row; absent columns take their defaults. Returns the stored row.
    async fn insert(&mut self, table: &TableDescriptor, values: &Row) -> Result<Row, AppError>;

    /// Update the row identified by the primary-key values in `key`.
    /// Returns the previous and current images, or None when no row has that key.
    async fn update(
        &mut self,
        table: &TableDescriptor,
        key: &Row,
        values: &Row,
    ) -> Result<Option<(Row, Row)>, AppError>;

    /// Delete every row matching `filter` (all rows when empty). Returns the deleted rows.
    async fn delete_where(&mut self, table: &TableDescriptor, filter: &Filter) -> Result<Vec<Row>, AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;

    async fn rollback(self: Box<Self>) -> Result<(), AppError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, AppError>;

    /// Readiness probe.
    async fn ping(&self) -> Result<(), AppError>;

    fn backend(&self) -> &'static str;
}

/// Post-commit hook. Called once per written table with that table's changes, in write order.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, table: &str, changes: &[ChangeEvent]);
}

/// Store plus the commit hook; cheap to clone into request state.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn Store>,
    listener: Option<Arc<dyn CommitListener>>,
    /// Held from backend commit through dispatch so listeners see commits in order.
    publish: Arc<Mutex<()>>,
}

impl Database {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Database {
            store,
            listener: None,
            publish: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn CommitListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn begin(&self) -> Result<Session, AppError> {
        Ok(Session {
            tx: Some(self.store.begin().await?),
            changes: Vec::new(),
            listener: self.listener.clone(),
            publish: self.publish.clone(),
        })
    }
}

/// One request's commit boundary. Dropping it uncommitted rolls the work back.
pub struct Session {
    tx: Option<Box<dyn Transaction>>,
    changes: Vec<ChangeEvent>,
    listener: Option<Arc<dyn CommitListener>>,
    publish: Arc<Mutex<()>>,
}

impl Session {
    fn tx(&mut self) -> Result<&mut Box<dyn Transaction>, AppError> {
        self.tx
            .as_mut()
            .ok_or_else(|| AppError::Internal("session already finished".into()))
    }

    pub async fn select(&mut self, query: &Select<'_>) -> Result<Vec<Row>, AppError> {
        self.tx()?.select(query).await
    }

    pub async fn count(&mut self, query: &Select<'_>) -> Result<u64, AppError> {
        self.tx()?.count(query).await
    }

    pub async fn insert(&mut self, table: &TableDescriptor, values: &Row) -> Result<Row, AppError> {
        let row = self.tx()?.insert(table, values).await?;
        self.changes.push(ChangeEvent::insert(&table.name, row.clone()));
        Ok(row)
    }

    pub async fn update(&mut self, table: &TableDescriptor, key: &Row, values: &Row) -> Result<Option<Row>, AppError> {
        match self.tx()?.update(table, key, values).await? {
            Some((previous, current)) => {
                self.changes
                    .push(ChangeEvent::update(&table.name, previous, current.clone()));
                Ok(Some(current))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_where(&mut self, table: &TableDescriptor, filter: &Filter) -> Result<Vec<Row>, AppError> {
        let rows = self.tx()?.delete_where(table, filter).await?;
        self.changes
            .extend(rows.iter().cloned().map(|r| ChangeEvent::delete(&table.name, r)));
        Ok(rows)
    }

    /// Commit, then run the commit hook before returning. Sessions with changes
    /// to publish commit one at a time, so dispatch order is commit order.
    pub async fn commit(mut self) -> Result<(), AppError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| AppError::Internal("session already finished".into()))?;
        let changes = std::mem::take(&mut self.changes);
        let publishing = self.listener.is_some() && !changes.is_empty();
        let _order = if publishing {
            Some(self.publish.lock().await)
        } else {
            None
        };
        tx.commit().await?;
        if let (Some(listener), true) = (&self.listener, publishing) {
            let mut tables: Vec<&str> = Vec::new();
            for change in &changes {
                if !tables.contains(&change.table.as_str()) {
                    tables.push(&change.table);
                }
            }
            for table in tables {
                let for_table: Vec<ChangeEvent> = changes.iter().filter(|c| c.table == table).cloned().collect();
                listener.on_commit(table, &for_table);
            }
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), AppError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!(pending = self.changes.len(), "session dropped without commit, rolling back");
        }
    }
}
