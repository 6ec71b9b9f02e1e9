//! In-memory backend. Transactions serialize on one lock and undo their writes
//! when dropped without a commit.

use super::{Restriction, Row, Select, Store, Transaction};
use crate::catalog::{Catalog, ColumnDefault, ColumnDescriptor, RelationshipDescriptor, SemanticType, TableDescriptor};
use crate::error::AppError;
use crate::query::{ColumnRef, Filter, Order};
use crate::value::Scalar;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Row>>,
    /// Last value handed out per (table, column).
    sequences: HashMap<(String, String), i64>,
}

impl Tables {
    fn table_rows(&self, table: &str) -> &[Row] {
        self.rows.get(table).map(Vec::as_slice).unwrap_or(&[])
    }
}

enum Undo {
    Inserted { table: String, position: usize },
    Updated { table: String, position: usize, previous: Row },
    Deleted { table: String, position: usize, row: Row },
    Sequence { key: (String, String), previous: Option<i64> },
}

/// Single-process store for tests and local runs. A transaction holds the one
/// store-wide lock from `begin` until commit or drop, across every await of the
/// request, so requests against this store run one at a time.
#[derive(Clone)]
pub struct MemoryStore {
    catalog: Arc<Catalog>,
    data: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        MemoryStore {
            catalog,
            data: Arc::new(Mutex::new(Tables::default())),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, AppError> {
        let guard = self.data.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            catalog: self.catalog.clone(),
            data: guard,
            undo: Vec::new(),
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction {
    catalog: Arc<Catalog>,
    data: OwnedMutexGuard<Tables>,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemoryTransaction {
    fn undo_all(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Inserted { table, position } => {
                    if let Some(rows) = self.data.rows.get_mut(&table) {
                        if position < rows.len() {
                            rows.remove(position);
                        }
                    }
                }
                Undo::Updated {
                    table,
                    position,
                    previous,
                } => {
                    if let Some(slot) = self.data.rows.get_mut(&table).and_then(|rows| rows.get_mut(position)) {
                        *slot = previous;
                    }
                }
                Undo::Deleted { table, position, row } => {
                    let rows = self.data.rows.entry(table).or_default();
                    rows.insert(position.min(rows.len()), row);
                }
                Undo::Sequence { key, previous } => match previous {
                    Some(v) => {
                        self.data.sequences.insert(key, v);
                    }
                    None => {
                        self.data.sequences.remove(&key);
                    }
                },
            }
        }
    }

    fn next_sequence(&mut self, table: &TableDescriptor, column: &ColumnDescriptor) -> i64 {
        let key = (table.name.clone(), column.key.clone());
        let previous = self.data.sequences.get(&key).copied();
        let next = previous.unwrap_or(0) + 1;
        self.data.sequences.insert(key.clone(), next);
        self.undo.push(Undo::Sequence { key, previous });
        next
    }

    fn observe_sequence(&mut self, table: &TableDescriptor, column: &ColumnDescriptor, value: &Value) {
        let Some(n) = value.as_i64() else { return };
        let key = (table.name.clone(), column.key.clone());
        let previous = self.data.sequences.get(&key).copied();
        if previous.map_or(true, |p| n > p) {
            self.data.sequences.insert(key.clone(), n);
            self.undo.push(Undo::Sequence { key, previous });
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}

fn default_value(table: &TableDescriptor, column: &ColumnDescriptor) -> Result<Value, AppError> {
    match &column.default {
        None => Ok(Value::Null),
        Some(ColumnDefault::Literal(raw)) => Scalar::parse_literal(column, raw)
            .map(|s| s.to_json())
            .map_err(|e| {
                AppError::Internal(format!(
                    "default of {}.{} is not a valid {}",
                    table.name, column.key, e.expected
                ))
            }),
        Some(ColumnDefault::Expression(expr)) => {
            let lower = expr.to_lowercase();
            let now = Utc::now();
            let is_clock = ["now()", "current_timestamp", "current_date", "current_time", "localtimestamp"]
                .iter()
                .any(|f| lower.contains(f));
            let value = match (is_clock, column.semantic) {
                (true, SemanticType::DateTime) => Scalar::DateTime(now),
                (true, SemanticType::Date) => Scalar::Date(now.date_naive()),
                (true, SemanticType::Time) => Scalar::Time(now.time()),
                _ => {
                    tracing::warn!(table = %table.name, column = %column.key, expression = %expr, "default expression not evaluated in memory");
                    Scalar::Null
                }
            };
            Ok(value.to_json())
        }
    }
}

fn not_null_violation(table: &TableDescriptor, row: &Row) -> Option<AppError> {
    table
        .columns
        .iter()
        .find(|c| !c.nullable && row.get(&c.key).map_or(true, Value::is_null))
        .map(|c| {
            AppError::Conflict(format!(
                "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                c.name, table.name
            ))
        })
}

fn same_key(table: &TableDescriptor, a: &Row, b: &Row) -> bool {
    table.primary_key().all(|c| a.get(&c.key) == b.get(&c.key))
}

fn duplicate_key(table: &TableDescriptor) -> AppError {
    AppError::Conflict(format!(
        "duplicate key value violates unique constraint \"{}_pkey\"",
        table.name
    ))
}

/// Rows of the relationship's target joined to `row`.
fn related<'t>(tables: &'t Tables, rel: &RelationshipDescriptor, target: &TableDescriptor, row: &Row) -> Vec<&'t Row> {
    let Some(value) = row.get(&rel.local_column).filter(|v| !v.is_null()) else {
        return Vec::new();
    };
    tables
        .table_rows(&target.name)
        .iter()
        .filter(|r| r.get(&rel.remote_column) == Some(value))
        .collect()
}

fn row_matches(
    catalog: &Catalog,
    tables: &Tables,
    table: &TableDescriptor,
    row: &Row,
    filter: &Filter,
) -> Result<bool, AppError> {
    if filter.is_empty() {
        return Ok(true);
    }
    for group in &filter.groups {
        let mut frontier = vec![row];
        let mut current = table;
        for (rel, target) in catalog.follow(table, &group.chain)? {
            frontier = frontier.into_iter().flat_map(|r| related(tables, rel, target, r)).collect();
            current = target;
        }
        let column = current.expect_column(&group.column)?;
        if frontier.iter().any(|r| group.matches_value(column, r.get(&column.key))) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn compare_rows(table: &TableDescriptor, order: &[Order], a: &Row, b: &Row) -> Ordering {
    let scalar = |column: &ColumnDescriptor, row: &Row| {
        row.get(&column.key)
            .and_then(|v| Scalar::from_json(column, v).ok())
            .unwrap_or(Scalar::Null)
    };
    let keys: Vec<(&ColumnDescriptor, bool)> = if order.is_empty() {
        table.primary_key().map(|c| (c, false)).collect()
    } else {
        order
            .iter()
            .filter_map(|o| table.column(&o.column).map(|c| (c, o.descending)))
            .collect()
    };
    for (column, descending) in keys {
        let ord = scalar(column, a).sort_cmp(&scalar(column, b));
        let ord = if descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Left-join expansion of one base row into projected rows keyed by path.
fn project(
    catalog: &Catalog,
    tables: &Tables,
    table: &TableDescriptor,
    base: &Row,
    columns: &[ColumnRef],
) -> Result<Vec<Row>, AppError> {
    let mut prefixes: BTreeSet<Vec<String>> = BTreeSet::new();
    for c in columns {
        for n in 1..=c.chain.len() {
            prefixes.insert(c.chain[..n].to_vec());
        }
    }

    let mut contexts: Vec<HashMap<Vec<String>, Option<&Row>>> = vec![HashMap::from([(Vec::new(), Some(base))])];
    for prefix in &prefixes {
        let (parent, _) = prefix.split_at(prefix.len() - 1);
        let hops = catalog.follow(table, prefix)?;
        let Some(&(rel, target)) = hops.last() else { continue };
        let mut expanded = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            let joined = match ctx.get(parent).copied().flatten() {
                Some(parent_row) => related(tables, rel, target, parent_row),
                None => Vec::new(),
            };
            if joined.is_empty() {
                let mut next = ctx.clone();
                next.insert(prefix.clone(), None);
                expanded.push(next);
            } else {
                for r in joined {
                    let mut next = ctx.clone();
                    next.insert(prefix.clone(), Some(r));
                    expanded.push(next);
                }
            }
        }
        contexts = expanded;
    }

    Ok(contexts
        .into_iter()
        .map(|ctx| {
            columns
                .iter()
                .map(|c| {
                    let value = ctx
                        .get(&c.chain)
                        .copied()
                        .flatten()
                        .and_then(|r| r.get(&c.column))
                        .cloned()
                        .unwrap_or(Value::Null);
                    (c.path.clone(), value)
                })
                .collect()
        })
        .collect())
}

fn restricted(restrict: &Option<Restriction<'_>>, row: &Row) -> bool {
    match restrict {
        None => true,
        Some(r) => row.get(r.column).map_or(false, |v| r.values.contains(v)),
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn select(&mut self, query: &Select<'_>) -> Result<Vec<Row>, AppError> {
        let tables = &*self.data;
        let mut base: Vec<&Row> = Vec::new();
        for row in tables.table_rows(&query.table.name) {
            if restricted(&query.restrict, row) && row_matches(&self.catalog, tables, query.table, row, query.filter)? {
                base.push(row);
            }
        }
        base.sort_by(|a, b| compare_rows(query.table, query.order, a, b));

        let rows: Vec<Row> = if query.columns.is_empty() {
            base.into_iter().cloned().collect()
        } else {
            let mut out = Vec::new();
            for row in base {
                out.extend(project(&self.catalog, tables, query.table, row, query.columns)?);
            }
            out
        };
        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&mut self, query: &Select<'_>) -> Result<u64, AppError> {
        Ok(self.select(query).await?.len() as u64)
    }

    async fn insert(&mut self, table: &TableDescriptor, values: &Row) -> Result<Row, AppError> {
        let mut row = Row::new();
        for column in &table.columns {
            let provided = values.get(&column.key).filter(|v| !v.is_null());
            let value = match provided {
                Some(v) => {
                    if column.autoincrement {
                        self.observe_sequence(table, column, v);
                    }
                    v.clone()
                }
                None if column.autoincrement => Value::Number(self.next_sequence(table, column).into()),
                None if values.contains_key(&column.key) => Value::Null,
                None => default_value(table, column)?,
            };
            row.insert(column.key.clone(), value);
        }
        if let Some(err) = not_null_violation(table, &row) {
            return Err(err);
        }
        if self.data.table_rows(&table.name).iter().any(|r| same_key(table, r, &row)) {
            return Err(duplicate_key(table));
        }
        let rows = self.data.rows.entry(table.name.clone()).or_default();
        rows.push(row.clone());
        let position = rows.len() - 1;
        self.undo.push(Undo::Inserted {
            table: table.name.clone(),
            position,
        });
        Ok(row)
    }

    async fn update(
        &mut self,
        table: &TableDescriptor,
        key: &Row,
        values: &Row,
    ) -> Result<Option<(Row, Row)>, AppError> {
        let rows = self.data.table_rows(&table.name);
        let Some(position) = rows.iter().position(|r| same_key(table, r, key)) else {
            return Ok(None);
        };
        let previous = rows[position].clone();
        let mut current = previous.clone();
        for (k, v) in values {
            let column = table.expect_column(k)?;
            current.insert(column.key.clone(), v.clone());
        }
        if let Some(err) = not_null_violation(table, &current) {
            return Err(err);
        }
        if !same_key(table, &previous, &current)
            && rows
                .iter()
                .enumerate()
                .any(|(i, r)| i != position && same_key(table, r, &current))
        {
            return Err(duplicate_key(table));
        }
        if let Some(slot) = self.data.rows.get_mut(&table.name).and_then(|rows| rows.get_mut(position)) {
            *slot = current.clone();
        }
        self.undo.push(Undo::Updated {
            table: table.name.clone(),
            position,
            previous: previous.clone(),
        });
        Ok(Some((previous, current)))
    }

    async fn delete_where(&mut self, table: &TableDescriptor, filter: &Filter) -> Result<Vec<Row>, AppError> {
        let mut positions = Vec::new();
        for (i, row) in self.data.table_rows(&table.name).iter().enumerate() {
            if row_matches(&self.catalog, &self.data, table, row, filter)? {
                positions.push(i);
            }
        }
        let mut deleted = Vec::with_capacity(positions.len());
        if let Some(rows) = self.data.rows.get_mut(&table.name) {
            for &position in positions.iter().rev() {
                let row = rows.remove(position);
                deleted.push(row.clone());
                self.undo.push(Undo::Deleted {
                    table: table.name.clone(),
                    position,
                    row,
                });
            }
        }
        deleted.reverse();
        Ok(deleted)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), AppError> {
        self.finished = true;
        self.undo.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), AppError> {
        self.undo_all();
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CatalogConfig};
    use crate::query::{Projection, QueryParams, ReadPlan};
    use serde_json::json;

    fn catalog() -> Arc<Catalog> {
        let config: CatalogConfig = serde_json::from_value(json!({
            "tables": [
                {
                    "name": "owners",
                    "columns": [
                        { "key": "id", "type": "serial", "primary_key": true },
                        { "key": "name", "type": "text", "nullable": false }
                    ],
                    "relationships": [
                        { "key": "bonuses", "target": "bonuses", "cardinality": "many",
                          "local_column": "id", "remote_column": "owner_id", "back_populates": "owner" }
                    ]
                },
                {
                    "name": "bonuses",
                    "columns": [
                        { "key": "id", "type": "serial", "primary_key": true },
                        { "key": "name", "type": "text", "nullable": false },
                        { "key": "active", "type": "boolean", "nullable": false, "default": true },
                        { "key": "owner_id", "type": "integer" }
                    ],
                    "relationships": [
                        { "key": "owner", "target": "owners", "cardinality": "one",
                          "local_column": "owner_id", "remote_column": "id", "back_populates": "bonuses" }
                    ]
                }
            ]
        }))
        .unwrap();
        Arc::new(resolve(&config).unwrap())
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn plan(catalog: &Catalog, table: &str, pairs: &[(&str, &str)]) -> ReadPlan {
        let params = QueryParams::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        ReadPlan::compile(catalog, catalog.resolve(table).unwrap(), &params).unwrap()
    }

    #[tokio::test]
    async fn insert_applies_defaults_and_sequences() {
        let catalog = catalog();
        let store = MemoryStore::new(catalog.clone());
        let bonuses = catalog.resolve("bonuses").unwrap();
        let mut tx = store.begin().await.unwrap();
        let a = tx.insert(bonuses, &row(json!({"name": "a"}))).await.unwrap();
        let b = tx.insert(bonuses, &row(json!({"name": "b"}))).await.unwrap();
        assert_eq!(a["id"], json!(1));
        assert_eq!(b["id"], json!(2));
        assert_eq!(a["active"], json!(true));
        assert_eq!(a["owner_id"], Value::Null);
        let err = tx.insert(bonuses, &row(json!({"id": 1, "name": "c"}))).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let err = tx.insert(bonuses, &row(json!({"active": false}))).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let catalog = catalog();
        let store = MemoryStore::new(catalog.clone());
        let bonuses = catalog.resolve("bonuses").unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert(bonuses, &row(json!({"name": "kept"}))).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert(bonuses, &row(json!({"name": "lost"}))).await.unwrap();
        tx.update(bonuses, &row(json!({"id": 1})), &row(json!({"active": false})))
            .await
            .unwrap();
        tx.delete_where(bonuses, &Filter::default()).await.unwrap();
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        let filter = Filter::default();
        let rows = tx.select(&Select::all(bonuses, &filter)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("kept"));
        assert_eq!(rows[0]["active"], json!(true));
        // The rolled-back insert does not consume its sequence value.
        let next = tx.insert(bonuses, &row(json!({"name": "next"}))).await.unwrap();
        assert_eq!(next["id"], json!(2));
    }

    #[tokio::test]
    async fn relationship_filters_and_column_projection() {
        let catalog = catalog();
        let store = MemoryStore::new(catalog.clone());
        let owners = catalog.resolve("owners").unwrap();
        let bonuses = catalog.resolve("bonuses").unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert(owners, &row(json!({"name": "Ann"}))).await.unwrap();
        tx.insert(owners, &row(json!({"name": "Bob"}))).await.unwrap();
        for (name, owner) in [("a", 1), ("b", 1), ("c", 2)] {
            tx.insert(bonuses, &row(json!({"name": name, "owner_id": owner})))
                .await
                .unwrap();
        }
        tx.insert(bonuses, &row(json!({"name": "orphan"}))).await.unwrap();

        let by_owner = plan(&catalog, "bonuses", &[("owner.name", "ann")]);
        let rows = tx.select(&Select::all(bonuses, &by_owner.filter)).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("a"), json!("b")]);

        let projection = Projection::resolve(&catalog, owners, &["name", "bonuses.name"]).unwrap();
        let filter = Filter::default();
        let query = Select {
            columns: &projection.columns,
            ..Select::all(owners, &filter)
        };
        let rows = tx.select(&query).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], row(json!({"name": "Ann", "bonuses.name": "a"})));
        assert_eq!(rows[2], row(json!({"name": "Bob", "bonuses.name": "c"})));
    }

    #[tokio::test]
    async fn ordering_and_pagination() {
        let catalog = catalog();
        let store = MemoryStore::new(catalog.clone());
        let bonuses = catalog.resolve("bonuses").unwrap();
        let mut tx = store.begin().await.unwrap();
        for name in ["b", "c", "a"] {
            tx.insert(bonuses, &row(json!({"name": name}))).await.unwrap();
        }
        let p = plan(&catalog, "bonuses", &[("desc", "name"), ("limit", "2"), ("offset", "1")]);
        let query = Select {
            order: &p.order,
            limit: p.limit,
            offset: p.offset,
            ..Select::all(bonuses, &p.filter)
        };
        let rows = tx.select(&query).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("b"), json!("a")]);
        assert_eq!(tx.count(&query).await.unwrap(), 2);
    }
}
