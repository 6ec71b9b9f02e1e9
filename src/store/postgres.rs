//! PostgreSQL backend over sqlx: one database transaction per session.

use super::{Row, Select, Store, Transaction};
use crate::catalog::{Catalog, ColumnDefault, SemanticType, TableDescriptor};
use crate::error::{AppError, ConfigError};
use crate::query::Filter;
use crate::sql::{self, Output, QueryBuf};
use crate::value::Scalar;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{ConnectOptions, Postgres, Row as _};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    catalog: Arc<Catalog>,
}

impl PgStore {
    pub fn new(pool: PgPool, catalog: Arc<Catalog>) -> Self {
        PgStore { pool, catalog }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, AppError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction {
            tx,
            catalog: self.catalog.clone(),
        }))
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    catalog: Arc<Catalog>,
}

impl PgTransaction {
    async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Row>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(p.clone());
        }
        let rows = query.fetch_all(&mut *self.tx).await?;
        rows.iter().map(|r| row_to_json(r, &q.outputs)).collect()
    }

    async fn fetch_optional(&mut self, q: &QueryBuf) -> Result<Option<Row>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(p.clone());
        }
        let row = query.fetch_optional(&mut *self.tx).await?;
        row.map(|r| row_to_json(&r, &q.outputs)).transpose()
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn select(&mut self, query: &Select<'_>) -> Result<Vec<Row>, AppError> {
        let q = sql::select(&self.catalog, query)?;
        self.fetch_all(&q).await
    }

    async fn count(&mut self, query: &Select<'_>) -> Result<u64, AppError> {
        let q = sql::count(&self.catalog, query)?;
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut statement = sqlx::query(&q.sql);
        for p in &q.params {
            statement = statement.bind(p.clone());
        }
        let row = statement.fetch_one(&mut *self.tx).await?;
        let n: i64 = row.try_get("count")?;
        Ok(n.max(0) as u64)
    }

    async fn insert(&mut self, table: &TableDescriptor, values: &Row) -> Result<Row, AppError> {
        let q = sql::insert(table, values)?;
        self.fetch_optional(&q)
            .await?
            .ok_or_else(|| AppError::Db(sqlx::Error::RowNotFound))
    }

    async fn update(
        &mut self,
        table: &TableDescriptor,
        key: &Row,
        values: &Row,
    ) -> Result<Option<(Row, Row)>, AppError> {
        let Some(previous) = self.fetch_optional(&sql::select_by_key(table, key)?).await? else {
            return Ok(None);
        };
        let q = sql::update_by_key(table, key, values)?;
        Ok(self.fetch_optional(&q).await?.map(|current| (previous, current)))
    }

    async fn delete_where(&mut self, table: &TableDescriptor, filter: &Filter) -> Result<Vec<Row>, AppError> {
        let q = sql::delete_where(&self.catalog, table, filter)?;
        self.fetch_all(&q).await
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn row_to_json(row: &PgRow, outputs: &[Output]) -> Result<Row, AppError> {
    let mut map = Row::new();
    for out in outputs {
        let v = cell_to_value(row, out)?;
        map.insert(out.key.clone(), v);
    }
    Ok(map)
}

/// Decode one select-list cell by the column's semantic type (see the select-list casts).
fn cell_to_value(row: &PgRow, out: &Output) -> Result<Value, AppError> {
    let name = out.key.as_str();
    let column = &out.column;
    let scalar = match column.semantic {
        SemanticType::Bool => row.try_get::<Option<bool>, _>(name)?.map(Scalar::Bool),
        SemanticType::Int => row.try_get::<Option<i64>, _>(name)?.map(Scalar::Int),
        SemanticType::Float => row.try_get::<Option<f64>, _>(name)?.map(Scalar::Float),
        SemanticType::Duration => row.try_get::<Option<f64>, _>(name)?.map(Scalar::Duration),
        SemanticType::Date => row.try_get::<Option<chrono::NaiveDate>, _>(name)?.map(Scalar::Date),
        SemanticType::DateTime if column.pg_type == "timestamptz" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)?
            .map(Scalar::DateTime),
        SemanticType::DateTime => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(name)?
            .map(|d| Scalar::DateTime(d.and_utc())),
        SemanticType::String => row.try_get::<Option<String>, _>(name)?.map(Scalar::Text),
        SemanticType::Decimal | SemanticType::Enum | SemanticType::Time => {
            match row.try_get::<Option<String>, _>(name)? {
                Some(s) => Some(Scalar::from_json(column, &Value::String(s)).map_err(|e| {
                    AppError::Internal(format!("column {} did not decode as {}", column.key, e.expected))
                })?),
                None => None,
            }
        }
    };
    Ok(scalar.map(|s| s.to_json()).unwrap_or(Value::Null))
}

fn literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Create missing schemas, enum types, tables and foreign keys for the catalog.
/// Existing objects are left untouched.
pub async fn ensure_tables(pool: &PgPool, catalog: &Catalog) -> Result<(), AppError> {
    let schemas: HashSet<&str> = catalog.tables().iter().map(|t| t.schema.as_str()).collect();
    for schema in schemas {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote(schema)))
            .execute(pool)
            .await?;
    }

    let mut enums_done: HashSet<&str> = HashSet::new();
    for column in catalog.tables().iter().flat_map(|t| t.columns.iter()) {
        if column.semantic != SemanticType::Enum || !enums_done.insert(column.ddl_type.as_str()) {
            continue;
        }
        let values: Vec<String> = column.enum_values.iter().map(|v| literal(v)).collect();
        let sql = format!(
            "DO $$ BEGIN CREATE TYPE {} AS ENUM ({}); EXCEPTION WHEN duplicate_object THEN NULL; END $$",
            column.ddl_type,
            values.join(", ")
        );
        sqlx::raw_sql(&sql).execute(pool).await?;
    }

    for t in catalog.tables() {
        let mut col_defs: Vec<String> = Vec::new();
        for c in &t.columns {
            let mut def = format!("{} {}", quote(&c.name), c.ddl_type);
            if !c.nullable {
                def.push_str(" NOT NULL");
            }
            match &c.default {
                Some(ColumnDefault::Literal(s)) => {
                    def.push_str(" DEFAULT ");
                    def.push_str(&literal(s));
                }
                Some(ColumnDefault::Expression(e)) => {
                    def.push_str(" DEFAULT ");
                    def.push_str(e);
                }
                None => {}
            }
            col_defs.push(def);
        }
        let pk_cols: Vec<String> = t.primary_key().map(|c| quote(&c.name)).collect();
        col_defs.push(format!("PRIMARY KEY ({})", pk_cols.join(", ")));

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\n  {}\n)",
            quote(&t.schema),
            quote(&t.name),
            col_defs.join(",\n  ")
        );
        tracing::debug!(sql = %sql, "ensure table");
        sqlx::query(&sql).execute(pool).await?;
    }

    // Foreign keys for one-cardinality relationships that reference the target's primary key.
    for t in catalog.tables() {
        for rel in &t.relationships {
            let target = catalog.target_of(rel)?;
            let remote = target.expect_column(&rel.remote_column)?;
            let local = t.expect_column(&rel.local_column)?;
            if !remote.primary_key || local.primary_key {
                continue;
            }
            let constraint = format!("fk_{}_{}", t.name, rel.key);
            let sql = format!(
                "DO $$ BEGIN ALTER TABLE {}.{} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}.{} ({}); \
                 EXCEPTION WHEN duplicate_object THEN NULL; END $$",
                quote(&t.schema),
                quote(&t.name),
                quote(&constraint),
                quote(&local.name),
                quote(&target.schema),
                quote(&target.name),
                quote(&remote.name)
            );
            sqlx::raw_sql(&sql).execute(pool).await?;
        }
    }

    tracing::info!(tables = catalog.tables().len(), "tables ensured");
    Ok(())
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| ConfigError::Setting {
            name: "DATABASE_URL",
            reason: e.to_string(),
        })?;
    let mut conn: sqlx::PgConnection = opts.connect().await.map_err(AppError::Db)?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await
        .map_err(AppError::Db)?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", quote(&db_name)))
            .execute(&mut conn)
            .await
            .map_err(AppError::Db)?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| ConfigError::Setting {
            name: "DATABASE_URL",
            reason: "no path".into(),
        })?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    Ok((format!("{}postgres", base), db_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_url_targets_postgres_database() {
        let (admin, name) = parse_db_name_from_url("postgres://u:p@localhost:5432/bonuses?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@localhost:5432/postgres");
        assert_eq!(name, "bonuses");
    }
}
