//! CRUD execution. Each operation runs in one session and commits once.

use crate::catalog::{Catalog, TableDescriptor};
use crate::error::AppError;
use crate::query::{Filter, Includes, ReadPlan};
use crate::serialize::{entities_to_json, EntityNode, Related};
use crate::service::validation::{inserted_before_parent, BodyItem, RequestValidator};
use crate::store::{Database, Restriction, Row, Select, Session};
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::BTreeMap;

pub struct CrudService;

impl CrudService {
    /// Rows matching the plan, as full entities (with eager loads) or projected rows.
    pub async fn read(
        db: &Database,
        catalog: &Catalog,
        table: &TableDescriptor,
        plan: &ReadPlan,
    ) -> Result<Value, AppError> {
        let mut session = db.begin().await?;
        let rows = session.select(&plan_select(table, plan)).await?;
        let out = if plan.projection.is_entity() {
            let nodes = load(&mut session, catalog, table, rows, &plan.projection.includes).await?;
            entities_to_json(&nodes)
        } else {
            Value::Array(rows.into_iter().map(Value::Object).collect())
        };
        session.commit().await?;
        Ok(out)
    }

    /// Number of rows `read` returns for the same plan.
    pub async fn count(db: &Database, table: &TableDescriptor, plan: &ReadPlan) -> Result<u64, AppError> {
        let mut session = db.begin().await?;
        let n = session.count(&plan_select(table, plan)).await?;
        session.commit().await?;
        Ok(n)
    }

    /// Insert every item (and its nested writes). All or nothing.
    pub async fn create(
        db: &Database,
        catalog: &Catalog,
        table: &TableDescriptor,
        items: &[BodyItem],
    ) -> Result<Vec<Value>, AppError> {
        let mut session = db.begin().await?;
        let mut created = Vec::with_capacity(items.len());
        for item in items {
            created.push(insert_graph(&mut session, catalog, table, item).await?.to_json());
        }
        session.commit().await?;
        tracing::debug!(table = %table.name, rows = created.len(), "created");
        Ok(created)
    }

    /// With a filter: apply the single item to every matching row.
    /// Without: merge each item by primary key, inserting when no row has that key.
    pub async fn replace(
        db: &Database,
        table: &TableDescriptor,
        filter: &Filter,
        items: &[BodyItem],
    ) -> Result<Vec<Value>, AppError> {
        let mut session = db.begin().await?;
        let mut out = Vec::new();
        if !filter.is_empty() {
            let [item] = items else {
                return Err(AppError::BadRequest(format!(
                    "a filtered update of {} takes exactly one object",
                    table.name
                )));
            };
            let select = Select {
                lock: true,
                ..Select::all(table, filter)
            };
            for row in session.select(&select).await? {
                let key = primary_key_of(table, &row);
                if let Some(current) = session.update(table, &key, &item.values).await? {
                    out.push(Value::Object(current));
                }
            }
        } else {
            for item in items {
                let key = primary_key_of(table, &item.values);
                let complete = table.primary_key().all(|c| key.get(&c.key).is_some_and(|v| !v.is_null()));
                let updated = if complete {
                    session.update(table, &key, &item.values).await?
                } else {
                    None
                };
                let row = match updated {
                    Some(row) => row,
                    None => {
                        RequestValidator::require(table, &item.values, &[])?;
                        session.insert(table, &item.values).await?
                    }
                };
                out.push(Value::Object(row));
            }
        }
        session.commit().await?;
        tracing::debug!(table = %table.name, rows = out.len(), "replaced");
        Ok(out)
    }

    /// Delete matching rows (every row for an empty filter) and return them.
    pub async fn delete(db: &Database, table: &TableDescriptor, filter: &Filter) -> Result<Vec<Value>, AppError> {
        let mut session = db.begin().await?;
        let rows = session.delete_where(table, filter).await?;
        session.commit().await?;
        tracing::debug!(table = %table.name, rows = rows.len(), "deleted");
        Ok(rows.into_iter().map(Value::Object).collect())
    }
}

fn plan_select<'a>(table: &'a TableDescriptor, plan: &'a ReadPlan) -> Select<'a> {
    Select {
        table,
        columns: &plan.projection.columns,
        filter: &plan.filter,
        restrict: None,
        order: &plan.order,
        limit: plan.limit,
        offset: plan.offset,
        lock: false,
    }
}

fn primary_key_of(table: &TableDescriptor, row: &Row) -> Row {
    table
        .primary_key()
        .filter_map(|c| row.get(&c.key).map(|v| (c.key.clone(), v.clone())))
        .collect()
}

/// Wrap rows as entities and batch-load each requested relationship, one
/// `remote IN (local keys)` select per hop.
fn load<'a>(
    session: &'a mut Session,
    catalog: &'a Catalog,
    table: &'a TableDescriptor,
    rows: Vec<Row>,
    includes: &'a Includes,
) -> BoxFuture<'a, Result<Vec<EntityNode>, AppError>> {
    async move {
        let mut nodes: Vec<EntityNode> = rows.into_iter().map(EntityNode::new).collect();
        for (key, nested) in &includes.0 {
            let rel = table.relationship(key).ok_or_else(|| {
                AppError::Internal(format!("relationship {}.{} missing from catalog", table.name, key))
            })?;
            let target = catalog.target_of(rel)?;

            let mut keys: Vec<Value> = Vec::new();
            for node in &nodes {
                if let Some(v) = node.row.get(&rel.local_column).filter(|v| !v.is_null()) {
                    if !keys.contains(v) {
                        keys.push(v.clone());
                    }
                }
            }
            let related_rows = if keys.is_empty() {
                Vec::new()
            } else {
                let everything = Filter::default();
                let select = Select {
                    restrict: Some(Restriction {
                        column: &rel.remote_column,
                        values: &keys,
                    }),
                    ..Select::all(target, &everything)
                };
                session.select(&select).await?
            };
            let children = load(&mut *session, catalog, target, related_rows, nested).await?;

            for node in &mut nodes {
                let local = node.row.get(&rel.local_column).filter(|v| !v.is_null());
                let entities = children
                    .iter()
                    .filter(|c| local.is_some() && c.row.get(&rel.remote_column) == local)
                    .cloned()
                    .collect();
                node.relations.insert(
                    rel.key.clone(),
                    Related {
                        cardinality: rel.cardinality,
                        back_populates: rel.back_populates.clone(),
                        entities,
                    },
                );
            }
        }
        Ok(nodes)
    }
    .boxed()
}

/// Insert one item with its nested writes. Foreign-key-holding one relationships go
/// first; everything else follows the parent and receives its key.
fn insert_graph<'a>(
    session: &'a mut Session,
    catalog: &'a Catalog,
    table: &'a TableDescriptor,
    item: &'a BodyItem,
) -> BoxFuture<'a, Result<EntityNode, AppError>> {
    async move {
        let mut values = item.values.clone();
        let mut relations = BTreeMap::new();
        let mut after = Vec::new();
        for (key, children) in &item.nested {
            let rel = table.relationship(key).ok_or_else(|| {
                AppError::Internal(format!("relationship {}.{} missing from catalog", table.name, key))
            })?;
            let target = catalog.target_of(rel)?;
            if !inserted_before_parent(table, rel)? {
                after.push((rel, target, children));
                continue;
            }
            let mut entities = Vec::with_capacity(children.len());
            for child in children {
                entities.push(insert_graph(&mut *session, catalog, target, child).await?);
            }
            if let Some(first) = entities.first() {
                let fk = first.row.get(&rel.remote_column).cloned().unwrap_or(Value::Null);
                values.insert(rel.local_column.clone(), fk);
            }
            relations.insert(
                rel.key.clone(),
                Related {
                    cardinality: rel.cardinality,
                    back_populates: rel.back_populates.clone(),
                    entities,
                },
            );
        }

        let row = session.insert(table, &values).await?;

        for (rel, target, children) in after {
            let parent_key = row.get(&rel.local_column).cloned().unwrap_or(Value::Null);
            let mut entities = Vec::with_capacity(children.len());
            for child in children {
                let mut child = child.clone();
                child.values.insert(rel.remote_column.clone(), parent_key.clone());
                entities.push(insert_graph(&mut *session, catalog, target, &child).await?);
            }
            relations.insert(
                rel.key.clone(),
                Related {
                    cardinality: rel.cardinality,
                    back_populates: rel.back_populates.clone(),
                    entities,
                },
            );
        }
        Ok(EntityNode { row, relations })
    }
    .boxed()
}
