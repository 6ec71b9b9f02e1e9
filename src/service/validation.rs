//! Request body validation against the catalog.

use crate::catalog::{Cardinality, Catalog, RelationshipDescriptor, TableDescriptor};
use crate::error::AppError;
use crate::store::Row;
use crate::value::Scalar;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Create { nested: bool },
    Replace,
}

/// One body object narrowed to the table's column types.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BodyItem {
    /// Canonical column key to canonical wire value.
    pub values: Row,
    /// Nested relationship writes, by relationship key.
    pub nested: Vec<(String, Vec<BodyItem>)>,
}

pub struct RequestValidator;

impl RequestValidator {
    /// Split a body into its objects. A lone object is a batch of one.
    pub fn objects(route: &str, body: Value) -> Result<Vec<Map<String, Value>>, AppError> {
        let elements = match body {
            Value::Object(map) => return Ok(vec![map]),
            Value::Array(items) => items,
            _ => return Err(AppError::BadRequest("Body is invalid.".into())),
        };
        elements
            .into_iter()
            .enumerate()
            .map(|(i, element)| match element {
                Value::Object(map) => Ok(map),
                _ => Err(AppError::BadRequest(format!("{} element #{} should be a dictionary.", route, i))),
            })
            .collect()
    }

    /// Narrow every value to its column's semantic type and split off nested relationship writes.
    /// Create mode also enforces required columns, treating `supplied` as provided by a parent.
    pub fn narrow(
        catalog: &Catalog,
        table: &TableDescriptor,
        object: &Map<String, Value>,
        mode: WriteMode,
        supplied: Option<&str>,
    ) -> Result<BodyItem, AppError> {
        let mut item = BodyItem::default();
        for (key, value) in object {
            if let Some(column) = table.column(key) {
                let scalar = Scalar::from_json(column, value).map_err(|e| AppError::ValueCoercion {
                    parameter: key.clone(),
                    expected: e.expected,
                    value: value.to_string(),
                })?;
                item.values.insert(column.key.clone(), scalar.to_json());
                continue;
            }
            let Some(rel) = table.relationship(key) else {
                return Err(AppError::SchemaMismatch(format!(
                    "Field \"{}\" is not present in {}.",
                    key, table.name
                )));
            };
            let nested_allowed = matches!(mode, WriteMode::Create { nested: true });
            if !nested_allowed {
                return Err(AppError::Unsupported(format!(
                    "nested write through \"{}.{}\"",
                    table.name, rel.key
                )));
            }
            let children: Vec<Map<String, Value>> = match value {
                Value::Null => continue,
                Value::Object(map) if map.is_empty() => continue,
                Value::Array(items) if items.is_empty() => continue,
                Value::Object(map) => vec![map.clone()],
                Value::Array(_) if rel.cardinality == Cardinality::One => {
                    return Err(AppError::BadRequest(format!(
                        "{}.{} should be a dictionary.",
                        table.name, rel.key
                    )))
                }
                Value::Array(_) => Self::objects(&format!("{}.{}", table.name, rel.key), value.clone())?,
                _ => {
                    return Err(AppError::BadRequest(format!(
                        "{}.{} should be a dictionary.",
                        table.name, rel.key
                    )))
                }
            };
            let target = catalog.target_of(rel)?;
            let inserted_first = inserted_before_parent(table, rel)?;
            let child_supplied = if inserted_first { None } else { Some(rel.remote_column.as_str()) };
            let mut narrowed = Vec::with_capacity(children.len());
            for child in &children {
                narrowed.push(Self::narrow(catalog, target, child, mode, child_supplied)?);
            }
            item.nested.push((rel.key.clone(), narrowed));
        }

        if let WriteMode::Create { .. } = mode {
            let mut provided: Vec<&str> = supplied.into_iter().collect();
            for (key, _) in &item.nested {
                if let Some(rel) = table.relationship(key) {
                    if inserted_before_parent(table, rel)? {
                        provided.push(rel.local_column.as_str());
                    }
                }
            }
            Self::require(table, &item.values, &provided)?;
        }
        Ok(item)
    }

    /// Every required column must be present and non-null, except those in `provided`.
    /// All missing columns are reported together.
    pub fn require(table: &TableDescriptor, values: &Row, provided: &[&str]) -> Result<(), AppError> {
        let missing: Vec<String> = table
            .columns
            .iter()
            .filter(|c| c.required_on_create())
            .filter(|c| !provided.iter().any(|p| p.eq_ignore_ascii_case(&c.key)))
            .filter(|c| values.get(&c.key).map_or(true, Value::is_null))
            .map(|c| c.key.clone())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::MissingRequiredFields {
                table: table.name.clone(),
                fields: missing,
            })
        }
    }
}

/// One-cardinality relationships holding the foreign key on this side are written
/// before the parent so the parent can carry the key.
pub fn inserted_before_parent(table: &TableDescriptor, rel: &RelationshipDescriptor) -> Result<bool, AppError> {
    Ok(rel.cardinality == Cardinality::One && !table.expect_column(&rel.local_column)?.primary_key)
}
