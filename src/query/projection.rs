//! Dotted-path resolution and the projection resolver.

use crate::catalog::{Catalog, ColumnDescriptor, RelationshipDescriptor, TableDescriptor};
use crate::error::AppError;
use std::collections::BTreeMap;

/// What a dotted path ends in.
#[derive(Debug)]
pub enum Terminal<'c> {
    Column(&'c ColumnDescriptor),
    Relationship(&'c RelationshipDescriptor, &'c TableDescriptor),
}

/// A path resolved against the catalog: relationship hops, then one terminal.
#[derive(Debug)]
pub struct ResolvedPath<'c> {
    /// Canonical relationship keys of the hops before the terminal.
    pub chain: Vec<String>,
    /// Table that owns the terminal.
    pub table: &'c TableDescriptor,
    pub terminal: Terminal<'c>,
}

fn location(root: &TableDescriptor, chain: &[String]) -> String {
    std::iter::once(root.name.as_str())
        .chain(chain.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(".")
}

/// Walk `path` token by token from `root`. Columns must be the final token;
/// relationships descend into their target table.
pub fn resolve_path<'c>(
    catalog: &'c Catalog,
    root: &'c TableDescriptor,
    path: &str,
) -> Result<ResolvedPath<'c>, AppError> {
    let tokens: Vec<&str> = path.split('.').collect();
    let mut chain: Vec<String> = Vec::new();
    let mut current = root;

    for (i, token) in tokens.iter().enumerate() {
        let last = i + 1 == tokens.len();
        if let Some(column) = current.column(token) {
            if last {
                return Ok(ResolvedPath {
                    chain,
                    table: current,
                    terminal: Terminal::Column(column),
                });
            }
            // A column has no fields; name the segment that follows it.
            return Err(AppError::SchemaMismatch(format!(
                "Field \"{}\" is not present in {}.{}.",
                tokens[i + 1],
                location(root, &chain),
                column.key
            )));
        }
        if !current.mapped {
            return Err(AppError::Internal(format!(
                "Mapper for table \"{}\" is not present.",
                current.name
            )));
        }
        let Some(rel) = current.relationship(token) else {
            let message = if last {
                format!("Field \"{}\" is not present in {}.", token, location(root, &chain))
            } else {
                format!("Relationship \"{}\" is not present in {}.", token, location(root, &chain))
            };
            return Err(AppError::SchemaMismatch(message));
        };
        let target = catalog.target_of(rel)?;
        if last {
            return Ok(ResolvedPath {
                chain,
                table: current,
                terminal: Terminal::Relationship(rel, target),
            });
        }
        chain.push(rel.key.clone());
        current = target;
    }

    Err(AppError::SchemaMismatch(format!(
        "Field \"\" is not present in {}.",
        location(root, &chain)
    )))
}

/// A projected column reached through `chain`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    /// Requested dotted path, used as the result key.
    pub path: String,
    pub chain: Vec<String>,
    pub column: String,
}

/// Nested eager-load tree keyed by relationship key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Includes(pub BTreeMap<String, Includes>);

impl Includes {
    fn insert(&mut self, chain: &[String]) {
        if let Some((head, rest)) = chain.split_first() {
            self.0.entry(head.clone()).or_default().insert(rest);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Column projections and eager loads requested with `field=`.
#[derive(Clone, Debug, Default)]
pub struct Projection {
    pub columns: Vec<ColumnRef>,
    pub includes: Includes,
}

impl Projection {
    pub fn resolve(catalog: &Catalog, table: &TableDescriptor, fields: &[&str]) -> Result<Self, AppError> {
        let mut projection = Projection::default();
        for field in fields {
            let resolved = resolve_path(catalog, table, field)?;
            match resolved.terminal {
                Terminal::Column(column) => {
                    let r = ColumnRef {
                        path: field.to_string(),
                        chain: resolved.chain,
                        column: column.key.clone(),
                    };
                    if !projection.columns.contains(&r) {
                        projection.columns.push(r);
                    }
                }
                Terminal::Relationship(rel, _) => {
                    let mut chain = resolved.chain;
                    chain.push(rel.key.clone());
                    projection.includes.insert(&chain);
                }
            }
        }
        if !projection.columns.is_empty() && !projection.includes.is_empty() {
            tracing::debug!(table = %table.name, "eager loads ignored with column projection");
            projection.includes = Includes::default();
        }
        Ok(projection)
    }

    /// Whole entities are returned (possibly with eager loads).
    pub fn is_entity(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CatalogConfig};

    fn catalog() -> Catalog {
        let config: CatalogConfig = serde_json::from_value(serde_json::json!({
            "tables": [
                {
                    "name": "owners",
                    "columns": [
                        { "key": "id", "type": "serial", "primary_key": true },
                        { "key": "name", "type": "text" }
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
        resolve(&config).unwrap()
    }

    #[test]
    fn resolves_columns_across_relationships() {
        let catalog = catalog();
        let bonuses = catalog.resolve("bonuses").unwrap();
        let path = resolve_path(&catalog, bonuses, "owner.bonuses.owner.name").unwrap();
        assert_eq!(path.chain, vec!["owner", "bonuses", "owner"]);
        assert!(matches!(path.terminal, Terminal::Column(c) if c.key == "name"));
    }

    #[test]
    fn errors_name_the_missing_segment() {
        let catalog = catalog();
        let bonuses = catalog.resolve("bonuses").unwrap();
        let err = resolve_path(&catalog, bonuses, "owner.nickname").unwrap_err();
        assert_eq!(err.to_string(), "Field \"nickname\" is not present in bonuses.owner.");
        let err = resolve_path(&catalog, bonuses, "sponsor.name").unwrap_err();
        assert_eq!(err.to_string(), "Relationship \"sponsor\" is not present in bonuses.");
        let err = resolve_path(&catalog, bonuses, "id.name").unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
        assert_eq!(err.to_string(), "Field \"name\" is not present in bonuses.id.");
        let err = resolve_path(&catalog, bonuses, "owner.id.name").unwrap_err();
        assert_eq!(err.to_string(), "Field \"name\" is not present in bonuses.owner.id.");
    }

    #[test]
    fn relationship_terminals_become_nested_includes() {
        let catalog = catalog();
        let owners = catalog.resolve("owners").unwrap();
        let projection = Projection::resolve(&catalog, owners, &["bonuses.owner", "bonuses"]).unwrap();
        assert!(projection.is_entity());
        let bonuses = projection.includes.0.get("bonuses").unwrap();
        assert!(bonuses.0.contains_key("owner"));
    }

    #[test]
    fn column_projection_drops_eager_loads() {
        let catalog = catalog();
        let owners = catalog.resolve("owners").unwrap();
        let projection = Projection::resolve(&catalog, owners, &["name", "bonuses"]).unwrap();
        assert_eq!(projection.columns.len(), 1);
        assert!(projection.includes.is_empty());
    }
}
