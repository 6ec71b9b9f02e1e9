//! Resolve config into the catalog, and load config from a directory of JSON files.

use crate::catalog::{
    Cardinality, Catalog, ColumnDefault, ColumnDescriptor, RelationshipDescriptor, SemanticType, TableDescriptor,
};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use std::collections::HashMap;
use std::path::Path;

const DEFAULT_SCHEMA: &str = "public";

/// Build the catalog from config (validates first). Any column whose type cannot be inferred is fatal.
pub fn resolve(config: &CatalogConfig) -> Result<Catalog, ConfigError> {
    validate(config)?;

    let enums_by_name: HashMap<String, &EnumConfig> =
        config.enums.iter().map(|e| (e.name.to_lowercase(), e)).collect();

    let mut tables = Vec::with_capacity(config.tables.len());
    for table in &config.tables {
        let schema = table.schema.clone().unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
        let mut columns = Vec::with_capacity(table.columns.len());
        for c in &table.columns {
            let type_name = c.type_.base_name();
            let enum_config = enums_by_name.get(&type_name.to_lowercase());
            let semantic = match enum_config {
                Some(_) => SemanticType::Enum,
                None => infer_semantic_type(type_name).ok_or_else(|| ConfigError::UnknownType {
                    table: table.name.clone(),
                    column: c.key.clone(),
                    type_name: type_name.to_string(),
                })?,
            };
            let pg_type = match enum_config {
                Some(e) => format!("{}.{}", quoted(&schema), quoted(&e.name)),
                None => cast_type_name(type_name),
            };
            columns.push(ColumnDescriptor {
                key: c.key.clone(),
                name: c.name.clone().unwrap_or_else(|| c.key.clone()),
                semantic,
                enum_values: enum_config.map(|e| e.values.clone()).unwrap_or_default(),
                nullable: c.nullable && !c.primary_key,
                default: c.default.as_ref().map(ColumnDefault::from),
                autoincrement: c.autoincrement || is_serial(type_name),
                primary_key: c.primary_key,
                pg_type,
                ddl_type: match enum_config {
                    Some(e) => format!("{}.{}", quoted(&schema), quoted(&e.name)),
                    None => c.type_.ddl(),
                },
            });
        }

        let relationships = table
            .relationships
            .iter()
            .map(|r| RelationshipDescriptor {
                key: r.key.clone(),
                target: r.target.clone(),
                cardinality: match r.cardinality {
                    CardinalityConfig::One => Cardinality::One,
                    CardinalityConfig::Many => Cardinality::Many,
                },
                local_column: canonical_key(table, &r.local_column),
                remote_column: config
                    .tables
                    .iter()
                    .find(|t| t.name.eq_ignore_ascii_case(&r.target))
                    .map(|t| canonical_key(t, &r.remote_column))
                    .unwrap_or_else(|| r.remote_column.clone()),
                back_populates: r.back_populates.clone(),
            })
            .collect();

        tables.push(TableDescriptor {
            name: table.name.clone(),
            schema,
            columns,
            relationships,
            mapped: table.mapped,
        });
    }

    tracing::debug!(tables = tables.len(), "catalog resolved");
    Ok(Catalog::new(tables))
}

/// Column keys are matched case-insensitively; store the declared spelling.
fn canonical_key(table: &TableConfig, key: &str) -> String {
    table
        .columns
        .iter()
        .find(|c| c.key.eq_ignore_ascii_case(key))
        .map(|c| c.key.clone())
        .unwrap_or_else(|| key.to_string())
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Map a PostgreSQL type name to a semantic type.
pub fn infer_semantic_type(type_name: &str) -> Option<SemanticType> {
    let lower = type_name.trim().to_lowercase();
    let ty = match lower.as_str() {
        "bool" | "boolean" => SemanticType::Bool,
        "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" | "serial" | "serial4"
        | "bigserial" | "serial8" | "smallserial" | "serial2" => SemanticType::Int,
        "real" | "float4" | "double precision" | "float8" | "float" => SemanticType::Float,
        "numeric" | "decimal" | "money" => SemanticType::Decimal,
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" | "citext" | "uuid" => {
            SemanticType::String
        }
        "date" => SemanticType::Date,
        "time" | "timetz" | "time without time zone" | "time with time zone" => SemanticType::Time,
        "timestamp" | "timestamptz" | "timestamp without time zone" | "timestamp with time zone" => {
            SemanticType::DateTime
        }
        "interval" => SemanticType::Duration,
        _ => return None,
    };
    Some(ty)
}

fn is_serial(type_name: &str) -> bool {
    type_name.to_lowercase().contains("serial")
}

/// Type used in `$n::type` casts. Serial pseudo-types are not castable.
fn cast_type_name(type_name: &str) -> String {
    let lower = type_name.trim().to_lowercase();
    match lower.as_str() {
        "serial" | "serial4" => "integer".into(),
        "bigserial" | "serial8" => "bigint".into(),
        "smallserial" | "serial2" => "smallint".into(),
        "timestamp with time zone" => "timestamptz".into(),
        "timestamp without time zone" => "timestamp".into(),
        _ => lower,
    }
}

/// Load catalog config from `dir/tables.json` and, when present, `dir/enums.json`.
pub async fn load_from_dir(dir: impl AsRef<Path>) -> Result<CatalogConfig, ConfigError> {
    let dir = dir.as_ref();
    let tables_path = dir.join("tables.json");
    let raw = tokio::fs::read_to_string(&tables_path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", tables_path.display(), e)))?;
    let tables: Vec<TableConfig> =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Load(format!("{}: {}", tables_path.display(), e)))?;

    let enums_path = dir.join("enums.json");
    let enums: Vec<EnumConfig> = match tokio::fs::read_to_string(&enums_path).await {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Load(format!("{}: {}", enums_path.display(), e)))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(ConfigError::Load(format!("{}: {}", enums_path.display(), e))),
    };

    tracing::info!(dir = %dir.display(), tables = tables.len(), enums = enums.len(), "catalog config loaded");
    Ok(CatalogConfig { enums, tables })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(column_type: &str) -> CatalogConfig {
        let tables: Vec<TableConfig> = serde_json::from_value(serde_json::json!([
            {
                "name": "Bonuses",
                "columns": [
                    { "key": "id", "type": "serial", "primary_key": true },
                    { "key": "name", "name": "FallbackName", "type": { "name": "varchar", "params": [255] }, "nullable": false },
                    { "key": "kind", "type": column_type },
                    { "key": "active", "type": "boolean", "nullable": false, "default": true }
                ]
            }
        ]))
        .unwrap();
        CatalogConfig {
            enums: vec![EnumConfig {
                name: "bonus_kind".into(),
                values: vec!["Gift".into(), "Discount".into()],
            }],
            tables,
        }
    }

    #[test]
    fn resolves_columns_and_types() {
        let catalog = resolve(&config("bonus_kind")).unwrap();
        let table = catalog.resolve("bonuses").unwrap();
        let id = table.column("id").unwrap();
        assert_eq!(id.semantic, SemanticType::Int);
        assert!(id.autoincrement);
        assert_eq!(id.pg_type, "integer");
        let name = table.column("name").unwrap();
        assert_eq!(name.name, "FallbackName");
        assert_eq!(name.ddl_type, "varchar(255)");
        assert!(name.required_on_create());
        let kind = table.column("kind").unwrap();
        assert_eq!(kind.semantic, SemanticType::Enum);
        assert_eq!(kind.enum_values, vec!["Gift", "Discount"]);
        let active = table.column("active").unwrap();
        assert_eq!(active.default, Some(ColumnDefault::Literal("true".into())));
        assert!(!active.required_on_create());
    }

    #[test]
    fn uninferable_type_is_fatal() {
        match resolve(&config("tsvector")) {
            Err(ConfigError::UnknownType { column, type_name, .. }) => {
                assert_eq!(column, "kind");
                assert_eq!(type_name, "tsvector");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn loads_from_directory_without_enums() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tables.json"),
            r#"[{"name": "notes", "columns": [{"key": "id", "type": "bigserial", "primary_key": true}]}]"#,
        )
        .unwrap();
        let config = load_from_dir(dir.path()).await.unwrap();
        assert!(config.enums.is_empty());
        let catalog = resolve(&config).unwrap();
        assert!(catalog.table("NOTES").is_some());
    }

    #[tokio::test]
    async fn missing_tables_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_from_dir(dir.path()).await, Err(ConfigError::Load(_))));
    }
}
