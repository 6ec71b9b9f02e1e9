//! Config validation: referential integrity of tables, columns and relationships.

use crate::config::CatalogConfig;
use crate::error::ConfigError;
use std::collections::{HashMap, HashSet};

pub fn validate(config: &CatalogConfig) -> Result<(), ConfigError> {
    let mut enum_names = HashSet::new();
    for e in &config.enums {
        if !enum_names.insert(e.name.to_lowercase()) {
            return Err(ConfigError::Duplicate {
                kind: "enum",
                name: e.name.clone(),
            });
        }
    }

    let mut tables = HashMap::new();
    for t in &config.tables {
        if tables.insert(t.name.to_lowercase(), t).is_some() {
            return Err(ConfigError::Duplicate {
                kind: "table",
                name: t.name.clone(),
            });
        }
    }

    for t in &config.tables {
        let mut keys = HashSet::new();
        for c in &t.columns {
            if !keys.insert(c.key.to_lowercase()) {
                return Err(ConfigError::Duplicate {
                    kind: "column",
                    name: format!("{}.{}", t.name, c.key),
                });
            }
        }
        if !t.columns.iter().any(|c| c.primary_key) {
            return Err(ConfigError::MissingPrimaryKey { table: t.name.clone() });
        }
        for r in &t.relationships {
            if !keys.insert(r.key.to_lowercase()) {
                return Err(ConfigError::Duplicate {
                    kind: "relationship",
                    name: format!("{}.{}", t.name, r.key),
                });
            }
            let target = tables
                .get(&r.target.to_lowercase())
                .ok_or_else(|| ConfigError::MissingReference {
                    kind: "table",
                    id: r.target.clone(),
                })?;
            if !t.columns.iter().any(|c| c.key.eq_ignore_ascii_case(&r.local_column)) {
                return Err(ConfigError::MissingReference {
                    kind: "column",
                    id: format!("{}.{}", t.name, r.local_column),
                });
            }
            if !target.columns.iter().any(|c| c.key.eq_ignore_ascii_case(&r.remote_column)) {
                return Err(ConfigError::MissingReference {
                    kind: "column",
                    id: format!("{}.{}", target.name, r.remote_column),
                });
            }
            if let Some(back) = &r.back_populates {
                if !target.relationships.iter().any(|b| b.key.eq_ignore_ascii_case(back)) {
                    return Err(ConfigError::MissingReference {
                        kind: "relationship",
                        id: format!("{}.{}", target.name, back),
                    });
                }
            }
        }
    }

    Ok(())
}
