//! Raw catalog config types, as read from `tables.json` / `enums.json`.

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnumConfig {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// PostgreSQL schema; defaults to `public`.
    #[serde(default)]
    pub schema: Option<String>,
    /// Unmapped tables serve plain rows and refuse relationship traversal.
    #[serde(default = "default_true")]
    pub mapped: bool,
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnTypeConfig {
    Simple(String),
    Parameterized { name: String, params: Option<Vec<u32>> },
}

impl ColumnTypeConfig {
    pub fn base_name(&self) -> &str {
        match self {
            ColumnTypeConfig::Simple(s) => s.as_str(),
            ColumnTypeConfig::Parameterized { name, .. } => name.as_str(),
        }
    }

    /// Full DDL spelling, e.g. `varchar(255)`.
    pub fn ddl(&self) -> String {
        match self {
            ColumnTypeConfig::Simple(s) => s.clone(),
            ColumnTypeConfig::Parameterized { name, params } => {
                let p = params
                    .as_ref()
                    .map(|v| v.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                if p.is_empty() {
                    name.clone()
                } else {
                    format!("{}({})", name, p)
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ColumnDefaultConfig {
    Literal(String),
    Expression { expression: String },
}

impl<'de> Deserialize<'de> for ColumnDefaultConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = serde_json::Value::deserialize(deserializer)?;
        match v {
            serde_json::Value::String(s) => Ok(ColumnDefaultConfig::Literal(s)),
            serde_json::Value::Bool(b) => Ok(ColumnDefaultConfig::Literal(b.to_string())),
            serde_json::Value::Number(n) => Ok(ColumnDefaultConfig::Literal(n.to_string())),
            serde_json::Value::Object(mut obj) => {
                if let Some(serde_json::Value::String(s)) = obj.remove("expression") {
                    return Ok(ColumnDefaultConfig::Expression { expression: s });
                }
                if let Some(serde_json::Value::String(s)) = obj.remove("value").or_else(|| obj.remove("literal")) {
                    return Ok(ColumnDefaultConfig::Literal(s));
                }
                Err(serde::de::Error::custom(format!(
                    "column default must be a literal, {{ \"expression\": \"...\" }}, or {{ \"value\": \"...\" }}; got object with keys: {:?}",
                    obj.keys().collect::<Vec<_>>()
                )))
            }
            other => Err(serde::de::Error::custom(format!(
                "column default must be a literal or {{ \"expression\": \"...\" }}; got {}",
                type_name_of_json(&other)
            ))),
        }
    }
}

fn type_name_of_json(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// API key used in query strings and bodies.
    pub key: String,
    /// Database column name; defaults to `key`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub type_: ColumnTypeConfig,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<ColumnDefaultConfig>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub autoincrement: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardinalityConfig {
    One,
    Many,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub key: String,
    /// Target table name.
    pub target: String,
    pub cardinality: CardinalityConfig,
    /// Column key on this table used in the join.
    pub local_column: String,
    /// Column key on the target table used in the join.
    pub remote_column: String,
    /// Relationship key on the target that points back here.
    #[serde(default)]
    pub back_populates: Option<String>,
}

/// All catalog config in one struct for in-memory loading.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub enums: Vec<EnumConfig>,
    pub tables: Vec<TableConfig>,
}
