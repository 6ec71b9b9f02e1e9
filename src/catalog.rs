//! Schema catalog: immutable table, column and relationship descriptors built once at startup.

use crate::config::ColumnDefaultConfig;
use crate::error::AppError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Semantic type of a column, used to coerce literals and narrow body values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Bool,
    Int,
    Float,
    Decimal,
    String,
    Date,
    Time,
    DateTime,
    Duration,
    Enum,
}

impl SemanticType {
    pub fn describe(&self) -> &'static str {
        match self {
            SemanticType::Bool => "boolean",
            SemanticType::Int => "integer",
            SemanticType::Float => "float",
            SemanticType::Decimal => "decimal",
            SemanticType::String => "string",
            SemanticType::Date => "date",
            SemanticType::Time => "time",
            SemanticType::DateTime => "datetime",
            SemanticType::Duration => "duration",
            SemanticType::Enum => "enum",
        }
    }

    /// Text-like types compare case-insensitively.
    pub fn is_textual(&self) -> bool {
        matches!(self, SemanticType::String | SemanticType::Enum)
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Column default as declared in config.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnDefault {
    Literal(String),
    Expression(String),
}

impl From<&ColumnDefaultConfig> for ColumnDefault {
    fn from(c: &ColumnDefaultConfig) -> Self {
        match c {
            ColumnDefaultConfig::Literal(s) => ColumnDefault::Literal(s.clone()),
            ColumnDefaultConfig::Expression { expression } => ColumnDefault::Expression(expression.clone()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColumnDescriptor {
    /// API key.
    pub key: String,
    /// Database column name.
    pub name: String,
    pub semantic: SemanticType,
    /// Allowed values when `semantic` is `Enum`.
    pub enum_values: Vec<String>,
    pub nullable: bool,
    pub default: Option<ColumnDefault>,
    pub autoincrement: bool,
    pub primary_key: bool,
    /// PostgreSQL type used for casts when binding (e.g. "timestamptz", "public.status").
    pub pg_type: String,
    /// Full DDL type (e.g. "varchar(255)").
    pub ddl_type: String,
}

impl ColumnDescriptor {
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// No default, not nullable, not autogenerated.
    pub fn required_on_create(&self) -> bool {
        !self.has_default() && !self.nullable && !self.autoincrement
    }

    pub fn expected(&self) -> String {
        match self.semantic {
            SemanticType::Enum => format!("one of {}", self.enum_values.join(", ")),
            other => other.describe().to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone, Debug)]
pub struct RelationshipDescriptor {
    pub key: String,
    /// Name of the target table in the catalog.
    pub target: String,
    pub cardinality: Cardinality,
    pub local_column: String,
    pub remote_column: String,
    pub back_populates: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TableDescriptor {
    pub name: String,
    pub schema: String,
    pub columns: Vec<ColumnDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
    /// Whether relationships may be traversed (an entity mapping exists).
    pub mapped: bool,
}

impl TableDescriptor {
    pub fn column(&self, key: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.key.eq_ignore_ascii_case(key))
    }

    pub fn relationship(&self, key: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.key.eq_ignore_ascii_case(key))
    }

    pub fn primary_key(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// Column lookup for keys already validated against this table.
    pub fn expect_column(&self, key: &str) -> Result<&ColumnDescriptor, AppError> {
        self.column(key)
            .ok_or_else(|| AppError::Internal(format!("column {}.{} missing from catalog", self.name, key)))
    }
}

/// Read-only index from route name to table descriptor.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    tables: Vec<TableDescriptor>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(tables: Vec<TableDescriptor>) -> Self {
        let by_name = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.to_lowercase(), i))
            .collect();
        Catalog { tables, by_name }
    }

    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.by_name.get(&name.to_lowercase()).map(|&i| &self.tables[i])
    }

    /// Case-insensitive exact match of a route segment against table names.
    pub fn resolve(&self, route: &str) -> Result<&TableDescriptor, AppError> {
        self.table(route).ok_or_else(|| AppError::RouteNotFound(route.to_string()))
    }

    /// Target table of a relationship. A dangling target is a catalog inconsistency.
    pub fn target_of(&self, rel: &RelationshipDescriptor) -> Result<&TableDescriptor, AppError> {
        self.table(&rel.target).ok_or_else(|| {
            AppError::Internal(format!("Could not infer type for relationship: {}", rel.key))
        })
    }

    /// Walk an already-resolved relationship chain from `from`.
    pub fn follow<'c>(
        &'c self,
        from: &'c TableDescriptor,
        chain: &[String],
    ) -> Result<Vec<(&'c RelationshipDescriptor, &'c TableDescriptor)>, AppError> {
        let mut out = Vec::with_capacity(chain.len());
        let mut current = from;
        for key in chain {
            let rel = current.relationship(key).ok_or_else(|| {
                AppError::Internal(format!("relationship {}.{} missing from catalog", current.name, key))
            })?;
            let target = self.target_of(rel)?;
            out.push((rel, target));
            current = target;
        }
        Ok(out)
    }
}
