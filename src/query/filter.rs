//! Filter compiler: query parameters to typed, column-scoped predicates.
//!
//! Predicates on one column are OR'd, and distinct columns are OR'd as well.
//! The same predicates are evaluated in SQL by the store and in-process against
//! row images by the change notifier.

use crate::catalog::{Catalog, ColumnDescriptor, SemanticType, TableDescriptor};
use crate::error::AppError;
use crate::query::params::QueryParams;
use crate::query::projection::{resolve_path, Terminal};
use crate::value::Scalar;
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    TextMatch,
    Contains,
}

/// Tokens in the order they are tried. `=` is last and also the default.
const TOKENS: [(&str, Operator); 8] = [
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    (">", Operator::Gt),
    ("<", Operator::Lt),
    ("!", Operator::Ne),
    ("~", Operator::TextMatch),
    ("@", Operator::Contains),
    ("=", Operator::Eq),
];

impl Operator {
    pub fn token(&self) -> &'static str {
        TOKENS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(t, _)| *t)
            .unwrap_or("=")
    }

    fn is_textual(&self) -> bool {
        matches!(self, Operator::TextMatch | Operator::Contains)
    }
}

/// Strip the first matching operator token; prefix is checked before suffix.
pub fn split_operator(raw: &str) -> (Operator, &str) {
    for (token, op) in TOKENS {
        if let Some(rest) = raw.strip_prefix(token) {
            return (op, rest);
        }
        if let Some(rest) = raw.strip_suffix(token) {
            return (op, rest);
        }
    }
    (Operator::Eq, raw)
}

#[derive(Clone, Debug)]
pub struct Predicate {
    pub op: Operator,
    pub value: Scalar,
    pattern: Option<Regex>,
}

impl Predicate {
    pub fn new(op: Operator, value: Scalar) -> Self {
        let pattern = match (&op, &value) {
            (Operator::TextMatch, Scalar::Text(glob)) => glob_regex(glob),
            _ => None,
        };
        Predicate { op, value, pattern }
    }

    /// SQL semantics: a NULL operand only matches `=`/`!` against NULL literals.
    pub fn eval(&self, actual: &Scalar) -> bool {
        if self.value.is_null() {
            return match self.op {
                Operator::Eq => actual.is_null(),
                Operator::Ne => !actual.is_null(),
                _ => false,
            };
        }
        if actual.is_null() {
            return false;
        }
        match self.op {
            Operator::TextMatch => match (actual, &self.pattern) {
                (Scalar::Text(s), Some(re)) => re.is_match(s),
                _ => false,
            },
            Operator::Contains => match (actual, &self.value) {
                (Scalar::Text(s), Scalar::Text(needle)) => s.to_lowercase().contains(&needle.to_lowercase()),
                _ => false,
            },
            op => match actual.compare(&self.value) {
                Some(ord) => match op {
                    Operator::Eq => ord == Ordering::Equal,
                    Operator::Ne => ord != Ordering::Equal,
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Ge => ord != Ordering::Less,
                    Operator::Lt => ord == Ordering::Less,
                    Operator::Le => ord != Ordering::Greater,
                    Operator::TextMatch | Operator::Contains => false,
                },
                None => false,
            },
        }
    }
}

/// Case-insensitive whole-value glob: `*` any run, `?` one character.
fn glob_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::from("(?is)^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

/// All predicates on one column reached through `chain`.
#[derive(Clone, Debug)]
pub struct ColumnFilter {
    pub chain: Vec<String>,
    pub column: String,
    pub predicates: Vec<Predicate>,
}

impl ColumnFilter {
    /// Any predicate holds for the stored value.
    pub fn matches_value(&self, column: &ColumnDescriptor, value: Option<&Value>) -> bool {
        let actual = match value {
            None => Scalar::Null,
            Some(v) => match Scalar::from_json(column, v) {
                Ok(s) => s,
                Err(_) => return false,
            },
        };
        self.predicates.iter().any(|p| p.eval(&actual))
    }
}

/// Compiled filter; an empty filter matches every row.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub groups: Vec<ColumnFilter>,
}

impl Filter {
    /// Read filter: keys that do not resolve to a column are logged and skipped.
    pub fn compile(catalog: &Catalog, table: &TableDescriptor, params: &QueryParams) -> Result<Self, AppError> {
        Self::build(catalog, table, params, false)
    }

    /// Write filter: every key must resolve to a column, so a misspelled key
    /// never widens an update or delete to the whole table.
    pub fn compile_strict(catalog: &Catalog, table: &TableDescriptor, params: &QueryParams) -> Result<Self, AppError> {
        Self::build(catalog, table, params, true)
    }

    fn build(catalog: &Catalog, table: &TableDescriptor, params: &QueryParams, strict: bool) -> Result<Self, AppError> {
        let mut groups: Vec<ColumnFilter> = Vec::new();
        for (key, values) in params.filters() {
            let resolved = match resolve_path(catalog, table, key) {
                Ok(r) => r,
                Err(AppError::SchemaMismatch(reason)) if !strict => {
                    tracing::debug!(table = %table.name, key, %reason, "ignoring unknown filter key");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let column = match resolved.terminal {
                Terminal::Column(c) => c,
                Terminal::Relationship(rel, _) if strict => {
                    return Err(AppError::SchemaMismatch(format!(
                        "Field \"{}\" is a relationship of {} and cannot be filtered on.",
                        rel.key, resolved.table.name
                    )));
                }
                Terminal::Relationship(..) => {
                    tracing::warn!(table = %table.name, key, "filter on a relationship ignored");
                    continue;
                }
            };
            let mut predicates = Vec::with_capacity(values.len());
            for raw in values {
                predicates.push(compile_predicate(key, column, raw)?);
            }
            match groups
                .iter_mut()
                .find(|g| g.chain == resolved.chain && g.column == column.key)
            {
                Some(g) => g.predicates.extend(predicates),
                None => groups.push(ColumnFilter {
                    chain: resolved.chain,
                    column: column.key.clone(),
                    predicates,
                }),
            }
        }
        groups.sort_by(|a, b| a.chain.cmp(&b.chain));
        Ok(Filter { groups })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Every predicate is on the table's own columns.
    pub fn is_local(&self) -> bool {
        self.groups.iter().all(|g| g.chain.is_empty())
    }

    /// Deterministic, order-independent serialization of the predicate set.
    pub fn signature(&self) -> String {
        let mut by_path: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for g in &self.groups {
            let path = g
                .chain
                .iter()
                .chain(std::iter::once(&g.column))
                .cloned()
                .collect::<Vec<_>>()
                .join(".");
            let entry = by_path.entry(path).or_default();
            for p in &g.predicates {
                entry.push((p.op.token().to_string(), p.value.to_json().to_string()));
            }
        }
        for predicates in by_path.values_mut() {
            predicates.sort();
            predicates.dedup();
        }
        serde_json::to_string(&by_path).unwrap_or_default()
    }

    /// In-process evaluation against a row image of `table`. Only local groups
    /// take part; callers reject non-local filters before evaluating.
    pub fn matches(&self, table: &TableDescriptor, row: &Map<String, Value>) -> bool {
        if self.groups.is_empty() {
            return true;
        }
        self.groups.iter().filter(|g| g.chain.is_empty()).any(|g| match table.column(&g.column) {
            Some(column) => g.matches_value(column, row.get(&column.key)),
            None => false,
        })
    }
}

fn compile_predicate(key: &str, column: &ColumnDescriptor, raw: &str) -> Result<Predicate, AppError> {
    let (op, literal) = split_operator(raw);
    let coercion = |expected: String| AppError::ValueCoercion {
        parameter: key.to_string(),
        expected,
        value: raw.to_string(),
    };
    if op.is_textual() && column.semantic != SemanticType::String {
        return Err(coercion(format!("string (operator \"{}\")", op.token())));
    }
    let value = Scalar::parse_literal(column, literal).map_err(|e| coercion(e.expected))?;
    if value.is_null() && !matches!(op, Operator::Eq | Operator::Ne) {
        return Err(coercion(column.expected()));
    }
    Ok(Predicate::new(op, value))
}
