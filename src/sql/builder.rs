//! Builds parameterized SELECT, INSERT, UPDATE, DELETE from catalog descriptors.
//! Identifiers come from the catalog only; values are always parameters.

use crate::catalog::{Catalog, ColumnDescriptor, SemanticType, TableDescriptor};
use crate::error::AppError;
use crate::query::{ColumnFilter, Filter, Operator, Predicate};
use crate::sql::params::PgBindValue;
use crate::store::{Row, Select};
use crate::value::Scalar;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const ROOT: &str = "t0";

/// Quote identifier for PostgreSQL (safe: only from config).
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn qualified_table(table: &TableDescriptor) -> String {
    format!("{}.{}", quoted(&table.schema), quoted(&table.name))
}

fn column_ref(alias: &str, column: &ColumnDescriptor) -> String {
    format!("{}.{}", alias, quoted(&column.name))
}

/// One result column: the key it is returned under and how to decode it.
#[derive(Clone, Debug)]
pub struct Output {
    pub key: String,
    pub column: ColumnDescriptor,
}

pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
    pub outputs: Vec<Output>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn push_param(&mut self, v: PgBindValue) -> usize {
        self.params.push(v);
        self.params.len()
    }

    /// Bind `value` and return the placeholder expression typed for `column`.
    fn bind(&mut self, column: &ColumnDescriptor, value: &Scalar) -> String {
        let n = self.push_param(PgBindValue::from_scalar(value));
        match column.semantic {
            SemanticType::Duration => format!("make_interval(secs => ${}::float8)", n),
            _ => format!("${}::{}", n, column.pg_type),
        }
    }
}

/// Select-list expression that decodes without type surprises: integers widen to
/// int8, floats to float8, intervals to epoch seconds; text-like types go as text.
fn select_expr(alias: &str, column: &ColumnDescriptor) -> String {
    let col = column_ref(alias, column);
    match column.semantic {
        SemanticType::Bool | SemanticType::Date | SemanticType::DateTime => col,
        SemanticType::Int => format!("{}::int8", col),
        SemanticType::Float => format!("{}::float8", col),
        SemanticType::Duration => format!("EXTRACT(EPOCH FROM {})::float8", col),
        SemanticType::Decimal | SemanticType::String | SemanticType::Enum | SemanticType::Time => {
            format!("{}::text", col)
        }
    }
}

fn whole_row(q: &mut QueryBuf, alias: &str, table: &TableDescriptor) -> String {
    table
        .columns
        .iter()
        .map(|c| {
            q.outputs.push(Output {
                key: c.key.clone(),
                column: c.clone(),
            });
            format!("{} AS {}", select_expr(alias, c), quoted(&c.key))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn narrow(column: &ColumnDescriptor, value: &Value) -> Result<Scalar, AppError> {
    Scalar::from_json(column, value).map_err(|e| AppError::ValueCoercion {
        parameter: column.key.clone(),
        expected: e.expected,
        value: value.to_string(),
    })
}

/// Glob (`*`, `?`) to a LIKE pattern with `\` as the escape character.
fn like_pattern(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len());
    for c in glob.chars() {
        match c {
            '\\' | '%' | '_' => {
                out.push('\\');
                out.push(c);
            }
            '*' => out.push('%'),
            '?' => out.push('_'),
            c => out.push(c),
        }
    }
    out
}

fn comparison(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "=",
        Operator::Ne => "<>",
        Operator::Gt => ">",
        Operator::Ge => ">=",
        Operator::Lt => "<",
        Operator::Le => "<=",
        Operator::TextMatch | Operator::Contains => "=",
    }
}

fn predicate_sql(q: &mut QueryBuf, alias: &str, column: &ColumnDescriptor, p: &Predicate) -> String {
    let col = column_ref(alias, column);
    if p.value.is_null() {
        return match p.op {
            Operator::Ne => format!("{} IS NOT NULL", col),
            _ => format!("{} IS NULL", col),
        };
    }
    if column.semantic.is_textual() {
        let lhs = format!("lower({}::text)", col);
        return match (p.op, &p.value) {
            (Operator::TextMatch, Scalar::Text(glob)) => {
                let n = q.push_param(PgBindValue::String(like_pattern(glob)));
                format!("{} LIKE lower(${}::text) ESCAPE '\\'", lhs, n)
            }
            (Operator::Contains, value) => {
                let n = q.push_param(PgBindValue::from_scalar(value));
                format!("position(lower(${}::text) in {}) > 0", n, lhs)
            }
            (op, value) => {
                let n = q.push_param(PgBindValue::from_scalar(value));
                format!("{} {} lower(${}::text)", lhs, comparison(op), n)
            }
        };
    }
    let rhs = q.bind(column, &p.value);
    format!("{} {} {}", col, comparison(p.op), rhs)
}

fn group_sql(q: &mut QueryBuf, alias: &str, column: &ColumnDescriptor, group: &ColumnFilter) -> String {
    let parts: Vec<String> = group
        .predicates
        .iter()
        .map(|p| predicate_sql(q, alias, column, p))
        .collect();
    parts.join(" OR ")
}

/// OR of all groups. Groups behind relationships become EXISTS subqueries.
fn filter_sql(
    q: &mut QueryBuf,
    catalog: &Catalog,
    table: &TableDescriptor,
    filter: &Filter,
) -> Result<Option<String>, AppError> {
    let mut parts = Vec::with_capacity(filter.groups.len());
    for (g, group) in filter.groups.iter().enumerate() {
        if group.chain.is_empty() {
            let column = table.expect_column(&group.column)?;
            parts.push(group_sql(q, ROOT, column, group));
            continue;
        }
        let hops = catalog.follow(table, &group.chain)?;
        let mut from = Vec::with_capacity(hops.len());
        let mut link = String::new();
        let mut parent_alias = ROOT.to_string();
        let mut parent = table;
        for (i, (rel, target)) in hops.iter().enumerate() {
            let alias = format!("f{}_{}", g, i + 1);
            let on = format!(
                "{} = {}",
                column_ref(&alias, target.expect_column(&rel.remote_column)?),
                column_ref(&parent_alias, parent.expect_column(&rel.local_column)?)
            );
            if i == 0 {
                from.push(format!("{} AS {}", qualified_table(target), alias));
                link = on;
            } else {
                from.push(format!("JOIN {} AS {} ON {}", qualified_table(target), alias, on));
            }
            parent_alias = alias;
            parent = target;
        }
        let column = parent.expect_column(&group.column)?;
        let condition = group_sql(q, &parent_alias, column, group);
        parts.push(format!(
            "EXISTS (SELECT 1 FROM {} WHERE {} AND ({}))",
            from.join(" "),
            link,
            condition
        ));
    }
    Ok(match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(parts.iter().map(|p| format!("({})", p)).collect::<Vec<_>>().join(" OR ")),
    })
}

fn key_condition(q: &mut QueryBuf, table: &TableDescriptor, key: &Row) -> Result<String, AppError> {
    let mut parts = Vec::new();
    for c in table.primary_key() {
        let value = key
            .get(&c.key)
            .ok_or_else(|| AppError::Internal(format!("primary key {}.{} missing", table.name, c.key)))?;
        let rhs = q.bind(c, &narrow(c, value)?);
        parts.push(format!("{} = {}", column_ref(ROOT, c), rhs));
    }
    Ok(parts.join(" AND "))
}

/// SELECT with optional column projection (LEFT JOINs along relationships),
/// filter, restriction, ordering (primary key by default) and pagination.
pub fn select(catalog: &Catalog, query: &Select<'_>) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let table = query.table;

    let mut joins = Vec::new();
    let list = if query.columns.is_empty() {
        whole_row(&mut q, ROOT, table)
    } else {
        let mut prefixes: BTreeSet<Vec<String>> = BTreeSet::new();
        for c in query.columns {
            for n in 1..=c.chain.len() {
                prefixes.insert(c.chain[..n].to_vec());
            }
        }
        let mut aliases: BTreeMap<Vec<String>, (String, &TableDescriptor)> = BTreeMap::new();
        aliases.insert(Vec::new(), (ROOT.to_string(), table));
        for (i, prefix) in prefixes.iter().enumerate() {
            let (parent_chain, last) = prefix.split_at(prefix.len() - 1);
            let (parent_alias, parent) = aliases
                .get(parent_chain)
                .cloned()
                .ok_or_else(|| AppError::Internal("join prefix out of order".into()))?;
            let rel = parent.relationship(&last[0]).ok_or_else(|| {
                AppError::Internal(format!("relationship {}.{} missing from catalog", parent.name, last[0]))
            })?;
            let target = catalog.target_of(rel)?;
            let alias = format!("j{}", i + 1);
            joins.push(format!(
                " LEFT JOIN {} AS {} ON {} = {}",
                qualified_table(target),
                alias,
                column_ref(&alias, target.expect_column(&rel.remote_column)?),
                column_ref(&parent_alias, parent.expect_column(&rel.local_column)?)
            ));
            aliases.insert(prefix.clone(), (alias, target));
        }
        let mut items = Vec::with_capacity(query.columns.len());
        for c in query.columns {
            let (alias, owner) = aliases
                .get(&c.chain)
                .ok_or_else(|| AppError::Internal(format!("no join for {}", c.path)))?;
            let column = owner.expect_column(&c.column)?;
            q.outputs.push(Output {
                key: c.path.clone(),
                column: column.clone(),
            });
            items.push(format!("{} AS {}", select_expr(alias, column), quoted(&c.path)));
        }
        items.join(", ")
    };

    let mut conditions = Vec::new();
    if let Some(r) = &query.restrict {
        let column = table.expect_column(r.column)?;
        if r.values.is_empty() {
            conditions.push("1 = 0".to_string());
        } else {
            let mut placeholders = Vec::with_capacity(r.values.len());
            for v in r.values {
                placeholders.push(q.bind(column, &narrow(column, v)?));
            }
            conditions.push(format!("{} IN ({})", column_ref(ROOT, column), placeholders.join(", ")));
        }
    }
    if let Some(cond) = filter_sql(&mut q, catalog, table, query.filter)? {
        conditions.push(if conditions.is_empty() { cond } else { format!("({})", cond) });
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let order: Vec<String> = if query.order.is_empty() {
        table
            .primary_key()
            .map(|c| format!("{} ASC", column_ref(ROOT, c)))
            .collect()
    } else {
        let mut order = Vec::with_capacity(query.order.len());
        for o in query.order {
            let c = table.expect_column(&o.column)?;
            order.push(format!(
                "{} {}",
                column_ref(ROOT, c),
                if o.descending { "DESC" } else { "ASC" }
            ));
        }
        order
    };
    let limit_clause = query.limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
    let offset_clause = query.offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();
    let lock_clause = if query.lock { format!(" FOR UPDATE OF {}", ROOT) } else { String::new() };

    q.sql = format!(
        "SELECT {} FROM {} AS {}{}{} ORDER BY {}{}{}{}",
        list,
        qualified_table(table),
        ROOT,
        joins.concat(),
        where_clause,
        order.join(", "),
        limit_clause,
        offset_clause,
        lock_clause
    );
    Ok(q)
}

/// `count(*)` over the select, including its pagination.
pub fn count(catalog: &Catalog, query: &Select<'_>) -> Result<QueryBuf, AppError> {
    let inner = select(catalog, &Select { lock: false, ..*query })?;
    Ok(QueryBuf {
        sql: format!("SELECT count(*) AS \"count\" FROM ({}) AS counted", inner.sql),
        params: inner.params,
        outputs: Vec::new(),
    })
}

/// INSERT of the given columns; absent columns take their database defaults.
pub fn insert(table: &TableDescriptor, values: &Row) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for c in &table.columns {
        let Some(v) = values.get(&c.key) else { continue };
        if v.is_null() && c.autoincrement {
            continue;
        }
        let ph = q.bind(c, &narrow(c, v)?);
        cols.push(quoted(&c.name));
        placeholders.push(ph);
    }
    let returning = whole_row(&mut q, ROOT, table);
    q.sql = if cols.is_empty() {
        format!(
            "INSERT INTO {} AS {} DEFAULT VALUES RETURNING {}",
            qualified_table(table),
            ROOT,
            returning
        )
    } else {
        format!(
            "INSERT INTO {} AS {} ({}) VALUES ({}) RETURNING {}",
            qualified_table(table),
            ROOT,
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    Ok(q)
}

/// SELECT one row by primary key, locked for update.
pub fn select_by_key(table: &TableDescriptor, key: &Row) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let list = whole_row(&mut q, ROOT, table);
    let condition = key_condition(&mut q, table, key)?;
    q.sql = format!(
        "SELECT {} FROM {} AS {} WHERE {} FOR UPDATE",
        list,
        qualified_table(table),
        ROOT,
        condition
    );
    Ok(q)
}

/// UPDATE by primary key: SET only the given columns.
pub fn update_by_key(table: &TableDescriptor, key: &Row, values: &Row) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for (k, v) in values {
        let c = table.expect_column(k)?;
        let rhs = q.bind(c, &narrow(c, v)?);
        sets.push(format!("{} = {}", quoted(&c.name), rhs));
    }
    if sets.is_empty() {
        return select_by_key(table, key);
    }
    let condition = key_condition(&mut q, table, key)?;
    let returning = whole_row(&mut q, ROOT, table);
    q.sql = format!(
        "UPDATE {} AS {} SET {} WHERE {} RETURNING {}",
        qualified_table(table),
        ROOT,
        sets.join(", "),
        condition,
        returning
    );
    Ok(q)
}

/// DELETE of every row matching the filter (all rows when empty), returning them.
pub fn delete_where(catalog: &Catalog, table: &TableDescriptor, filter: &Filter) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let where_clause = filter_sql(&mut q, catalog, table, filter)?
        .map(|c| format!(" WHERE {}", c))
        .unwrap_or_default();
    let returning = whole_row(&mut q, ROOT, table);
    q.sql = format!(
        "DELETE FROM {} AS {}{} RETURNING {}",
        qualified_table(table),
        ROOT,
        where_clause,
        returning
    );
    Ok(q)
}
