//! Request-scoped query compilation: filters, projections, ordering and pagination.

pub mod filter;
pub mod params;
pub mod projection;

pub use filter::{split_operator, ColumnFilter, Filter, Operator, Predicate};
pub use params::{OrderBy, QueryParams};
pub use projection::{resolve_path, ColumnRef, Includes, Projection, ResolvedPath, Terminal};

use crate::catalog::{Catalog, TableDescriptor};
use crate::error::AppError;

/// Ordering on a column of the requested table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// Everything a read needs, compiled and validated before the transaction starts.
#[derive(Clone, Debug, Default)]
pub struct ReadPlan {
    pub filter: Filter,
    pub projection: Projection,
    /// Empty means primary-key order.
    pub order: Vec<Order>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl ReadPlan {
    pub fn compile(catalog: &Catalog, table: &TableDescriptor, params: &QueryParams) -> Result<Self, AppError> {
        let filter = Filter::compile(catalog, table, params)?;
        let projection = Projection::resolve(catalog, table, &params.fields())?;
        let order = params
            .ordering()
            .into_iter()
            .filter_map(|o| match table.column(&o.path) {
                Some(c) => Some(Order {
                    column: c.key.clone(),
                    descending: o.descending,
                }),
                None => {
                    tracing::warn!(table = %table.name, column = %o.path, "ignoring unknown order column");
                    None
                }
            })
            .collect();
        Ok(ReadPlan {
            filter,
            projection,
            order,
            limit: params.limit()?,
            offset: params.offset()?,
        })
    }
}
