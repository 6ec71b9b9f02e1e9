//! Multi-valued query-string model.

use crate::error::AppError;

pub const FIELD: &str = "field";
pub const LIMIT: &str = "limit";
pub const OFFSET: &str = "offset";
pub const OPTION: &str = "option";
const ASCENDING: [&str; 2] = ["asc", "ascending"];
const DESCENDING: [&str; 2] = ["desc", "descending"];

/// Keys that never name a column filter.
pub fn is_control_key(key: &str) -> bool {
    matches!(key, FIELD | LIMIT | OFFSET | OPTION) || ASCENDING.contains(&key) || DESCENDING.contains(&key)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub path: String,
    pub descending: bool,
}

/// Query parameters with lowercased keys and values, in request order.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        QueryParams {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.trim().to_lowercase(), v.to_lowercase()))
                .collect(),
        }
    }

    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn last<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        self.values(key).last()
    }

    /// Non-control keys with all their values, grouped by key in first-appearance order.
    pub fn filters(&self) -> Vec<(&str, Vec<&str>)> {
        let mut out: Vec<(&str, Vec<&str>)> = Vec::new();
        for (k, v) in &self.pairs {
            if is_control_key(k) {
                continue;
            }
            match out.iter_mut().find(|(key, _)| *key == k.as_str()) {
                Some((_, values)) => values.push(v.as_str()),
                None => out.push((k.as_str(), vec![v.as_str()])),
            }
        }
        out
    }

    pub fn fields(&self) -> Vec<&str> {
        self.values(FIELD).filter(|v| !v.is_empty()).collect()
    }

    pub fn limit(&self) -> Result<Option<u64>, AppError> {
        parse_count(self.last(LIMIT), "Limit is invalid.")
    }

    pub fn offset(&self) -> Result<Option<u64>, AppError> {
        parse_count(self.last(OFFSET), "Offset is invalid.")
    }

    /// Ordering keys in the order the client listed them.
    pub fn ordering(&self) -> Vec<OrderBy> {
        self.pairs
            .iter()
            .filter_map(|(k, v)| {
                let descending = if ASCENDING.contains(&k.as_str()) {
                    false
                } else if DESCENDING.contains(&k.as_str()) {
                    true
                } else {
                    return None;
                };
                Some(OrderBy {
                    path: v.clone(),
                    descending,
                })
            })
            .collect()
    }

    pub fn option(&self) -> Option<&str> {
        self.last(OPTION).filter(|v| !v.is_empty())
    }
}

fn parse_count(raw: Option<&str>, message: &str) -> Result<Option<u64>, AppError> {
    match raw {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| AppError::BadRequest(message.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        QueryParams::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn groups_filters_and_skips_control_keys() {
        let p = params(&[
            ("Status", "Open"),
            ("limit", "10"),
            ("name", "x"),
            ("status", "pending"),
            ("desc", "id"),
        ]);
        assert_eq!(p.filters(), vec![("status", vec!["open", "pending"]), ("name", vec!["x"])]);
        assert_eq!(p.limit().unwrap(), Some(10));
        assert_eq!(
            p.ordering(),
            vec![OrderBy {
                path: "id".into(),
                descending: true
            }]
        );
    }

    #[test]
    fn invalid_pagination_is_a_client_error() {
        let err = params(&[("limit", "ten")]).limit().unwrap_err();
        assert_eq!(err.to_string(), "bad request: Limit is invalid.");
        let err = params(&[("offset", "-1")]).offset().unwrap_err();
        assert_eq!(err.kind(), "bad_request");
    }

    #[test]
    fn ordering_keeps_listed_order() {
        let p = params(&[("asc", "name"), ("descending", "id"), ("ascending", "active")]);
        let keys: Vec<_> = p.ordering().into_iter().map(|o| (o.path, o.descending)).collect();
        assert_eq!(
            keys,
            vec![("name".into(), false), ("id".into(), true), ("active".into(), false)]
        );
    }
}
