//! Typed scalar values: query literal coercion, body narrowing, comparison and wire form.

use crate::catalog::{ColumnDescriptor, SemanticType};
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(BigDecimal),
    /// Strings and enum members.
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(DateTime<Utc>),
    /// Seconds.
    Duration(f64),
}

/// The value did not fit the column; carries the expected type description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoerceError {
    pub expected: String,
}

impl CoerceError {
    fn of(column: &ColumnDescriptor) -> Self {
        CoerceError {
            expected: column.expected(),
        }
    }
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Coerce a query-string literal to the column's type.
    /// An empty literal is NULL for nullable non-string columns.
    pub fn parse_literal(column: &ColumnDescriptor, raw: &str) -> Result<Scalar, CoerceError> {
        if raw.is_empty() && column.semantic != SemanticType::String {
            return if column.nullable {
                Ok(Scalar::Null)
            } else {
                Err(CoerceError::of(column))
            };
        }
        parse_text(column, raw).ok_or_else(|| CoerceError::of(column))
    }

    /// Narrow a JSON body value (or a stored row value) to the column's type.
    pub fn from_json(column: &ColumnDescriptor, value: &Value) -> Result<Scalar, CoerceError> {
        let out = match (column.semantic, value) {
            (_, Value::Null) => Some(Scalar::Null),
            (SemanticType::Bool, Value::Bool(b)) => Some(Scalar::Bool(*b)),
            (SemanticType::Int, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Scalar::Int),
            (SemanticType::Float, Value::Number(n)) => n.as_f64().map(Scalar::Float),
            (SemanticType::Decimal, Value::Number(n)) => BigDecimal::from_str(&n.to_string()).ok().map(Scalar::Decimal),
            (SemanticType::Duration, Value::Number(n)) => n.as_f64().map(Scalar::Duration),
            (SemanticType::DateTime, Value::Number(n)) => n.as_f64().and_then(epoch_seconds).map(Scalar::DateTime),
            (SemanticType::String, Value::String(s)) => Some(Scalar::Text(s.clone())),
            (_, Value::String(s)) => parse_text(column, s),
            _ => None,
        };
        out.ok_or_else(|| CoerceError::of(column))
    }

    /// Canonical wire form.
    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(n) => Value::Number((*n).into()),
            Scalar::Float(f) | Scalar::Duration(f) => {
                serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
            }
            Scalar::Decimal(d) => Value::String(d.to_string()),
            Scalar::Text(s) => Value::String(s.clone()),
            Scalar::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Scalar::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            Scalar::DateTime(dt) => Value::String(dt.to_rfc3339()),
        }
    }

    /// Order two non-null values of the same column. Text compares case-insensitively.
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            (Scalar::Float(a), Scalar::Float(b)) | (Scalar::Duration(a), Scalar::Duration(b)) => a.partial_cmp(b),
            (Scalar::Int(a), Scalar::Float(b)) => (*a as f64).partial_cmp(b),
            (Scalar::Float(a), Scalar::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Scalar::Decimal(a), Scalar::Decimal(b)) => Some(a.cmp(b)),
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
            (Scalar::Date(a), Scalar::Date(b)) => Some(a.cmp(b)),
            (Scalar::Time(a), Scalar::Time(b)) => Some(a.cmp(b)),
            (Scalar::DateTime(a), Scalar::DateTime(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Sort order used by stores: NULL sorts after every value.
    pub fn sort_cmp(&self, other: &Scalar) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }
}

fn parse_text(column: &ColumnDescriptor, raw: &str) -> Option<Scalar> {
    let s = raw.trim();
    match column.semantic {
        SemanticType::Bool => match s.to_lowercase().as_str() {
            "true" => Some(Scalar::Bool(true)),
            "false" => Some(Scalar::Bool(false)),
            _ => None,
        },
        SemanticType::Int => s.parse().ok().map(Scalar::Int),
        SemanticType::Float => s.parse().ok().filter(|f: &f64| f.is_finite()).map(Scalar::Float),
        SemanticType::Decimal => BigDecimal::from_str(s).ok().map(Scalar::Decimal),
        SemanticType::String => Some(Scalar::Text(raw.to_string())),
        SemanticType::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(Scalar::Date),
        SemanticType::Time => parse_time(s).map(Scalar::Time),
        SemanticType::DateTime => parse_datetime(s).map(Scalar::DateTime),
        SemanticType::Duration => s.parse().ok().filter(|f: &f64| f.is_finite()).map(Scalar::Duration),
        SemanticType::Enum => column
            .enum_values
            .iter()
            .find(|v| v.eq_ignore_ascii_case(s))
            .map(|v| Scalar::Text(v.clone())),
    }
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Strict ISO-8601 subset: RFC 3339 with offset, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` read as UTC.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let upper = s.to_uppercase();
    if let Ok(dt) = DateTime::parse_from_rfc3339(&upper) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&upper, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round() as u32;
    Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(semantic: SemanticType, nullable: bool) -> ColumnDescriptor {
        ColumnDescriptor {
            key: "c".into(),
            name: "c".into(),
            semantic,
            enum_values: vec!["Open".into(), "Closed".into()],
            nullable,
            default: None,
            autoincrement: false,
            primary_key: false,
            pg_type: "text".into(),
            ddl_type: "text".into(),
        }
    }

    #[test]
    fn booleans_accept_only_true_and_false() {
        let c = column(SemanticType::Bool, false);
        assert_eq!(Scalar::parse_literal(&c, "true"), Ok(Scalar::Bool(true)));
        assert_eq!(Scalar::parse_literal(&c, "false"), Ok(Scalar::Bool(false)));
        assert!(Scalar::parse_literal(&c, "1").is_err());
        assert!(Scalar::parse_literal(&c, "yes").is_err());
    }

    #[test]
    fn empty_literal_is_null_only_when_nullable() {
        assert_eq!(
            Scalar::parse_literal(&column(SemanticType::Int, true), ""),
            Ok(Scalar::Null)
        );
        let err = Scalar::parse_literal(&column(SemanticType::Int, false), "").unwrap_err();
        assert_eq!(err.expected, "integer");
        assert_eq!(
            Scalar::parse_literal(&column(SemanticType::String, true), ""),
            Ok(Scalar::Text(String::new()))
        );
    }

    #[test]
    fn datetimes_parse_lowercased_iso_forms() {
        let c = column(SemanticType::DateTime, false);
        let a = Scalar::parse_literal(&c, "2024-03-01t10:00:00z").unwrap();
        let b = Scalar::parse_literal(&c, "2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(a, b);
        assert!(Scalar::parse_literal(&c, "2024-03-01 10:00").is_err());
        assert!(Scalar::parse_literal(&c, "yesterday").is_err());
    }

    #[test]
    fn enum_literals_resolve_to_canonical_member() {
        let c = column(SemanticType::Enum, false);
        assert_eq!(Scalar::parse_literal(&c, "open"), Ok(Scalar::Text("Open".into())));
        let err = Scalar::parse_literal(&c, "pending").unwrap_err();
        assert_eq!(err.expected, "one of Open, Closed");
    }

    #[test]
    fn body_values_are_narrowed_from_numbers_and_strings() {
        let ts = column(SemanticType::DateTime, false);
        assert_eq!(
            Scalar::from_json(&ts, &json!(0)).unwrap().to_json(),
            json!("1970-01-01T00:00:00+00:00")
        );
        let int = column(SemanticType::Int, false);
        assert_eq!(Scalar::from_json(&int, &json!("42")), Ok(Scalar::Int(42)));
        assert!(Scalar::from_json(&int, &json!(1.5)).is_err());
        let dec = column(SemanticType::Decimal, false);
        assert_eq!(Scalar::from_json(&dec, &json!(1.25)).unwrap().to_json(), json!("1.25"));
        let text = column(SemanticType::String, false);
        assert!(Scalar::from_json(&text, &json!(3)).is_err());
    }

    #[test]
    fn text_compares_case_insensitively_and_nulls_sort_last() {
        let a = Scalar::Text("Alpha".into());
        let b = Scalar::Text("alpha".into());
        assert_eq!(a.compare(&b), Some(Ordering::Equal));
        assert_eq!(Scalar::Null.sort_cmp(&Scalar::Int(1)), Ordering::Greater);
        assert_eq!(Scalar::Int(2).compare(&Scalar::Float(2.5)), Some(Ordering::Less));
    }
}
