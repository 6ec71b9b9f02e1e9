//! Convert typed scalars to values that sqlx can bind.

use crate::value::Scalar;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::Database;

/// A value bound to a PostgreSQL statement. Non-primitive types travel as text and
/// are cast by the statement (`$n::type`).
#[derive(Clone, Debug, PartialEq)]
pub enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

impl PgBindValue {
    pub fn from_scalar(v: &Scalar) -> Self {
        match v {
            Scalar::Null => PgBindValue::Null,
            Scalar::Bool(b) => PgBindValue::Bool(*b),
            Scalar::Int(n) => PgBindValue::I64(*n),
            Scalar::Float(f) | Scalar::Duration(f) => PgBindValue::F64(*f),
            Scalar::Decimal(d) => PgBindValue::String(d.to_string()),
            Scalar::Text(s) => PgBindValue::String(s.clone()),
            Scalar::Date(d) => PgBindValue::String(d.format("%Y-%m-%d").to_string()),
            Scalar::Time(t) => PgBindValue::String(t.format("%H:%M:%S%.f").to_string()),
            Scalar::DateTime(dt) => PgBindValue::String(dt.to_rfc3339()),
        }
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match self {
            PgBindValue::Null => IsNull::Yes,
            PgBindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf)?,
            PgBindValue::I64(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::F64(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::String(s) => {
                let s_ref: &str = s.as_str();
                <&str as Encode<Postgres>>::encode_by_ref(&s_ref, buf)?
            }
        })
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(match self {
            PgBindValue::Bool(_) => PgTypeInfo::with_name("BOOL"),
            PgBindValue::I64(_) => PgTypeInfo::with_name("INT8"),
            PgBindValue::F64(_) => PgTypeInfo::with_name("FLOAT8"),
            PgBindValue::Null | PgBindValue::String(_) => PgTypeInfo::with_name("TEXT"),
        })
    }
}

impl sqlx::Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    #[test]
    fn textual_scalars_bind_as_text() {
        assert_eq!(
            PgBindValue::from_scalar(&Scalar::Decimal(BigDecimal::from_str("1.50").unwrap())),
            PgBindValue::String("1.50".into())
        );
        assert_eq!(
            PgBindValue::from_scalar(&Scalar::Duration(90.0)),
            PgBindValue::F64(90.0)
        );
        assert_eq!(PgBindValue::from_scalar(&Scalar::Null), PgBindValue::Null);
    }
}
