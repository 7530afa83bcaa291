use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;
use std::fmt;
use tokio_postgres::Row;

/// One column value converted from the driver's typed representation.
///
/// `Display` renders the flat text form used when exporting rows: NULL is
/// empty, dates at midnight drop the time part and binary is `\x` hex.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Numeric(Decimal),
    Timestamp(NaiveDateTime),
    Boolean(bool),
    Binary(Vec<u8>),
    /// A type with no text decoding, identified by its type name
    Unsupported(String),
}

impl CellValue {
    /// Decode column `idx` of `row` according to its PostgreSQL type.
    pub fn from_row(row: &Row, idx: usize) -> CellValue {
        let type_name = row.columns()[idx].type_().name().to_string();

        let decoded = match type_name.as_str() {
            "bool" => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(CellValue::Boolean)),
            "int2" => row
                .try_get::<_, Option<i16>>(idx)
                .map(|v| v.map(|n| CellValue::Integer(n.into()))),
            "int4" => row
                .try_get::<_, Option<i32>>(idx)
                .map(|v| v.map(|n| CellValue::Integer(n.into()))),
            "int8" => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(CellValue::Integer)),
            "oid" => row
                .try_get::<_, Option<u32>>(idx)
                .map(|v| v.map(|n| CellValue::Integer(n.into()))),
            "float4" => row
                .try_get::<_, Option<f32>>(idx)
                .map(|v| v.map(|n| CellValue::Float(n.into()))),
            "float8" => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(CellValue::Float)),
            "numeric" => row
                .try_get::<_, Option<Decimal>>(idx)
                .map(|v| v.map(CellValue::Numeric)),
            "date" => row
                .try_get::<_, Option<NaiveDate>>(idx)
                .map(|v| v.map(|d| CellValue::Timestamp(d.and_time(NaiveTime::MIN)))),
            "timestamp" => row
                .try_get::<_, Option<NaiveDateTime>>(idx)
                .map(|v| v.map(CellValue::Timestamp)),
            "timestamptz" => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)
                .map(|v| v.map(|t| CellValue::Timestamp(t.naive_utc()))),
            "bytea" => row
                .try_get::<_, Option<Vec<u8>>>(idx)
                .map(|v| v.map(CellValue::Binary)),
            "json" | "jsonb" => row
                .try_get::<_, Option<serde_json::Value>>(idx)
                .map(|v| v.map(|j| CellValue::Text(j.to_string()))),
            "uuid" => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .map(|v| v.map(|u| CellValue::Text(u.to_string()))),
            _ => row
                .try_get::<_, Option<String>>(idx)
                .map(|v| v.map(CellValue::Text)),
        };

        match decoded {
            Ok(Some(value)) => value,
            Ok(None) => CellValue::Null,
            Err(e) => {
                tracing::debug!("No decoding for column {} of type {}: {}", idx, type_name, e);
                CellValue::Unsupported(type_name)
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Integer(n) => write!(f, "{}", n),
            CellValue::Float(n) => write!(f, "{}", n),
            CellValue::Numeric(d) => write!(f, "{}", d),
            CellValue::Timestamp(t) => {
                if t.num_seconds_from_midnight() == 0 && t.nanosecond() == 0 {
                    write!(f, "{}", t.format("%Y-%m-%d"))
                } else {
                    write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S"))
                }
            }
            CellValue::Boolean(b) => write!(f, "{}", b),
            CellValue::Binary(bytes) => write!(f, "\\x{}", data_encoding::HEXLOWER.encode(bytes)),
            CellValue::Unsupported(type_name) => write!(f, "<{}>", type_name),
        }
    }
}
