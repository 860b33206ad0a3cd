//! FromValue trait for converting database values to Rust types

use crate::error::{Error, Result};
use crate::value::Value;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

/// Trait for types that can be constructed from a database value.
///
/// Conversions are lenient where drivers disagree on representation:
/// SQLite hands back dates and decimals as text and booleans as integers,
/// so those forms are accepted as well.
pub trait FromValue: Sized {
    /// Convert a database value to this type.
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::TypeConversion {
        expected,
        actual: value.type_name().to_string(),
    }
}

fn out_of_range(expected: &'static str, value: impl std::fmt::Display) -> Error {
    Error::TypeConversion {
        expected,
        actual: format!("{value} out of range"),
    }
}

macro_rules! from_value_integer {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::Int(v) => <$ty>::try_from(v).map_err(|_| out_of_range(stringify!($ty), v)),
                        Value::UInt(v) => <$ty>::try_from(v).map_err(|_| out_of_range(stringify!($ty), v)),
                        Value::Bool(v) => Ok(<$ty>::from(v)),
                        Value::Text(ref s) => s
                            .trim()
                            .parse()
                            .map_err(|_| Error::TypeConversion {
                                expected: stringify!($ty),
                                actual: format!("text '{s}'"),
                            }),
                        other => Err(mismatch(stringify!($ty), &other)),
                    }
                }
            }
        )*
    };
}

from_value_integer!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(v),
            Value::Int(v) => Ok(v != 0),
            Value::UInt(v) => Ok(v != 0),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            Value::Decimal(v) => v
                .to_string()
                .parse()
                .map_err(|_| out_of_range("f64", v)),
            other => Err(mismatch("f64", &other)),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(v) => Ok(v),
            Value::Bytes(v) => String::from_utf8(v).map_err(|e| Error::TypeConversion {
                expected: "utf8 string",
                actual: format!("invalid utf8: {e}"),
            }),
            Value::Decimal(v) => Ok(v.to_string()),
            Value::Json(v) => Ok(v.to_string()),
            other => Err(mismatch("string", &other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(v) => Ok(v),
            Value::Text(v) => Ok(v.into_bytes()),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

fn parse_text<T: ParseWithFormat>(expected: &'static str, text: &str, formats: &[&str]) -> Result<T> {
    formats
        .iter()
        .find_map(|format| T::parse_with(text, format))
        .ok_or_else(|| Error::TypeConversion {
            expected,
            actual: format!("text '{text}'"),
        })
}

trait ParseWithFormat: Sized {
    fn parse_with(text: &str, format: &str) -> Option<Self>;
}

impl ParseWithFormat for NaiveDate {
    fn parse_with(text: &str, format: &str) -> Option<Self> {
        NaiveDate::parse_from_str(text, format).ok()
    }
}

impl ParseWithFormat for NaiveDateTime {
    fn parse_with(text: &str, format: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(text, format).ok()
    }
}

impl ParseWithFormat for NaiveTime {
    fn parse_with(text: &str, format: &str) -> Option<Self> {
        NaiveTime::parse_from_str(text, format).ok()
    }
}

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

impl FromValue for NaiveDate {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Date(v) => Ok(v),
            Value::DateTime(v) => Ok(v.date()),
            Value::Text(ref s) => parse_text("date", s, &["%Y-%m-%d"]),
            other => Err(mismatch("date", &other)),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::DateTime(v) => Ok(v),
            Value::Date(v) => Ok(v.and_time(NaiveTime::MIN)),
            Value::Text(ref s) => parse_text("datetime", s, DATETIME_FORMATS),
            other => Err(mismatch("datetime", &other)),
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Time(v) => Ok(v),
            Value::DateTime(v) => Ok(v.time()),
            Value::Text(ref s) => parse_text("time", s, &["%H:%M:%S%.f"]),
            other => Err(mismatch("time", &other)),
        }
    }
}

impl FromValue for Decimal {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Decimal(v) => Ok(v),
            Value::Int(v) => Ok(Decimal::from(v)),
            Value::UInt(v) => Ok(Decimal::from(v)),
            Value::Float(v) => Decimal::try_from(v).map_err(|_| out_of_range("decimal", v)),
            Value::Text(v) => v.trim().parse().map_err(|_| Error::TypeConversion {
                expected: "decimal",
                actual: format!("invalid decimal string: {v}"),
            }),
            other => Err(mismatch("decimal", &other)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v),
            Value::Text(v) => serde_json::from_str(&v).map_err(|e| Error::TypeConversion {
                expected: "json",
                actual: format!("invalid json: {e}"),
            }),
            other => Err(mismatch("json", &other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}
