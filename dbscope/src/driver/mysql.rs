//! MySQL driver built on mysql_async
//!
//! The connection API of this crate is blocking, so every call is driven to
//! completion on a small process-wide tokio runtime. Don't use this driver
//! from inside another tokio runtime's worker threads.

use std::sync::{Arc, OnceLock};

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Value as MySqlValue};
use tokio::runtime::{Builder, Runtime};

use super::{Credentials, Driver, NativeConnection};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::traits::IsolationLevel;
use crate::value::Value;

/// Canonical identity of the MySQL driver.
pub const IDENTITY: &str = "mysql";

fn runtime() -> Result<&'static Runtime> {
    static RUNTIME: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("dbscope-mysql")
                .enable_all()
                .build()
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| Error::Driver(format!("couldn't start the MySQL runtime: {e}")))
}

/// Opens mysql_async connections from `mysql://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDriver;

impl Driver for MySqlDriver {
    fn connect(&self, url: &str, credentials: Option<&Credentials>) -> Result<Box<dyn NativeConnection>> {
        let opts = Opts::from_url(url).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let mut builder = OptsBuilder::from_opts(opts);
        if let Some(credentials) = credentials {
            builder = builder
                .user(Some(credentials.user.as_str()))
                .pass(Some(credentials.password.as_str()));
        }
        let conn = runtime()?.block_on(Conn::new(builder))?;
        Ok(Box::new(MySqlConnection { conn: Some(conn) }))
    }
}

/// A mysql_async connection driven on the shared runtime.
pub struct MySqlConnection {
    conn: Option<Conn>,
}

impl MySqlConnection {
    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    fn run(&mut self, sql: &str) -> Result<()> {
        let rt = runtime()?;
        let conn = self.conn()?;
        rt.block_on(conn.query_drop(sql))?;
        Ok(())
    }
}

impl NativeConnection for MySqlConnection {
    fn driver_name(&mut self) -> Result<String> {
        let rt = runtime()?;
        let conn = self.conn()?;
        let version: Option<String> = rt.block_on(conn.query_first("SELECT VERSION()"))?;
        Ok(match version {
            Some(v) if v.contains("MariaDB") => "MariaDB".to_string(),
            _ => "MySQL".to_string(),
        })
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let rt = runtime()?;
        let conn = self.conn()?;
        let params: Vec<MySqlValue> = params.iter().map(to_mysql_value).collect();
        rt.block_on(conn.exec_drop(sql, params))?;
        Ok(conn.affected_rows())
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        sink: &mut dyn FnMut(&Row) -> Result<bool>,
    ) -> Result<()> {
        let rt = runtime()?;
        let conn = self.conn()?;
        let params: Vec<MySqlValue> = params.iter().map(to_mysql_value).collect();
        rt.block_on(async move {
            let mut result = conn.exec_iter(sql, params).await?;
            let mut columns: Option<Arc<[String]>> = None;
            while let Some(row) = result.next().await? {
                let names = columns
                    .get_or_insert_with(|| {
                        row.columns_ref()
                            .iter()
                            .map(|c| c.name_str().into_owned())
                            .collect()
                    })
                    .clone();
                let values = (0..row.len())
                    .map(|i| row.as_ref(i).cloned().map_or(Ok(Value::Null), from_mysql_value))
                    .collect::<Result<Vec<_>>>()?;
                if !sink(&Row::new(names, values))? {
                    break;
                }
            }
            result.drop_result().await?;
            Ok::<(), Error>(())
        })
    }

    fn begin(&mut self) -> Result<()> {
        self.run("START TRANSACTION")
    }

    fn commit(&mut self) -> Result<()> {
        self.run("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.run("ROLLBACK")
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.run(&format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql()))
    }

    fn is_valid(&mut self) -> bool {
        let Ok(rt) = runtime() else { return false };
        match self.conn.as_mut() {
            Some(conn) => rt.block_on(conn.ping()).is_ok(),
            None => false,
        }
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            runtime()?.block_on(conn.disconnect())?;
        }
        Ok(())
    }
}

impl Drop for MySqlConnection {
    fn drop(&mut self) {
        // mysql_async spawns its cleanup onto the current runtime
        if let (Some(conn), Ok(rt)) = (self.conn.take(), runtime()) {
            let _guard = rt.enter();
            drop(conn);
        }
    }
}

/// Convert a dbscope Value to a mysql_async Value
fn to_mysql_value(value: &Value) -> MySqlValue {
    match value {
        Value::Null => MySqlValue::NULL,
        Value::Bool(v) => MySqlValue::from(*v),
        Value::Int(v) => MySqlValue::Int(*v),
        Value::UInt(v) => MySqlValue::UInt(*v),
        Value::Float(v) => MySqlValue::Double(*v),
        Value::Text(v) => MySqlValue::from(v.as_str()),
        Value::Bytes(v) => MySqlValue::from(v.as_slice()),
        Value::Date(v) => MySqlValue::Date(v.year() as u16, v.month() as u8, v.day() as u8, 0, 0, 0, 0),
        Value::DateTime(v) => MySqlValue::Date(
            v.year() as u16,
            v.month() as u8,
            v.day() as u8,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.and_utc().timestamp_subsec_micros(),
        ),
        Value::Time(v) => MySqlValue::Time(
            false,
            0,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.nanosecond() / 1000,
        ),
        Value::Decimal(v) => MySqlValue::from(v.to_string()),
        Value::Json(v) => MySqlValue::from(v.to_string()),
    }
}

/// Convert a mysql_async Value to a dbscope Value
fn from_mysql_value(value: MySqlValue) -> Result<Value> {
    let invalid = |expected: &'static str, actual: String| Error::TypeConversion { expected, actual };
    match value {
        MySqlValue::NULL => Ok(Value::Null),
        MySqlValue::Bytes(v) => Ok(match String::from_utf8(v) {
            Ok(s) => Value::Text(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        }),
        MySqlValue::Int(v) => Ok(Value::Int(v)),
        MySqlValue::UInt(v) => Ok(Value::from(v)),
        MySqlValue::Float(v) => Ok(Value::Float(v.into())),
        MySqlValue::Double(v) => Ok(Value::Float(v)),
        MySqlValue::Date(year, month, day, hour, min, sec, micro) => {
            let date = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into())
                .ok_or_else(|| invalid("date", format!("{year}-{month}-{day}")))?;
            if (hour, min, sec, micro) == (0, 0, 0, 0) {
                return Ok(Value::Date(date));
            }
            let time = NaiveTime::from_hms_micro_opt(hour.into(), min.into(), sec.into(), micro)
                .ok_or_else(|| invalid("time", format!("{hour}:{min}:{sec}.{micro}")))?;
            Ok(Value::DateTime(NaiveDateTime::new(date, time)))
        }
        MySqlValue::Time(negative, days, hours, mins, secs, micro) => {
            if negative || days > 0 || hours >= 24 {
                let sign = if negative { "-" } else { "" };
                let total_hours = days * 24 + u32::from(hours);
                return Err(invalid(
                    "time (00:00:00 to 23:59:59)",
                    format!("{sign}{total_hours}:{mins:02}:{secs:02}"),
                ));
            }
            NaiveTime::from_hms_micro_opt(hours.into(), mins.into(), secs.into(), micro)
                .map(Value::Time)
                .ok_or_else(|| invalid("time", format!("{hours}:{mins}:{secs}.{micro}")))
        }
    }
}
