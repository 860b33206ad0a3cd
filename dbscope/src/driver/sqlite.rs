//! SQLite driver built on rusqlite

use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, ToSql};

use super::{Credentials, Driver, NativeConnection};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::traits::IsolationLevel;
use crate::value::Value;

/// Canonical identity of the SQLite driver.
pub const IDENTITY: &str = "sqlite";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens rusqlite connections.
///
/// Accepted URLs are `sqlite::memory:`, `sqlite://path`, `sqlite:path` and a
/// bare file path. Every in-memory connection is a separate database.
/// Credentials are ignored.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    busy_timeout: Duration,
}

impl SqliteDriver {
    pub fn with_busy_timeout(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::with_busy_timeout(DEFAULT_BUSY_TIMEOUT)
    }
}

/// Where a SQLite URL points to.
#[derive(Debug, PartialEq, Eq)]
enum Location<'a> {
    Memory,
    File(&'a str),
}

fn parse_url(url: &str) -> Result<Location<'_>> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    match path {
        "" => Err(Error::InvalidArgument(format!("'{url}' doesn't name a SQLite database"))),
        ":memory:" => Ok(Location::Memory),
        path => Ok(Location::File(path)),
    }
}

impl Driver for SqliteDriver {
    fn connect(&self, url: &str, _credentials: Option<&Credentials>) -> Result<Box<dyn NativeConnection>> {
        let conn = match parse_url(url)? {
            Location::Memory => Connection::open_in_memory()?,
            Location::File(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        Ok(Box::new(SqliteConnection { conn }))
    }
}

/// A rusqlite connection.
pub struct SqliteConnection {
    conn: Connection,
}

impl NativeConnection for SqliteConnection {
    fn driver_name(&mut self) -> Result<String> {
        Ok("SQLite".to_string())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let changed = stmt.execute(params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        sink: &mut dyn FnMut(&Row) -> Result<bool>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|i| row.get_ref(i).map(from_sqlite_value))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if !sink(&Row::new(Arc::clone(&columns), values))? {
                break;
            }
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// SQLite transactions are serializable; only dirty reads can be toggled.
    fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        let read_uncommitted = matches!(level, IsolationLevel::ReadUncommitted);
        self.conn
            .pragma_update(None, "read_uncommitted", read_uncommitted)?;
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        self.conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::Sqlite(e))
    }
}

fn from_sqlite_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Bytes(v.to_vec()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let output = match self {
            Value::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Value::Bool(v) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*v))),
            Value::Int(v) => ToSqlOutput::Owned(SqliteValue::Integer(*v)),
            Value::UInt(v) => {
                let v = i64::try_from(*v)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                ToSqlOutput::Owned(SqliteValue::Integer(v))
            }
            Value::Float(v) => ToSqlOutput::Owned(SqliteValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            Value::Date(v) => ToSqlOutput::Owned(SqliteValue::Text(v.format("%Y-%m-%d").to_string())),
            Value::DateTime(v) => {
                ToSqlOutput::Owned(SqliteValue::Text(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            }
            Value::Time(v) => ToSqlOutput::Owned(SqliteValue::Text(v.format("%H:%M:%S%.f").to_string())),
            Value::Decimal(v) => ToSqlOutput::Owned(SqliteValue::Text(v.to_string())),
            Value::Json(v) => ToSqlOutput::Owned(SqliteValue::Text(v.to_string())),
        };
        Ok(output)
    }
}
