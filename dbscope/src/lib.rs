//! dbscope - database connectivity core
//!
//! Pooled datasources, prepared statements with virtual parameters, and
//! scoped transactions over native SQL drivers.
//!
//! # Features
//!
//! - **Datasources**: driver, URL and credentials bound to a bounded connection pool
//! - **Virtual parameters**: logical statement parameters resolved in-process instead of by the database
//! - **Transaction scopes**: commit on success, roll back on error or on [`rollback()`]
//! - **Drivers**: SQLite (`rusqlite`) and MySQL (`mysql_async`) built in, more through [`DriverRegistry`]
//!
//! # Example
//!
//! ```ignore
//! use dbscope::{bind, Datasource, Executor, Query, QueryManager, Transactional};
//!
//! let manager = QueryManager::new(Datasource::new("sqlite", "sqlite://shop.db", 4)?);
//!
//! let newest = Query::new("SELECT name FROM product ORDER BY id DESC")
//!     .limit_offset("LIMIT ? OFFSET ?", "limit", Some("offset"));
//! let rows = manager.execute_fetch_rows(&newest, bind(|s| {
//!     s.set("limit", 10)?.set("offset", 20)?;
//!     Ok(())
//! }))?;
//!
//! manager.in_transaction_without_result(|conn| {
//!     conn.execute_update("UPDATE product SET stock = stock - 1 WHERE id = 1")?;
//!     Ok(())
//! })?;
//! ```

pub mod capabilities;
pub mod config;
pub mod connection;
pub mod datasource;
pub mod driver;
pub mod error;
pub mod manager;
pub mod pool;
pub mod query;
pub mod row;
pub mod statement;
pub mod traits;
pub mod value;
pub mod virtual_params;

#[cfg(test)]
mod testing;

pub use capabilities::{Capabilities, LimitOffsetCompensator};
pub use config::DatasourceConfig;
pub use connection::{BeginOutcome, DbConnection};
pub use datasource::{ConnectionFactory, Datasource, DatasourceBuilder};
pub use driver::{redact_url, Credentials, Driver, DriverRegistry, NativeConnection};
pub use error::{rollback, BoxError, Error, Result};
pub use manager::QueryManager;
pub use pool::{ConnectionPool, PoolPhase, PoolStatus};
pub use query::Query;
pub use row::Row;
pub use statement::{DbPreparedStatement, FetchSummary};
pub use traits::{
    bind, BindParameters, CollectRows, Executor, FromValue, IsolationLevel, NoParameters,
    ResultHandler, RowProcessor, StatementHandler, ToValue, Transactional,
};
pub use value::Value;
pub use virtual_params::{VirtualParameters, VirtualParametersHandler};
