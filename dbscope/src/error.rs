//! Error types for dbscope

use std::time::Duration;

use thiserror::Error;

/// Result type alias for dbscope operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used to carry driver and caller failures opaquely.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during database operations
#[derive(Error, Debug)]
pub enum Error {
    /// Opening a native connection failed.
    ///
    /// Carries the URL and user for context; the password is never rendered.
    #[error("Couldn't connect to {}{}: {source}", url.as_deref().unwrap_or("<factory>"), user.as_deref().map(|u| format!(" as '{u}'")).unwrap_or_default())]
    ConnectionOpen {
        url: Option<String>,
        user: Option<String>,
        #[source]
        source: BoxError,
    },

    /// The driver identity could not be loaded from the driver registry.
    #[error("Couldn't instantiate driver '{driver}': {reason}")]
    DriverInstantiation { driver: String, reason: String },

    /// Asking a factory-created connection for its driver name failed.
    #[error("Couldn't retrieve the driver name of the connection: {0}")]
    DriverNameRetrieval(#[source] BoxError),

    /// The self-reported driver name or identity isn't known to the registry.
    #[error("Unsupported driver name: {0}")]
    UnsupportedDriverName(String),

    /// No capability handle is registered for the driver identity.
    #[error("Unsupported driver: {0}")]
    UnsupportedDriver(String),

    /// Signals that the enclosing transaction scope must roll back.
    ///
    /// This isn't a failure: the transaction scope that started the
    /// transaction intercepts it and returns `Ok(None)`.
    #[error("Transaction rollback requested")]
    Rollback,

    /// A caller-defined failure propagated through a scoped callback.
    #[error(transparent)]
    Caller(BoxError),

    /// An argument was rejected (empty driver or URL, unknown index, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A datasource setting was changed after its pool was set up.
    #[error("{0} can't be changed after the connection pool has been set up")]
    Immutable(&'static str),

    /// The pool was cleaned up and doesn't hand out connections anymore.
    #[error("Connection pool has been cleaned up")]
    PoolClosed,

    /// No pooled connection became available within the acquire timeout.
    #[error("Timed out after {waited:?} waiting for a pooled connection (capacity={capacity})")]
    PoolTimeout { capacity: usize, waited: Duration },

    /// The connection was closed or its pool discarded it.
    #[error("The connection is closed")]
    ConnectionClosed,

    /// The connection is already in use by another caller.
    #[error("The connection is in use by another caller")]
    ConnectionBusy,

    /// Statement execution failed.
    #[error("Error while executing the SQL '{sql}': {source}")]
    Execution {
        sql: String,
        #[source]
        source: Box<Error>,
    },

    /// Beginning, committing or rolling back a transaction failed.
    #[error("Couldn't {operation} the transaction: {source}")]
    Transaction {
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A declared virtual parameter had no value when the statement executed.
    #[error("Virtual parameter '{0}' has no value")]
    UndefinedVirtualParameter(String),

    /// The parameter name isn't declared by the statement's query.
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// A physical parameter position was left unbound.
    #[error("Parameter at position {0} isn't bound")]
    UnboundParameter(usize),

    /// Named parameters were used on a statement that wasn't prepared from a [`Query`](crate::Query).
    #[error("The statement '{0}' wasn't prepared from a parametrized query")]
    NoParametrizedQuery(String),

    /// Type conversion error
    #[error("Type conversion error: expected {expected}, got {actual}")]
    TypeConversion {
        expected: &'static str,
        actual: String,
    },

    /// Column not found in row
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Configuration couldn't be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// MySQL driver error
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    MySql(#[from] mysql_async::Error),

    /// SQLite driver error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Any other native driver error
    #[error("Driver error: {0}")]
    Driver(String),
}

impl Error {
    /// Wrap a caller-defined error so it can travel through a scoped callback.
    ///
    /// ```ignore
    /// manager.with_connection(|conn| {
    ///     load_settings().map_err(Error::caller)?;
    ///     Ok(())
    /// })?;
    /// ```
    pub fn caller<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Caller(error.into())
    }

    /// Whether this is the transaction rollback signal.
    pub fn is_rollback(&self) -> bool {
        matches!(self, Error::Rollback)
    }

    /// Unwrap a caller error, giving back the original failure.
    pub fn into_caller(self) -> std::result::Result<BoxError, Self> {
        match self {
            Error::Caller(inner) => Ok(inner),
            other => Err(other),
        }
    }

    pub(crate) fn execution(sql: &str, source: Error) -> Self {
        Error::Execution {
            sql: sql.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn transaction(operation: &'static str, source: Error) -> Self {
        Error::Transaction {
            operation,
            source: Box::new(source),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Request a rollback of the enclosing transaction scope.
///
/// ```ignore
/// manager.in_transaction(|conn| {
///     conn.execute_update("DELETE FROM orders")?;
///     if !confirmed {
///         return dbscope::rollback();
///     }
///     Ok(())
/// })?;
/// ```
pub fn rollback<T>() -> Result<T> {
    Err(Error::Rollback)
}
