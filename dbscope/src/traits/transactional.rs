//! Scoped connection and transaction execution

use tracing::{debug, warn};

use crate::connection::{BeginOutcome, DbConnection};
use crate::error::Result;

/// Transaction isolation level.
///
/// Defines the degree to which one transaction must be isolated from
/// resource or data modifications made by other transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Allows dirty reads, non-repeatable reads, and phantom reads.
    ReadUncommitted,

    /// Prevents dirty reads but allows non-repeatable reads and phantom reads.
    ReadCommitted,

    /// Prevents dirty reads and non-repeatable reads but allows phantom reads.
    RepeatableRead,

    /// Provides full isolation. Transactions are completely isolated from one another.
    Serializable,
}

impl IsolationLevel {
    /// The level as written in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Runs callbacks on a connection, optionally inside a transaction.
///
/// The connection is given back on every exit path, including panics.
///
/// # Transactions
///
/// The transaction scope commits when the callback returns `Ok` and rolls
/// back when it returns `Err`, re-raising that error. Returning
/// [`rollback()`](crate::rollback) instead rolls back *without* an error:
/// the scope returns `Ok(None)`.
///
/// ```ignore
/// let order_id = manager.in_transaction(|conn| {
///     conn.execute_update_query(&insert_order, bind(|s| { s.set("sku", sku)?; Ok(()) }))?;
///     if out_of_stock(conn)? {
///         return dbscope::rollback();
///     }
///     conn.execute_get_first::<i64, _>(&last_id, NoParameters)
/// })?;
/// ```
///
/// A scope entered while a transaction is already active joins it. Errors,
/// including the rollback request, travel out to the scope that started the
/// transaction.
pub trait Transactional {
    /// Run `f` with a connection, without starting a transaction.
    ///
    /// Each statement auto-commits unless a transaction is already active.
    fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DbConnection) -> Result<R>;

    /// Run `f` in a transaction, applying `isolation` before it begins.
    ///
    /// `None` keeps the connection's current isolation level. Returns
    /// `Ok(None)` when `f` requested a rollback.
    fn in_transaction_with<R, F>(&self, isolation: Option<IsolationLevel>, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&DbConnection) -> Result<R>,
    {
        self.with_connection(|conn| run_in_transaction(conn, isolation, f))
    }

    /// Run `f` in a transaction with the connection's isolation level.
    fn in_transaction<R, F>(&self, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&DbConnection) -> Result<R>,
    {
        self.in_transaction_with(None, f)
    }

    /// Run `f` in a transaction; `false` means it was rolled back on request.
    fn in_transaction_without_result<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&DbConnection) -> Result<()>,
    {
        Ok(self.in_transaction(f)?.is_some())
    }
}

impl Transactional for DbConnection {
    fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DbConnection) -> Result<R>,
    {
        f(self)
    }
}

/// Run `f` in a transaction on `conn`, joining an active one.
pub(crate) fn run_in_transaction<R, F>(
    conn: &DbConnection,
    isolation: Option<IsolationLevel>,
    f: F,
) -> Result<Option<R>>
where
    F: FnOnce(&DbConnection) -> Result<R>,
{
    if let Some(level) = isolation {
        if conn.is_in_transaction()? {
            warn!(connection = conn.id(), ?level, "Isolation level ignored, joining the active transaction");
        } else {
            conn.set_transaction_isolation(level)?;
        }
    }

    match conn.begin_transaction()? {
        BeginOutcome::Begun => match f(conn) {
            Ok(value) => {
                conn.commit()?;
                Ok(Some(value))
            }
            Err(err) if err.is_rollback() => {
                conn.rollback()?;
                debug!(connection = conn.id(), "Transaction rolled back on request");
                Ok(None)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.rollback() {
                    warn!(
                        connection = conn.id(),
                        error = %rollback_err,
                        "Rollback failed while another error was propagating"
                    );
                }
                Err(err)
            }
        },
        BeginOutcome::AlreadyActive => f(conn).map(Some),
        BeginOutcome::Unsupported => match f(conn) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_rollback() => {
                warn!(
                    connection = conn.id(),
                    "Rollback requested but the driver has no transactions, statements were already applied"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        },
    }
}
