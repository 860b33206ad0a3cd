//! Query execution against a datasource

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::connection::DbConnection;
use crate::datasource::Datasource;
use crate::error::Result;
use crate::traits::{run_in_transaction, Executor, IsolationLevel, Transactional};

thread_local! {
    /// Connections running a transaction on this thread, per datasource.
    static ACTIVE_TRANSACTIONS: RefCell<HashMap<usize, Arc<DbConnection>>> = RefCell::new(HashMap::new());
}

fn active_transaction(key: usize) -> Option<Arc<DbConnection>> {
    ACTIVE_TRANSACTIONS.with(|active| active.borrow().get(&key).cloned())
}

/// Unbinds a transaction's connection from the thread when the scope ends.
struct TransactionBinding {
    key: usize,
}

impl TransactionBinding {
    fn bind(key: usize, conn: Arc<DbConnection>) -> Self {
        ACTIVE_TRANSACTIONS.with(|active| active.borrow_mut().insert(key, conn));
        Self { key }
    }
}

impl Drop for TransactionBinding {
    fn drop(&mut self) {
        // a thread being torn down has nothing left to unbind
        let _ = ACTIVE_TRANSACTIONS.try_with(|active| active.borrow_mut().remove(&self.key));
    }
}

/// Runs statements and scoped work against a [`Datasource`].
///
/// Each call leases its own connection and gives it back before returning.
/// While a transaction scope is running, calls made from the same thread
/// against the same datasource reuse the transaction's connection, so they
/// take part in the transaction.
///
/// # Example
///
/// ```ignore
/// use dbscope::{Datasource, Executor, QueryManager, Transactional};
///
/// let manager = QueryManager::new(Datasource::new("sqlite", "sqlite://shop.db", 4)?);
/// manager.execute_update("CREATE TABLE IF NOT EXISTS product (id INTEGER, name TEXT)")?;
///
/// manager.in_transaction_without_result(|_conn| {
///     manager.execute_update("INSERT INTO product VALUES (1, 'lamp')")?;
///     manager.execute_update("INSERT INTO product VALUES (2, 'desk')")?;
///     Ok(())
/// })?;
/// ```
#[derive(Debug, Clone)]
pub struct QueryManager {
    datasource: Datasource,
}

impl QueryManager {
    pub fn new(datasource: Datasource) -> Self {
        Self { datasource }
    }

    pub fn datasource(&self) -> &Datasource {
        &self.datasource
    }

    /// The connection of this thread's running transaction, if any.
    pub fn transaction_connection(&self) -> Option<Arc<DbConnection>> {
        active_transaction(self.datasource.pool_key())
    }
}

impl Transactional for QueryManager {
    fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DbConnection) -> Result<R>,
    {
        if let Some(conn) = self.transaction_connection() {
            return f(&conn);
        }
        let conn = self.datasource.connection()?;
        f(&conn)
    }

    fn in_transaction_with<R, F>(&self, isolation: Option<IsolationLevel>, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&DbConnection) -> Result<R>,
    {
        if let Some(conn) = self.transaction_connection() {
            return run_in_transaction(&conn, isolation, f);
        }

        let key = self.datasource.pool_key();
        let conn = Arc::new(self.datasource.connection()?);
        debug!(connection = conn.id(), "Binding transaction connection to thread");
        let _binding = TransactionBinding::bind(key, Arc::clone(&conn));
        run_in_transaction(&conn, isolation, f)
    }
}

impl Executor for QueryManager {}
