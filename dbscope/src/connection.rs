//! Leased database connections

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use tracing::{debug, warn};

use crate::capabilities::{self, Capabilities};
use crate::datasource::Shared;
use crate::driver::NativeConnection;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::statement::DbPreparedStatement;
use crate::traits::IsolationLevel;

/// A native connection together with its driver identity.
pub(crate) struct NativeHandle {
    pub(crate) native: Box<dyn NativeConnection>,
    pub(crate) identity: String,
    pub(crate) id: u64,
}

impl NativeHandle {
    pub(crate) fn close(self) {
        let id = self.id;
        if let Err(err) = self.native.close() {
            warn!(connection = id, error = %err, "Failed to close connection");
        } else {
            debug!(connection = id, "Closed connection");
        }
    }
}

/// Result of [`DbConnection::begin_transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// A new transaction was started by this call.
    Begun,
    /// A transaction was already active; the caller joins it.
    AlreadyActive,
    /// The driver doesn't do transactions; statements auto-commit.
    Unsupported,
}

struct ConnectionState {
    handle: Option<NativeHandle>,
    in_transaction: bool,
    broken: bool,
}

/// A connection leased from a [`Datasource`](crate::Datasource).
///
/// Dropping it gives the connection back: pooled connections return to
/// their pool, unpooled ones are closed. A transaction that is still active
/// at that point is rolled back first.
///
/// A connection serves one caller at a time. Using it from a second thread
/// while a statement runs fails with [`Error::ConnectionBusy`].
pub struct DbConnection {
    state: Mutex<ConnectionState>,
    id: u64,
    driver: String,
    datasource: Weak<Shared>,
    pooled: bool,
}

impl DbConnection {
    pub(crate) fn new(handle: NativeHandle, datasource: Weak<Shared>, pooled: bool) -> Self {
        Self {
            id: handle.id,
            driver: handle.identity.clone(),
            state: Mutex::new(ConnectionState {
                handle: Some(handle),
                in_transaction: false,
                broken: false,
            }),
            datasource,
            pooled,
        }
    }

    /// Process-unique id of the underlying native connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Canonical identity of the driver behind this connection.
    pub fn datasource_driver(&self) -> &str {
        &self.driver
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    fn lock(&self) -> Result<MutexGuard<'_, ConnectionState>> {
        match self.state.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(Error::ConnectionBusy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Run `f` against the native connection.
    ///
    /// A failure marks the connection so that the pool validates it before
    /// handing it out again.
    pub(crate) fn with_native<R>(&self, f: impl FnOnce(&mut dyn NativeConnection) -> Result<R>) -> Result<R> {
        let mut state = self.lock()?;
        let handle = state.handle.as_mut().ok_or(Error::ConnectionClosed)?;
        let result = f(handle.native.as_mut());
        if result.is_err() {
            state.broken = true;
        }
        result
    }

    /// The capability handle of this connection's driver.
    pub fn capabilities(&self) -> Result<Arc<Capabilities>> {
        match self.datasource.upgrade() {
            Some(shared) => shared.capabilities_for(&self.driver),
            None => capabilities::resolve(&self.driver),
        }
    }

    pub fn supports_transactions(&self) -> Result<bool> {
        if !self.capabilities()?.supports_transactions() {
            return Ok(false);
        }
        let state = self.lock()?;
        let handle = state.handle.as_ref().ok_or(Error::ConnectionClosed)?;
        Ok(handle.native.supports_transactions())
    }

    pub fn is_in_transaction(&self) -> Result<bool> {
        Ok(self.lock()?.in_transaction)
    }

    /// Start a transaction unless one is already active.
    pub fn begin_transaction(&self) -> Result<BeginOutcome> {
        if !self.supports_transactions()? {
            return Ok(BeginOutcome::Unsupported);
        }
        let mut state = self.lock()?;
        if state.in_transaction {
            return Ok(BeginOutcome::AlreadyActive);
        }
        let handle = state.handle.as_mut().ok_or(Error::ConnectionClosed)?;
        if let Err(err) = handle.native.begin() {
            state.broken = true;
            return Err(Error::transaction("begin", err));
        }
        state.in_transaction = true;
        debug!(connection = self.id, "Transaction started");
        Ok(BeginOutcome::Begun)
    }

    /// Commit the active transaction.
    ///
    /// Returns `false` when no transaction was active.
    pub fn commit(&self) -> Result<bool> {
        self.end_transaction("commit", |native| native.commit())
    }

    /// Roll back the active transaction.
    ///
    /// Returns `false` when no transaction was active.
    pub fn rollback(&self) -> Result<bool> {
        self.end_transaction("roll back", |native| native.rollback())
    }

    fn end_transaction(
        &self,
        operation: &'static str,
        end: impl FnOnce(&mut dyn NativeConnection) -> Result<()>,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        if !state.in_transaction {
            return Ok(false);
        }
        let handle = state.handle.as_mut().ok_or(Error::ConnectionClosed)?;
        match end(handle.native.as_mut()) {
            Ok(()) => {
                state.in_transaction = false;
                debug!(connection = self.id, operation, "Transaction ended");
                Ok(true)
            }
            Err(err) => {
                state.broken = true;
                Err(Error::transaction(operation, err))
            }
        }
    }

    /// Change the isolation level of the transactions that follow.
    ///
    /// Ignored when the driver doesn't support isolation levels.
    pub fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        if !self.capabilities()?.supports_isolation_levels() {
            debug!(connection = self.id, ?level, "Driver ignores isolation levels");
            return Ok(());
        }
        self.with_native(|native| native.set_isolation(level))
    }

    /// Prepare a plain SQL statement with positional parameters.
    pub fn prepare(&self, sql: impl Into<String>) -> DbPreparedStatement<'_> {
        DbPreparedStatement::new(self, sql.into(), None)
    }

    /// Prepare a statement from a parametrized query.
    ///
    /// When the query carries a row window the driver can't bind, the window
    /// is compensated for while rows are streamed.
    pub fn prepare_query(&self, query: &Query) -> Result<DbPreparedStatement<'_>> {
        let bind_window = self.capabilities()?.supports_limit_parameters();
        DbPreparedStatement::for_query(self, query, bind_window)
    }

    /// Give the connection back right away.
    ///
    /// Pooled connections return to their pool. Unpooled connections are
    /// closed and a failure to close them is reported.
    pub fn close(self) -> Result<()> {
        if self.pooled {
            return Ok(());
        }
        let mut state = self.lock()?;
        let rollback = state.in_transaction;
        let Some(mut handle) = state.handle.take() else {
            return Ok(());
        };
        drop(state);
        if rollback {
            if let Err(err) = handle.native.rollback() {
                warn!(connection = self.id, error = %err, "Rollback before close failed");
            }
        }
        handle.native.close()
    }
}

impl Drop for DbConnection {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(mut handle) = state.handle.take() else {
            return;
        };
        if state.in_transaction {
            warn!(connection = self.id, "Connection released with an active transaction, rolling back");
            if let Err(err) = handle.native.rollback() {
                warn!(connection = self.id, error = %err, "Rollback of the abandoned transaction failed");
                state.broken = true;
            }
            state.in_transaction = false;
        }
        match (self.pooled, self.datasource.upgrade()) {
            (true, Some(shared)) => shared.pool.release(handle, state.broken),
            _ => handle.close(),
        }
    }
}

impl fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConnection")
            .field("id", &self.id)
            .field("driver", &self.driver)
            .field("pooled", &self.pooled)
            .finish_non_exhaustive()
    }
}
