//! In-process driver double for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::capabilities::{self, Capabilities};
use crate::datasource::{ConnectionFactory, Datasource};
use crate::driver::{Credentials, Driver, DriverRegistry, NativeConnection};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::traits::IsolationLevel;
use crate::value::Value;

#[derive(Default)]
struct MockState {
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_connects: AtomicBool,
    fail_statements: AtomicBool,
    fail_driver_name: AtomicBool,
    fail_close: AtomicBool,
    invalid: AtomicBool,
    log: Mutex<Vec<String>>,
    last_params: Mutex<Vec<Value>>,
    last_credentials: Mutex<Option<(String, String)>>,
    columns: Mutex<Vec<String>>,
    rows: Mutex<Vec<Vec<Value>>>,
    rows_read: AtomicUsize,
}

impl MockState {
    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

/// A driver that records what it's asked to do.
#[derive(Clone)]
pub(crate) struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub(crate) fn new(_identity: &str) -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    /// Register a driver under `identity` and build a datasource for it.
    pub(crate) fn datasource(identity: &str, capacity: usize) -> (MockDriver, Datasource) {
        Self::datasource_with(identity, capacity, Capabilities::new(identity))
    }

    pub(crate) fn datasource_with(
        identity: &str,
        capacity: usize,
        capabilities: Capabilities,
    ) -> (MockDriver, Datasource) {
        let driver = MockDriver::new(identity);
        DriverRegistry::global().register_driver(identity, Arc::new(driver.clone()));
        capabilities::register(capabilities);
        let datasource = Datasource::new(identity, format!("mock://{identity}"), capacity).unwrap();
        (driver, datasource)
    }

    pub(crate) fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_connects(&self, fail: bool) {
        self.state.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_statements(&self, fail: bool) {
        self.state.fail_statements.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn invalidate_connections(&self, invalid: bool) {
        self.state.invalid.store(invalid, Ordering::SeqCst);
    }

    /// Executed SQL and transaction commands, in order.
    pub(crate) fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    pub(crate) fn last_params(&self) -> Vec<Value> {
        self.state.last_params.lock().unwrap().clone()
    }

    pub(crate) fn last_credentials(&self) -> Option<(String, String)> {
        self.state.last_credentials.lock().unwrap().clone()
    }

    /// Rows every query returns.
    pub(crate) fn set_rows<const N: usize>(&self, columns: [&str; N], rows: Vec<Vec<Value>>) {
        *self.state.columns.lock().unwrap() = columns.iter().map(|c| c.to_string()).collect();
        *self.state.rows.lock().unwrap() = rows;
    }

    /// Rows handed out by the most recent query.
    pub(crate) fn rows_read(&self) -> usize {
        self.state.rows_read.load(Ordering::SeqCst)
    }
}

impl Driver for MockDriver {
    fn connect(&self, _url: &str, credentials: Option<&Credentials>) -> Result<Box<dyn NativeConnection>> {
        connect(&self.state, "Mock", credentials)
    }
}

fn connect(
    state: &Arc<MockState>,
    name: &str,
    credentials: Option<&Credentials>,
) -> Result<Box<dyn NativeConnection>> {
    if state.fail_connects.load(Ordering::SeqCst) {
        return Err(Error::Driver("connection refused".into()));
    }
    state.opened.fetch_add(1, Ordering::SeqCst);
    *state.last_credentials.lock().unwrap() = credentials.map(|c| (c.user.clone(), c.password.clone()));
    Ok(Box::new(MockConnection {
        name: name.to_string(),
        state: Arc::clone(state),
    }))
}

/// A connection factory reporting a fixed driver name.
pub(crate) struct MockFactory {
    name: String,
    state: Arc<MockState>,
}

impl MockFactory {
    pub(crate) fn new(driver_name: &str) -> Self {
        Self {
            name: driver_name.to_string(),
            state: Arc::new(MockState::default()),
        }
    }

    pub(crate) fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn last_credentials(&self) -> Option<(String, String)> {
        self.state.last_credentials.lock().unwrap().clone()
    }

    pub(crate) fn fail_driver_name(&self, fail: bool) {
        self.state.fail_driver_name.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }
}

impl ConnectionFactory for MockFactory {
    fn connect(&self) -> Result<Box<dyn NativeConnection>> {
        connect(&self.state, &self.name, None)
    }

    fn connect_with(&self, credentials: &Credentials) -> Result<Box<dyn NativeConnection>> {
        connect(&self.state, &self.name, Some(credentials))
    }
}

struct MockConnection {
    name: String,
    state: Arc<MockState>,
}

impl MockConnection {
    fn statement(&self, sql: &str, params: &[Value]) -> Result<()> {
        if self.state.fail_statements.load(Ordering::SeqCst) {
            return Err(Error::Driver("statement failed".into()));
        }
        self.state.record(sql);
        *self.state.last_params.lock().unwrap() = params.to_vec();
        Ok(())
    }
}

impl NativeConnection for MockConnection {
    fn driver_name(&mut self) -> Result<String> {
        if self.state.fail_driver_name.load(Ordering::SeqCst) {
            return Err(Error::Driver("metadata unavailable".into()));
        }
        Ok(self.name.clone())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.statement(sql, params)?;
        Ok(1)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        sink: &mut dyn FnMut(&Row) -> Result<bool>,
    ) -> Result<()> {
        self.statement(sql, params)?;
        let columns: Arc<[String]> = self.state.columns.lock().unwrap().clone().into();
        let rows = self.state.rows.lock().unwrap().clone();
        self.state.rows_read.store(0, Ordering::SeqCst);
        for values in rows {
            self.state.rows_read.fetch_add(1, Ordering::SeqCst);
            if !sink(&Row::new(Arc::clone(&columns), values))? {
                break;
            }
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.state.record("BEGIN");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state.record("COMMIT");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.state.record("ROLLBACK");
        Ok(())
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.state.record(format!("ISOLATION {}", level.as_sql()));
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        !self.state.invalid.load(Ordering::SeqCst)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(Error::Driver("close failed".into()));
        }
        Ok(())
    }
}
