//! Native drivers and the process-wide driver registry
//!
//! A driver identity is a short token such as `sqlite` or `mysql`. The
//! registry maps identities to [`Driver`] implementations, deprecated or
//! alternative tokens to their canonical identity, and the names live
//! connections report about themselves back to an identity.

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use crate::error::{Error, Result};
use crate::row::Row;
use crate::traits::IsolationLevel;
use crate::value::Value;

/// User name and password handed to a driver.
///
/// Only built when both are configured.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opens native connections for one driver identity.
pub trait Driver: Send + Sync {
    /// Open a connection to `url`.
    fn connect(&self, url: &str, credentials: Option<&Credentials>) -> Result<Box<dyn NativeConnection>>;
}

/// A live connection as provided by a native driver.
///
/// Implementations are used by one caller at a time; the surrounding
/// [`DbConnection`](crate::DbConnection) serializes access.
pub trait NativeConnection: Send {
    /// The driver's self-reported product name (e.g. `SQLite`, `MySQL`).
    fn driver_name(&mut self) -> Result<String>;

    /// Execute a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run a query and feed each row to `sink` until it returns `false`.
    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        sink: &mut dyn FnMut(&Row) -> Result<bool>,
    ) -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Apply an isolation level to the transactions that follow.
    fn set_isolation(&mut self, level: IsolationLevel) -> Result<()>;

    fn supports_transactions(&self) -> bool {
        true
    }

    /// Cheap liveness check used before a failed connection is reused.
    fn is_valid(&mut self) -> bool;

    fn close(self: Box<Self>) -> Result<()>;
}

#[derive(Default)]
struct RegistryState {
    drivers: HashMap<String, Arc<dyn Driver>>,
    aliases: HashMap<String, String>,
    names: HashMap<String, String>,
}

/// Lookup tables from driver tokens to drivers.
///
/// Use [`DriverRegistry::global`] for the process-wide instance, which is
/// populated with the drivers compiled into this crate.
pub struct DriverRegistry {
    state: RwLock<RegistryState>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static DriverRegistry {
        static GLOBAL: OnceLock<DriverRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let registry = DriverRegistry::new();
            registry.register_builtin();
            registry
        })
    }

    fn register_builtin(&self) {
        #[cfg(feature = "sqlite")]
        {
            self.register_driver(sqlite::IDENTITY, Arc::new(sqlite::SqliteDriver::default()));
            self.register_alias("sqlite3", sqlite::IDENTITY);
            self.register_driver_name("SQLite", sqlite::IDENTITY);
        }
        #[cfg(feature = "mysql")]
        {
            self.register_driver(mysql::IDENTITY, Arc::new(mysql::MySqlDriver));
            self.register_alias("mariadb", mysql::IDENTITY);
            self.register_alias("mysql_async", mysql::IDENTITY);
            self.register_driver_name("MySQL", mysql::IDENTITY);
            self.register_driver_name("MariaDB", mysql::IDENTITY);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a driver under its canonical identity, replacing any previous one.
    pub fn register_driver(&self, identity: impl Into<String>, driver: Arc<dyn Driver>) {
        let identity = identity.into();
        debug!(identity = %identity, "Registering driver");
        self.write().drivers.insert(identity, driver);
    }

    /// Map a deprecated or alternative token to a canonical identity.
    pub fn register_alias(&self, alias: impl Into<String>, identity: impl Into<String>) {
        self.write().aliases.insert(alias.into(), identity.into());
    }

    /// Map a connection's self-reported driver name to an identity.
    pub fn register_driver_name(&self, name: impl Into<String>, identity: impl Into<String>) {
        self.write().names.insert(name.into(), identity.into());
    }

    /// Resolve a token to its canonical identity.
    ///
    /// Known aliases resolve to their target, registered identities to
    /// themselves. Anything else is an unsupported driver name.
    pub fn resolve_alias(&self, token: &str) -> Result<String> {
        let state = self.read();
        if let Some(canonical) = state.aliases.get(token) {
            return Ok(canonical.clone());
        }
        if state.drivers.contains_key(token) {
            return Ok(token.to_string());
        }
        Err(Error::UnsupportedDriverName(token.to_string()))
    }

    /// The identity behind a self-reported driver name, if known.
    pub fn identity_for_name(&self, name: &str) -> Option<String> {
        self.read().names.get(name).cloned()
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.read().drivers.contains_key(identity)
    }

    /// Look up the driver registered for a canonical identity.
    pub fn driver(&self, identity: &str) -> Result<Arc<dyn Driver>> {
        self.read()
            .drivers
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::DriverInstantiation {
                driver: identity.to_string(),
                reason: "no driver is registered under this identity".to_string(),
            })
    }

    /// Load the driver for `identity` and open a connection to `url`.
    pub fn connect(
        &self,
        identity: &str,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn NativeConnection>> {
        let driver = self.driver(identity)?;
        driver
            .connect(url, credentials)
            .map_err(|e| Error::ConnectionOpen {
                url: Some(redact_url(url).into_owned()),
                user: credentials.map(|c| c.user.clone()),
                source: Box::new(e),
            })
    }
}

/// `url` with the password of its user info masked, for errors and logs.
///
/// `mysql://app:s3cret@db/shop` becomes `mysql://app:***@db/shop`; URLs
/// without a password come back unchanged.
pub fn redact_url(url: &str) -> Cow<'_, str> {
    let Some(scheme_end) = url.find("://") else {
        return Cow::Borrowed(url);
    };
    let authority_start = scheme_end + 3;
    let rest = &url[authority_start..];
    let authority = &rest[..rest.find(['/', '?', '#']).unwrap_or(rest.len())];
    let Some(at) = authority.rfind('@') else {
        return Cow::Borrowed(url);
    };
    let Some(colon) = authority[..at].find(':') else {
        return Cow::Borrowed(url);
    };
    Cow::Owned(format!(
        "{}{}:***{}",
        &url[..authority_start],
        &authority[..colon],
        &url[authority_start + at..]
    ))
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        let mut drivers: Vec<_> = state.drivers.keys().collect();
        drivers.sort();
        f.debug_struct("DriverRegistry")
            .field("drivers", &drivers)
            .field("aliases", &state.aliases.len())
            .field("names", &state.names.len())
            .finish()
    }
}
