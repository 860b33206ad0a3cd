//! Database endpoint descriptors

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::capabilities::{self, Capabilities};
use crate::config::DatasourceConfig;
use crate::connection::{DbConnection, NativeHandle};
use crate::driver::{redact_url, Credentials, DriverRegistry, NativeConnection};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolStatus};

/// Opaque source of native connections, used instead of a driver URL.
///
/// Two datasources use the same factory only when they share the same
/// `Arc` handle.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn NativeConnection>>;

    fn connect_with(&self, credentials: &Credentials) -> Result<Box<dyn NativeConnection>>;
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by a datasource and every view derived from it.
pub(crate) struct Shared {
    pub(crate) pool: ConnectionPool,
    detected_driver: OnceLock<String>,
    capabilities: RwLock<HashMap<String, Arc<Capabilities>>>,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Self {
            pool: ConnectionPool::new(capacity),
            detected_driver: OnceLock::new(),
            capabilities: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn capabilities_for(&self, identity: &str) -> Result<Arc<Capabilities>> {
        if let Some(cached) = self
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
        {
            return Ok(Arc::clone(cached));
        }
        let resolved = capabilities::resolve(identity)?;
        self.capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.to_string(), Arc::clone(&resolved));
        Ok(resolved)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.pool.cleanup();
    }
}

/// Describes how to reach one database and owns its connection pool.
///
/// A datasource either names a registered driver and a URL, or wraps an
/// opaque [`ConnectionFactory`]. Driver, URL, user, password and factory
/// can't change anymore once the pool handed out its first connection.
///
/// Cloning (or [`derive`](Self::derive)) produces a view on the *same* pool
/// and capability cache; derived datasources are not independent.
///
/// # Example
///
/// ```ignore
/// use dbscope::Datasource;
///
/// let datasource = Datasource::builder()
///     .driver("sqlite")
///     .url("sqlite:///var/lib/app/app.db")
///     .pool_size(5)
///     .build()?;
///
/// let conn = datasource.connection()?;
/// ```
pub struct Datasource {
    driver: Option<String>,
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    factory: Option<Arc<dyn ConnectionFactory>>,
    shared: Arc<Shared>,
}

impl Datasource {
    /// A datasource for a registered driver and URL.
    ///
    /// A `pool_size` of 0 disables pooling.
    pub fn new(driver: impl Into<String>, url: impl Into<String>, pool_size: usize) -> Result<Self> {
        Self::builder().driver(driver).url(url).pool_size(pool_size).build()
    }

    /// A datasource drawing its connections from `factory`.
    ///
    /// The driver is detected from the first connection unless one is set.
    pub fn with_factory(factory: Arc<dyn ConnectionFactory>, pool_size: usize) -> Self {
        Self {
            driver: None,
            url: None,
            user: None,
            password: None,
            factory: Some(factory),
            shared: Arc::new(Shared::new(pool_size)),
        }
    }

    pub fn builder() -> DatasourceBuilder {
        DatasourceBuilder::default()
    }

    /// Build a datasource from loaded configuration.
    pub fn from_config(config: &DatasourceConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = Self::builder()
            .driver(config.driver.as_str())
            .url(config.url.as_str())
            .pool_size(config.pool_size);
        if let Some(user) = &config.user {
            builder = builder.user(user.as_str());
        }
        if let Some(password) = &config.password {
            builder = builder.password(password.as_str());
        }
        if let Some(timeout) = config.acquire_timeout() {
            builder = builder.acquire_timeout(timeout);
        }
        builder.build()
    }

    /// A view on this datasource sharing its pool and capability cache.
    ///
    /// Changing the driver, URL, user, password or factory of a view before
    /// the pool is used gives the view its own pool.
    pub fn derive(&self) -> Datasource {
        Self {
            driver: self.driver.clone(),
            url: self.url.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            factory: self.factory.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fails once the pool is live. A view still sharing its pool with other
    /// datasources moves onto a pool of its own, so that one pool never
    /// holds connections to two endpoints.
    fn begin_change(&mut self, setting: &'static str) -> Result<()> {
        if self.shared.pool.is_initialized() {
            return Err(Error::Immutable(setting));
        }
        if Arc::strong_count(&self.shared) > 1 {
            let shared = Shared::new(self.shared.pool.capacity());
            shared.pool.set_acquire_timeout(self.shared.pool.acquire_timeout());
            debug!(setting, "Reconfigured datasource view detached from shared pool");
            self.shared = Arc::new(shared);
        }
        Ok(())
    }

    /// The configured driver token, as set.
    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn set_driver(&mut self, driver: impl Into<String>) -> Result<()> {
        let driver = non_empty("driver", driver.into())?;
        self.begin_change("driver")?;
        self.driver = Some(driver);
        Ok(())
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn set_url(&mut self, url: impl Into<String>) -> Result<()> {
        let url = non_empty("url", url.into())?;
        self.begin_change("url")?;
        self.url = Some(url);
        Ok(())
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn set_user(&mut self, user: Option<String>) -> Result<()> {
        self.begin_change("user")?;
        self.user = user;
        Ok(())
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn set_password(&mut self, password: Option<String>) -> Result<()> {
        self.begin_change("password")?;
        self.password = password;
        Ok(())
    }

    pub fn factory(&self) -> Option<&Arc<dyn ConnectionFactory>> {
        self.factory.as_ref()
    }

    pub fn set_factory(&mut self, factory: Option<Arc<dyn ConnectionFactory>>) -> Result<()> {
        self.begin_change("connection factory")?;
        self.factory = factory;
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool.capacity()
    }

    pub fn is_pooled(&self) -> bool {
        self.pool_size() > 0
    }

    /// Change the pool capacity; 0 disables pooling.
    pub fn set_pool_size(&self, pool_size: usize) -> Result<()> {
        self.shared.pool.set_capacity(pool_size)
    }

    /// Bound the wait for a connection from a saturated pool.
    ///
    /// `None`, the default, waits until a connection is released.
    pub fn set_acquire_timeout(&self, timeout: Option<Duration>) {
        self.shared.pool.set_acquire_timeout(timeout);
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.shared.pool.acquire_timeout()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.shared.pool.status()
    }

    pub fn is_pool_initialized(&self) -> bool {
        self.shared.pool.is_initialized()
    }

    /// Lease a connection from the pool, or open one when pooling is off.
    pub fn connection(&self) -> Result<DbConnection> {
        self.shared.pool.lease(self)
    }

    /// Open a connection that bypasses the pool and closes when dropped.
    pub fn create_connection(&self) -> Result<DbConnection> {
        let handle = self.open_native()?;
        Ok(self.wrap(handle, false))
    }

    /// Fill the pool up to its capacity.
    pub fn prepare_pool(&self) -> Result<()> {
        self.shared.pool.prepare(self)
    }

    /// Close the pool. Leased connections close when they're released.
    pub fn cleanup(&self) {
        self.shared.pool.cleanup();
    }

    /// The canonical identity of this datasource's driver.
    ///
    /// Aliases resolve to their target. For a factory without a configured
    /// driver, a connection is leased to detect it.
    pub fn aliased_driver(&self) -> Result<String> {
        if let Some(driver) = &self.driver {
            return Ok(canonical_identity(DriverRegistry::global(), driver));
        }
        if let Some(detected) = self.shared.detected_driver.get() {
            return Ok(detected.clone());
        }
        if self.factory.is_none() {
            return Err(Error::InvalidArgument("driver isn't set".to_string()));
        }
        let conn = self.connection()?;
        Ok(conn.datasource_driver().to_string())
    }

    /// The capability handle of this datasource's driver.
    pub fn capabilities(&self) -> Result<Arc<Capabilities>> {
        let identity = self.aliased_driver()?;
        self.shared.capabilities_for(&identity)
    }

    fn credentials(&self) -> Option<Credentials> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(Credentials {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Open a native connection, through the factory if there is one.
    pub(crate) fn open_native(&self) -> Result<NativeHandle> {
        let registry = DriverRegistry::global();
        let credentials = self.credentials();

        let (native, identity) = match &self.factory {
            Some(factory) => {
                let opened = match &credentials {
                    Some(credentials) => factory.connect_with(credentials),
                    None => factory.connect(),
                };
                let mut native = opened.map_err(|e| Error::ConnectionOpen {
                    url: None,
                    user: credentials.as_ref().map(|c| c.user.clone()),
                    source: Box::new(e),
                })?;
                let identity = match self.factory_identity(registry, native.as_mut()) {
                    Ok(identity) => identity,
                    Err(err) => {
                        if let Err(close_err) = native.close() {
                            warn!(error = %close_err, "Failed to close connection of unidentified driver");
                        }
                        return Err(err);
                    }
                };
                (native, identity)
            }
            None => {
                let driver = self
                    .driver
                    .as_deref()
                    .ok_or_else(|| Error::InvalidArgument("driver isn't set".to_string()))?;
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| Error::InvalidArgument("url isn't set".to_string()))?;
                let identity = registry
                    .resolve_alias(driver)
                    .map_err(|e| Error::DriverInstantiation {
                        driver: driver.to_string(),
                        reason: e.to_string(),
                    })?;
                let native = registry.connect(&identity, url, credentials.as_ref())?;
                (native, identity)
            }
        };

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, driver = %identity, "Opened native connection");
        Ok(NativeHandle { native, identity, id })
    }

    fn factory_identity(&self, registry: &DriverRegistry, native: &mut dyn NativeConnection) -> Result<String> {
        if let Some(driver) = &self.driver {
            return Ok(canonical_identity(registry, driver));
        }
        if let Some(detected) = self.shared.detected_driver.get() {
            return Ok(detected.clone());
        }
        let name = native
            .driver_name()
            .map_err(|e| Error::DriverNameRetrieval(Box::new(e)))?;
        let identity = registry
            .identity_for_name(&name)
            .ok_or(Error::UnsupportedDriverName(name))?;
        debug!(driver = %identity, "Detected driver of connection factory");
        Ok(self.shared.detected_driver.get_or_init(|| identity).clone())
    }

    pub(crate) fn wrap(&self, handle: NativeHandle, pooled: bool) -> DbConnection {
        DbConnection::new(handle, Arc::downgrade(&self.shared), pooled)
    }

    /// Identifies the pool shared by this datasource and its derived views.
    pub(crate) fn pool_key(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    fn factory_addr(&self) -> Option<usize> {
        self.factory
            .as_ref()
            .map(|f| Arc::as_ptr(f) as *const () as usize)
    }
}

fn canonical_identity(registry: &DriverRegistry, driver: &str) -> String {
    registry
        .resolve_alias(driver)
        .unwrap_or_else(|_| driver.to_string())
}

fn non_empty(setting: &str, value: String) -> Result<String> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{setting} can't be empty")));
    }
    Ok(value)
}

impl Clone for Datasource {
    /// Same as [`derive`](Datasource::derive): the clone shares the pool.
    fn clone(&self) -> Self {
        self.derive()
    }
}

/// Equality covers driver, URL, factory, user and password; pool settings
/// are ignored.
impl PartialEq for Datasource {
    fn eq(&self, other: &Self) -> bool {
        self.driver == other.driver
            && self.url == other.url
            && self.factory_addr() == other.factory_addr()
            && self.user == other.user
            && self.password == other.password
    }
}

impl Eq for Datasource {}

impl Hash for Datasource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // absent fields hash as a marker so that partial descriptors stay apart
        fn field<H: Hasher>(value: Option<&str>, state: &mut H) {
            match value {
                Some(v) => {
                    state.write_u8(1);
                    v.hash(state);
                }
                None => state.write_u8(0xff),
            }
        }
        field(self.driver.as_deref(), state);
        field(self.url.as_deref(), state);
        self.factory_addr().hash(state);
        field(self.user.as_deref(), state);
        field(self.password.as_deref(), state);
    }
}

impl fmt::Debug for Datasource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datasource")
            .field("driver", &self.driver)
            .field("url", &self.url.as_deref().map(redact_url))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("factory", &self.factory.is_some())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

/// Builder for a [`Datasource`].
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use dbscope::Datasource;
///
/// let datasource = Datasource::builder()
///     .driver("mysql")
///     .url("mysql://localhost:3306/shop")
///     .user("shop")
///     .password("secret")
///     .pool_size(10)
///     .acquire_timeout(Duration::from_secs(5))
///     .build()?;
/// ```
#[derive(Default)]
pub struct DatasourceBuilder {
    driver: Option<String>,
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    pool_size: usize,
    acquire_timeout: Option<Duration>,
    factory: Option<Arc<dyn ConnectionFactory>>,
}

impl DatasourceBuilder {
    /// Set the driver token (identity or alias).
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the pool capacity; 0 (the default) disables pooling.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Validate the settings and build the [`Datasource`].
    pub fn build(self) -> Result<Datasource> {
        let driver = self.driver.map(|d| non_empty("driver", d)).transpose()?;
        let url = self.url.map(|u| non_empty("url", u)).transpose()?;
        if self.factory.is_none() {
            if driver.is_none() {
                return Err(Error::InvalidArgument("driver is required without a connection factory".into()));
            }
            if url.is_none() {
                return Err(Error::InvalidArgument("url is required without a connection factory".into()));
            }
        }
        let shared = Arc::new(Shared::new(self.pool_size));
        shared.pool.set_acquire_timeout(self.acquire_timeout);
        Ok(Datasource {
            driver,
            url,
            user: self.user,
            password: self.password,
            factory: self.factory,
            shared,
        })
    }
}
