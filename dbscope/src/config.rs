//! Datasource configuration loaded from files and the environment

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::driver::redact_url;
use crate::error::{Error, Result};

/// Settings of one [`Datasource`](crate::Datasource).
///
/// ```toml
/// driver = "sqlite"
/// url = "sqlite:///var/lib/app/app.db"
/// pool_size = 4
/// acquire_timeout_ms = 2000
/// ```
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Driver identity or alias
    #[serde(default)]
    pub driver: String,

    /// Driver-specific connection URL
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Pool capacity, 0 disables pooling
    #[serde(default)]
    pub pool_size: usize,

    /// Longest wait for a pooled connection; unbounded when unset
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl DatasourceConfig {
    /// Load configuration from an optional file overridden by `DBSCOPE_*`
    /// environment variables.
    ///
    /// Without a path, `dbscope.{toml,json,yaml,...}` in the working
    /// directory is used when present.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name("dbscope").required(false));
        }

        builder = builder.add_source(Environment::with_prefix("DBSCOPE"));

        let config: DatasourceConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver.is_empty() {
            return Err(Error::Config("driver is required".into()));
        }
        if self.url.is_empty() {
            return Err(Error::Config("url is required".into()));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

impl std::fmt::Debug for DatasourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasourceConfig")
            .field("driver", &self.driver)
            .field("url", &redact_url(&self.url))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("pool_size", &self.pool_size)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .finish()
    }
}
