//! Per-driver capability handles
//!
//! A [`Capabilities`] handle describes what a driver can do natively and how
//! the statement layer compensates when it can't. Handles live in a
//! process-wide registry keyed by canonical driver identity.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::statement::DbPreparedStatement;
use crate::traits::FromValue;
use crate::virtual_params::VirtualParametersHandler;

/// What a driver supports natively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    identity: String,
    transactions: bool,
    isolation_levels: bool,
    limit_parameters: bool,
    identifier_quote: char,
}

impl Capabilities {
    /// Capabilities of a fully featured driver.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            transactions: true,
            isolation_levels: true,
            limit_parameters: true,
            identifier_quote: '"',
        }
    }

    pub fn with_transactions(mut self, supported: bool) -> Self {
        self.transactions = supported;
        self
    }

    pub fn with_isolation_levels(mut self, supported: bool) -> Self {
        self.isolation_levels = supported;
        self
    }

    /// Whether LIMIT and OFFSET values can be bound as statement parameters.
    pub fn with_limit_parameters(mut self, supported: bool) -> Self {
        self.limit_parameters = supported;
        self
    }

    pub fn with_identifier_quote(mut self, quote: char) -> Self {
        self.identifier_quote = quote;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn supports_transactions(&self) -> bool {
        self.transactions
    }

    pub fn supports_isolation_levels(&self) -> bool {
        self.isolation_levels
    }

    pub fn supports_limit_parameters(&self) -> bool {
        self.limit_parameters
    }

    /// Quote an identifier, doubling any embedded quote characters.
    pub fn quote_identifier(&self, name: &str) -> String {
        let quote = self.identifier_quote;
        let mut quoted = String::with_capacity(name.len() + 2);
        quoted.push(quote);
        for c in name.chars() {
            if c == quote {
                quoted.push(quote);
            }
            quoted.push(c);
        }
        quoted.push(quote);
        quoted
    }
}

fn registry() -> &'static RwLock<HashMap<String, Arc<Capabilities>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<Capabilities>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let builtin = [
            Capabilities::new("sqlite"),
            Capabilities::new("mysql").with_identifier_quote('`'),
        ];
        RwLock::new(
            builtin
                .into_iter()
                .map(|c| (c.identity.clone(), Arc::new(c)))
                .collect(),
        )
    })
}

/// Register or replace the capability handle for a driver identity.
pub fn register(capabilities: Capabilities) {
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(capabilities.identity.clone(), Arc::new(capabilities));
}

/// The capability handle for a canonical driver identity.
pub fn resolve(identity: &str) -> Result<Arc<Capabilities>> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(identity)
        .cloned()
        .ok_or_else(|| Error::UnsupportedDriver(identity.to_string()))
}

/// Applies a parametrized LIMIT/OFFSET on the client side.
///
/// Installed on statements whose driver can't bind limit parameters. The
/// limit and offset names are virtual there; right before execution their
/// values become the statement's row window: at most `offset + limit` rows
/// are read and the first `offset` of them are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitOffsetCompensator {
    limit: String,
    offset: Option<String>,
}

impl LimitOffsetCompensator {
    pub fn new(limit: impl Into<String>, offset: Option<&str>) -> Self {
        Self {
            limit: limit.into(),
            offset: offset.map(str::to_string),
        }
    }

    /// The parameter names that become virtual.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.limit.as_str()).chain(self.offset.as_deref())
    }
}

fn window_bound(statement: &DbPreparedStatement<'_>, name: &str) -> Result<usize> {
    let value = statement.virtual_value(name)?;
    let bound = i64::from_value(value)?;
    usize::try_from(bound)
        .map_err(|_| Error::InvalidArgument(format!("'{name}' must not be negative, got {bound}")))
}

impl VirtualParametersHandler for LimitOffsetCompensator {
    fn handle_values(&self, statement: &mut DbPreparedStatement<'_>) -> Result<()> {
        let limit = window_bound(statement, &self.limit)?;
        let offset = match &self.offset {
            Some(name) => window_bound(statement, name)?,
            None => 0,
        };
        statement.set_max_rows(Some(limit.saturating_add(offset)));
        statement.set_skip_rows(offset);
        Ok(())
    }
}
