//! Prepared statements bound to a leased connection

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::capabilities::LimitOffsetCompensator;
use crate::connection::DbConnection;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::row::Row;
use crate::traits::{RowProcessor, ToValue};
use crate::value::Value;
use crate::virtual_params::VirtualParameters;

/// Outcome of streaming a query's rows through a [`RowProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchSummary {
    /// Rows handed to the processor.
    pub rows: usize,
    /// `false` when the processor stopped the traversal early.
    pub completed: bool,
}

/// A statement prepared on a [`DbConnection`].
///
/// Statements prepared from a [`Query`] accept named parameters. A name that
/// appears more than once in the query is bound to every one of its
/// positions by a single [`set`](Self::set).
///
/// # Example
///
/// ```ignore
/// let query = Query::new("UPDATE stock SET quantity = ? WHERE sku = ?")
///     .parameters(["quantity", "sku"]);
///
/// let mut stmt = conn.prepare_query(&query)?;
/// stmt.set("quantity", 12)?.set("sku", "A-100")?;
/// let updated = stmt.execute_update()?;
/// ```
pub struct DbPreparedStatement<'c> {
    connection: &'c DbConnection,
    sql: String,
    query: Option<Query>,
    /// values of the real positions, 1-based position at index - 1
    parameters: Vec<Option<Value>>,
    virtual_parameters: Option<VirtualParameters>,
    max_rows: Option<usize>,
    skip_rows: usize,
}

impl<'c> DbPreparedStatement<'c> {
    pub(crate) fn new(connection: &'c DbConnection, sql: String, query: Option<Query>) -> Self {
        Self {
            connection,
            sql,
            query,
            parameters: Vec::new(),
            virtual_parameters: None,
            max_rows: None,
            skip_rows: 0,
        }
    }

    pub(crate) fn for_query(connection: &'c DbConnection, query: &Query, bind_window: bool) -> Result<Self> {
        let flat = query.flatten(bind_window);
        let has_virtuals = flat.virtual_parameter_names().next().is_some();
        let mut statement = Self::new(connection, flat.sql().to_string(), Some(flat));

        match query.limit_parameter() {
            Some(limit) if !bind_window => {
                let compensator = LimitOffsetCompensator::new(limit, query.offset_parameter());
                let names: Vec<String> = compensator.parameter_names().map(str::to_string).collect();
                statement.set_virtual_parameters(VirtualParameters::with_handler(names, Arc::new(compensator)))?;
            }
            _ if has_virtuals => {
                statement.set_virtual_parameters(VirtualParameters::declared(Vec::<String>::new()))?;
            }
            _ => {}
        }
        Ok(statement)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn connection(&self) -> &'c DbConnection {
        self.connection
    }

    /// The query this statement was prepared from, with any row window
    /// already folded in.
    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    fn require_query(&self) -> Result<&Query> {
        self.query
            .as_ref()
            .ok_or_else(|| Error::NoParametrizedQuery(self.sql.clone()))
    }

    /// Bind a named parameter at every position it occupies.
    pub fn set(&mut self, name: &str, value: impl ToValue) -> Result<&mut Self> {
        let slots = self.require_query()?.parameter_indices(name);
        if slots.is_empty() {
            return Err(Error::UnknownParameter(name.to_string()));
        }
        let value = value.to_value();
        for slot in slots {
            self.set_at(slot, value.clone())?;
        }
        Ok(self)
    }

    /// Bind the parameter at a 1-based logical position.
    ///
    /// Positions of virtual parameters only cache the value for the
    /// statement's handlers.
    pub fn set_at(&mut self, slot: usize, value: impl ToValue) -> Result<&mut Self> {
        let value = value.to_value();
        match self.route(slot)? {
            Some(real) => self.bind_real(real, value),
            None => {
                if let Some(virtuals) = self.virtual_parameters.as_mut() {
                    virtuals.put_value(slot, value);
                }
            }
        }
        Ok(self)
    }

    pub fn set_null(&mut self, slot: usize) -> Result<&mut Self> {
        self.set_at(slot, Value::Null)
    }

    /// Forget every bound value, including cached virtual values.
    pub fn clear_parameters(&mut self) {
        self.parameters.clear();
        if let Some(virtuals) = self.virtual_parameters.as_mut() {
            virtuals.clear_values();
        }
    }

    /// Real position for a logical one, `None` for virtual slots.
    fn route(&self, slot: usize) -> Result<Option<usize>> {
        let out_of_range = || Error::InvalidArgument(format!("no parameter at position {slot}"));
        if slot == 0 {
            return Err(out_of_range());
        }
        if let Some(virtuals) = &self.virtual_parameters {
            if virtuals.is_virtual_slot(slot) {
                return Ok(None);
            }
            return virtuals.real_index(slot).map(Some).ok_or_else(out_of_range);
        }
        match &self.query {
            Some(query) if slot > query.parameter_names().len() => Err(out_of_range()),
            _ => Ok(Some(slot)),
        }
    }

    fn bind_real(&mut self, position: usize, value: Value) {
        if self.parameters.len() < position {
            self.parameters.resize(position, None);
        }
        self.parameters[position - 1] = Some(value);
    }

    /// Install virtual parameters on this statement.
    ///
    /// Parameters installed earlier (such as a row window compensation) stay
    /// in effect; their handlers run after the new ones. Values bound so far
    /// move to the positions of the new layout.
    pub fn set_virtual_parameters(&mut self, mut parameters: VirtualParameters) -> Result<&mut Self> {
        let slots = self.require_query()?.parameter_names().len();
        let bound: Vec<(usize, Value)> = (1..=slots)
            .filter_map(|slot| {
                let real = self.route(slot).ok().flatten()?;
                let value = self.parameters.get(real - 1).cloned().flatten()?;
                Some((slot, value))
            })
            .collect();

        if let Some(earlier) = self.virtual_parameters.take() {
            parameters.absorb(earlier);
        }
        if let Some(query) = &self.query {
            parameters.setup(query);
        }
        self.virtual_parameters = Some(parameters);

        self.parameters.clear();
        for (slot, value) in bound {
            self.set_at(slot, value)?;
        }
        Ok(self)
    }

    pub fn virtual_parameters(&self) -> Option<&VirtualParameters> {
        self.virtual_parameters.as_ref()
    }

    /// The cached value of a virtual parameter.
    pub fn virtual_value(&self, name: &str) -> Result<Value> {
        let slots = self.require_query()?.parameter_indices(name);
        if slots.is_empty() {
            return Err(Error::UnknownParameter(name.to_string()));
        }
        self.virtual_parameters
            .as_ref()
            .and_then(|virtuals| slots.iter().find_map(|slot| virtuals.get_value(*slot)))
            .cloned()
            .ok_or_else(|| Error::UndefinedVirtualParameter(name.to_string()))
    }

    /// The cached value of the virtual parameter at a logical position.
    pub fn virtual_value_at(&self, slot: usize) -> Result<Value> {
        self.virtual_parameters
            .as_ref()
            .and_then(|virtuals| virtuals.get_value(slot))
            .cloned()
            .ok_or_else(|| Error::UndefinedVirtualParameter(self.slot_name(slot)))
    }

    fn slot_name(&self, slot: usize) -> String {
        self.query
            .as_ref()
            .and_then(|q| q.parameter_names().get(slot.wrapping_sub(1)).map(|n| n.to_string()))
            .unwrap_or_else(|| format!("#{slot}"))
    }

    /// Read at most `max_rows` rows, counting skipped ones; `None` reads all.
    pub fn set_max_rows(&mut self, max_rows: Option<usize>) {
        self.max_rows = max_rows;
    }

    pub fn max_rows(&self) -> Option<usize> {
        self.max_rows
    }

    /// Drop the first `skip_rows` rows before they reach the processor.
    pub fn set_skip_rows(&mut self, skip_rows: usize) {
        self.skip_rows = skip_rows;
    }

    pub fn skip_rows(&self) -> usize {
        self.skip_rows
    }

    /// Run the virtual parameter handlers and collect the real values.
    fn resolve_parameters(&mut self) -> Result<Vec<Value>> {
        let handlers = self
            .virtual_parameters
            .as_ref()
            .map(VirtualParameters::handlers)
            .unwrap_or_default();
        for handler in handlers {
            handler.handle_values(self)?;
        }

        let expected = match (&self.virtual_parameters, &self.query) {
            (Some(virtuals), _) => {
                if let Some(slot) = virtuals.unresolved_slot() {
                    return Err(Error::UndefinedVirtualParameter(self.slot_name(slot)));
                }
                virtuals.real_count()
            }
            (None, Some(query)) => query.parameter_names().len(),
            (None, None) => self.parameters.len(),
        };

        (0..expected)
            .map(|i| match self.parameters.get(i) {
                Some(Some(value)) => Ok(value.clone()),
                _ => Err(Error::UnboundParameter(i + 1)),
            })
            .collect()
    }

    /// Execute the statement and return the number of affected rows.
    pub fn execute_update(&mut self) -> Result<u64> {
        let params = self.resolve_parameters()?;
        let started = Instant::now();
        let sql = self.sql.as_str();
        let affected = self
            .connection
            .with_native(|native| native.execute(sql, &params).map_err(|e| Error::execution(sql, e)))?;
        trace!(sql, elapsed = ?started.elapsed(), affected, "Executed update");
        Ok(affected)
    }

    /// Execute the statement and stream its rows through `processor`.
    ///
    /// Traversal stops when the processor returns `false`, when it fails,
    /// or when the row window is exhausted.
    pub fn execute_query<P>(&mut self, processor: &mut P) -> Result<FetchSummary>
    where
        P: RowProcessor + ?Sized,
    {
        let params = self.resolve_parameters()?;
        let started = Instant::now();
        let sql = self.sql.as_str();
        let (max_rows, skip_rows) = (self.max_rows, self.skip_rows);

        let mut read = 0usize;
        let mut summary = FetchSummary {
            rows: 0,
            completed: true,
        };
        let mut failure = None;

        if max_rows != Some(0) {
            self.connection.with_native(|native| {
                let mut sink = |row: &Row| -> Result<bool> {
                    read += 1;
                    if read > skip_rows {
                        summary.rows += 1;
                        match processor.process_row(row) {
                            Ok(true) => {}
                            Ok(false) => {
                                summary.completed = false;
                                return Ok(false);
                            }
                            Err(err) => {
                                failure = Some(err);
                                return Ok(false);
                            }
                        }
                    }
                    Ok(max_rows.map_or(true, |max| read < max))
                };
                native
                    .query(sql, &params, &mut sink)
                    .map_err(|e| Error::execution(sql, e))
            })?;
        }

        trace!(sql, elapsed = ?started.elapsed(), rows = summary.rows, "Executed query");
        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

impl fmt::Debug for DbPreparedStatement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbPreparedStatement")
            .field("sql", &self.sql)
            .field("connection", &self.connection.id())
            .field("parameters", &self.parameters)
            .field("virtual_parameters", &self.virtual_parameters)
            .field("max_rows", &self.max_rows)
            .field("skip_rows", &self.skip_rows)
            .finish()
    }
}
