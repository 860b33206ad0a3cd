//! Virtual statement parameters
//!
//! A virtual parameter occupies a logical slot of a [`Query`] without a
//! placeholder in its SQL. Binding a virtual slot only caches the value;
//! right before the statement executes, the registered handlers receive
//! the statement and turn the cached values into real bindings (or into
//! other statement settings such as a row window).
//!
//! Logical slots are numbered from 1 in declaration order. Real positions
//! are numbered from 1 as well and skip every virtual slot:
//!
//! ```text
//! names:    a   v1   b   v2   c
//! logical:  1   2    3   4    5
//! real:     1   -    2   -    3
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::query::Query;
use crate::statement::DbPreparedStatement;
use crate::value::Value;

/// Resolves virtual parameter values right before a statement executes.
///
/// The handler may read cached values with
/// [`DbPreparedStatement::virtual_value`], set further virtual slots and
/// bind real parameters.
pub trait VirtualParametersHandler: Send + Sync {
    fn handle_values(&self, statement: &mut DbPreparedStatement<'_>) -> Result<()>;
}

impl<F> VirtualParametersHandler for F
where
    F: Fn(&mut DbPreparedStatement<'_>) -> Result<()> + Send + Sync,
{
    fn handle_values(&self, statement: &mut DbPreparedStatement<'_>) -> Result<()> {
        self(statement)
    }
}

/// Slot mapping, cached values and handlers of one statement's virtual
/// parameters.
#[derive(Clone)]
pub struct VirtualParameters {
    names: BTreeSet<String>,
    handlers: Vec<Arc<dyn VirtualParametersHandler>>,
    /// logical slot -> real position, `None` for virtual slots
    mapping: Option<BTreeMap<usize, Option<usize>>>,
    values: HashMap<usize, Value>,
}

impl VirtualParameters {
    /// Virtual parameters resolved by a closure.
    ///
    /// ```ignore
    /// let virtuals = VirtualParameters::new(["total_in"], |stmt| {
    ///     let total = stmt.virtual_value("total_in")?;
    ///     stmt.set("total", total)?;
    ///     Ok(())
    /// });
    /// ```
    pub fn new<I, S, F>(names: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&mut DbPreparedStatement<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::with_handler(names, Arc::new(handler))
    }

    /// Virtual parameters resolved by a shared handler.
    pub fn with_handler<I, S>(names: I, handler: Arc<dyn VirtualParametersHandler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parameters = Self::declared(names);
        parameters.handlers.push(handler);
        parameters
    }

    /// Virtual parameters without a handler; values are only cached.
    pub(crate) fn declared<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            handlers: Vec::new(),
            mapping: None,
            values: HashMap::new(),
        }
    }

    /// Take over the names, handlers and values of `earlier`.
    ///
    /// Handlers of `self` run first. The slot mapping has to be set up again.
    pub(crate) fn absorb(&mut self, earlier: VirtualParameters) {
        self.names.extend(earlier.names);
        self.handlers.extend(earlier.handlers);
        for (slot, value) in earlier.values {
            self.values.entry(slot).or_insert(value);
        }
        self.mapping = None;
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Compute the slot mapping from the query's parameter layout.
    ///
    /// Names the query itself marks virtual are virtual too. Calling this
    /// again after the mapping exists does nothing.
    pub fn setup(&mut self, query: &Query) {
        if self.mapping.is_some() {
            return;
        }
        let mut mapping = BTreeMap::new();
        let mut real = 0;
        for (i, name) in query.parameter_names().into_iter().enumerate() {
            if self.names.contains(name) || query.is_virtual(name) {
                mapping.insert(i + 1, None);
            } else {
                real += 1;
                mapping.insert(i + 1, Some(real));
            }
        }
        self.mapping = Some(mapping);
    }

    pub fn is_set_up(&self) -> bool {
        self.mapping.is_some()
    }

    /// Whether the logical slot is part of the mapping.
    pub fn has_parameter(&self, slot: usize) -> bool {
        self.mapping.as_ref().is_some_and(|m| m.contains_key(&slot))
    }

    /// Real position of a logical slot; `None` for virtual or unknown slots.
    pub fn real_index(&self, slot: usize) -> Option<usize> {
        self.mapping.as_ref().and_then(|m| m.get(&slot).copied().flatten())
    }

    pub fn is_virtual_slot(&self, slot: usize) -> bool {
        matches!(self.mapping.as_ref().and_then(|m| m.get(&slot)), Some(None))
    }

    /// Number of real positions, i.e. placeholders in the SQL.
    pub fn real_count(&self) -> usize {
        self.mapping
            .as_ref()
            .map_or(0, |m| m.values().filter(|real| real.is_some()).count())
    }

    pub fn put_value(&mut self, slot: usize, value: Value) {
        self.values.insert(slot, value);
    }

    pub fn get_value(&self, slot: usize) -> Option<&Value> {
        self.values.get(&slot)
    }

    pub fn has_value(&self, slot: usize) -> bool {
        self.values.contains_key(&slot)
    }

    pub fn clear_values(&mut self) {
        self.values.clear();
    }

    /// The first virtual slot that has no value yet.
    pub fn unresolved_slot(&self) -> Option<usize> {
        self.mapping.as_ref().and_then(|m| {
            m.iter()
                .find(|(slot, real)| real.is_none() && !self.values.contains_key(*slot))
                .map(|(slot, _)| *slot)
        })
    }

    pub(crate) fn handlers(&self) -> Vec<Arc<dyn VirtualParametersHandler>> {
        self.handlers.clone()
    }
}

impl fmt::Debug for VirtualParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualParameters")
            .field("names", &self.names)
            .field("handlers", &self.handlers.len())
            .field("mapping", &self.mapping)
            .field("values", &self.values)
            .finish()
    }
}
