//! Parametrized queries and their parameter layout

use std::collections::BTreeSet;

/// A SQL statement together with the names of its `?` placeholders.
///
/// The declared names are the statement's *logical* parameter slots, in the
/// order the placeholders appear. A name may repeat when one value feeds
/// several placeholders; [`parameter_indices`](Self::parameter_indices)
/// returns all of its slots.
///
/// Names marked virtual don't correspond to a placeholder at all: their
/// values are cached by the statement and handed to a
/// [`VirtualParametersHandler`](crate::VirtualParametersHandler) right
/// before execution.
///
/// # Example
///
/// ```ignore
/// use dbscope::Query;
///
/// let query = Query::new("SELECT id, name FROM product WHERE price > ? ORDER BY id")
///     .parameter("min_price")
///     .limit_offset("LIMIT ? OFFSET ?", "limit", Some("offset"));
///
/// assert_eq!(query.parameter_indices("offset"), vec![3]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    sql: String,
    parameters: Vec<String>,
    virtual_parameters: BTreeSet<String>,
    window: Option<Window>,
}

/// Trailing LIMIT/OFFSET clause whose values are statement parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Window {
    clause: String,
    limit: String,
    offset: Option<String>,
}

impl Query {
    /// Create a new query with the given SQL.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
            virtual_parameters: BTreeSet::new(),
            window: None,
        }
    }

    /// Declare the next placeholder's parameter name.
    pub fn parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(name.into());
        self
    }

    /// Declare several placeholder names in order.
    pub fn parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare a virtual parameter.
    ///
    /// The name occupies a logical slot but no placeholder in the SQL.
    pub fn virtual_parameter(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.parameters.push(name.clone());
        self.virtual_parameters.insert(name);
        self
    }

    /// Append a parametrized row window.
    ///
    /// `clause` is added to the end of the SQL (for example `LIMIT ? OFFSET ?`)
    /// when the driver can bind limit parameters. Otherwise the clause is left
    /// out, the names become virtual and the window is applied while the rows
    /// are streamed.
    pub fn limit_offset(
        mut self,
        clause: impl Into<String>,
        limit: impl Into<String>,
        offset: Option<&str>,
    ) -> Self {
        self.window = Some(Window {
            clause: clause.into(),
            limit: limit.into(),
            offset: offset.map(str::to_string),
        });
        self
    }

    /// Get the SQL string, without any row window clause.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// All logical parameter names in slot order, window names last.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.logical_names().collect()
    }

    pub fn has_parameters(&self) -> bool {
        self.logical_names().next().is_some()
    }

    /// Every 1-based logical slot carrying `name`; empty when it isn't declared.
    pub fn parameter_indices(&self, name: &str) -> Vec<usize> {
        self.logical_names()
            .enumerate()
            .filter(|(_, candidate)| *candidate == name)
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub fn is_virtual(&self, name: &str) -> bool {
        self.virtual_parameters.contains(name)
    }

    pub fn virtual_parameter_names(&self) -> impl Iterator<Item = &str> {
        self.virtual_parameters.iter().map(String::as_str)
    }

    pub fn limit_parameter(&self) -> Option<&str> {
        self.window.as_ref().map(|w| w.limit.as_str())
    }

    pub fn offset_parameter(&self) -> Option<&str> {
        self.window.as_ref().and_then(|w| w.offset.as_deref())
    }

    fn logical_names(&self) -> impl Iterator<Item = &str> {
        let window = self
            .window
            .iter()
            .flat_map(|w| std::iter::once(w.limit.as_str()).chain(w.offset.as_deref()));
        self.parameters.iter().map(String::as_str).chain(window)
    }

    /// Fold the row window into a plain layout for one driver.
    ///
    /// With `bind_window` the clause is appended to the SQL and its names
    /// bound like any other parameter; without it the names are marked
    /// virtual and the SQL is left untouched.
    pub(crate) fn flatten(&self, bind_window: bool) -> Query {
        let mut flat = Query {
            sql: self.sql.clone(),
            parameters: self.logical_names().map(str::to_string).collect(),
            virtual_parameters: self.virtual_parameters.clone(),
            window: None,
        };
        if let Some(window) = &self.window {
            if bind_window {
                flat.sql = format!("{} {}", self.sql.trim_end(), window.clause.trim());
            } else {
                flat.virtual_parameters.insert(window.limit.clone());
                flat.virtual_parameters.extend(window.offset.iter().cloned());
            }
        }
        flat
    }
}
