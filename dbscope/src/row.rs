//! Streamed result rows

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::traits::FromValue;
use crate::value::Value;

/// One row of a result set.
///
/// Rows are handed to a [`RowProcessor`](crate::RowProcessor) one at a time
/// while the cursor moves forward. Column names are shared between all rows
/// of the same result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row from its column names and values.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Position of a column, matched exactly first and then ignoring ASCII case.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(column)))
    }

    /// Get the raw value of a column by name.
    pub fn get_value(&self, column: &str) -> Result<&Value> {
        self.column_index(column)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))
    }

    /// Get a typed value of a column by name.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        T::from_value(self.get_value(column)?.clone())
    }

    /// Get a typed value by 0-based position.
    pub fn get_at<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| Error::ColumnNotFound(format!("#{index}")))?;
        T::from_value(value.clone())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
