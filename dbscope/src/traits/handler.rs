//! Statement and result hooks

use crate::error::Result;
use crate::row::Row;
use crate::statement::{DbPreparedStatement, FetchSummary};

/// Hook points around the execution of a prepared statement.
///
/// [`set_parameters`](Self::set_parameters) binds the statement's values
/// and does nothing by default. The `perform_*` methods bind, then execute
/// in update or query mode, so a call site only swaps the binding step.
pub trait StatementHandler {
    fn set_parameters(&self, _statement: &mut DbPreparedStatement<'_>) -> Result<()> {
        Ok(())
    }

    fn perform_update(&self, statement: &mut DbPreparedStatement<'_>) -> Result<u64> {
        self.set_parameters(statement)?;
        statement.execute_update()
    }

    fn perform_query<P>(&self, statement: &mut DbPreparedStatement<'_>, processor: &mut P) -> Result<FetchSummary>
    where
        P: RowProcessor + ?Sized,
    {
        self.set_parameters(statement)?;
        statement.execute_query(processor)
    }
}

/// A handler that binds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoParameters;

impl StatementHandler for NoParameters {}

/// A handler binding parameters with a closure, see [`bind`].
#[derive(Clone, Copy)]
pub struct BindParameters<F>(F);

impl<F> StatementHandler for BindParameters<F>
where
    F: Fn(&mut DbPreparedStatement<'_>) -> Result<()>,
{
    fn set_parameters(&self, statement: &mut DbPreparedStatement<'_>) -> Result<()> {
        (self.0)(statement)
    }
}

/// Bind parameters with a closure.
///
/// ```ignore
/// use dbscope::{bind, Executor, Query};
///
/// let query = Query::new("DELETE FROM session WHERE user_id = ?").parameter("user_id");
/// manager.execute_update_query(&query, bind(|stmt| {
///     stmt.set("user_id", user_id)?;
///     Ok(())
/// }))?;
/// ```
pub fn bind<F>(f: F) -> BindParameters<F>
where
    F: Fn(&mut DbPreparedStatement<'_>) -> Result<()>,
{
    BindParameters(f)
}

/// Receives the rows of a query one at a time, in cursor order.
///
/// Returning `false` stops the traversal. The processor only sees each row
/// and never drives the cursor itself.
pub trait RowProcessor {
    fn process_row(&mut self, row: &Row) -> Result<bool>;
}

impl<F> RowProcessor for F
where
    F: FnMut(&Row) -> Result<bool>,
{
    fn process_row(&mut self, row: &Row) -> Result<bool> {
        self(row)
    }
}

/// A row processor that derives a value once the traversal is over.
pub trait ResultHandler: RowProcessor {
    type Output;

    /// Called once after the last row was processed.
    fn conclude(&mut self, summary: &FetchSummary) -> Result<Self::Output>;
}

/// Collects every row.
#[derive(Debug, Clone, Default)]
pub struct CollectRows {
    rows: Vec<Row>,
}

impl CollectRows {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RowProcessor for CollectRows {
    fn process_row(&mut self, row: &Row) -> Result<bool> {
        self.rows.push(row.clone());
        Ok(true)
    }
}

impl ResultHandler for CollectRows {
    type Output = Vec<Row>;

    fn conclude(&mut self, _summary: &FetchSummary) -> Result<Vec<Row>> {
        Ok(std::mem::take(&mut self.rows))
    }
}
