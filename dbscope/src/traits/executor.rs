//! Statement execution shortcuts

use crate::connection::DbConnection;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::row::Row;
use crate::statement::FetchSummary;
use crate::traits::{CollectRows, FromValue, ResultHandler, RowProcessor, StatementHandler, Transactional};

/// Prepare, bind and execute in one call.
///
/// Every method runs on a connection obtained through
/// [`Transactional::with_connection`], so on a [`QueryManager`](crate::QueryManager)
/// each call leases a connection and gives it back before returning.
///
/// # Example
///
/// ```ignore
/// use dbscope::{bind, Executor, NoParameters, Query};
///
/// let count: Option<i64> = manager.execute_get_first(
///     &Query::new("SELECT COUNT(*) FROM product"),
///     NoParameters,
/// )?;
///
/// let query = Query::new("SELECT name FROM product WHERE price > ?").parameter("min");
/// let rows = manager.execute_fetch_rows(&query, bind(|s| {
///     s.set("min", 10)?;
///     Ok(())
/// }))?;
/// ```
pub trait Executor: Transactional {
    /// Execute SQL without parameters and return the affected row count.
    fn execute_update(&self, sql: &str) -> Result<u64> {
        self.with_connection(|conn| conn.prepare(sql).execute_update())
    }

    fn execute_update_query<H>(&self, query: &Query, handler: H) -> Result<u64>
    where
        H: StatementHandler,
    {
        self.with_connection(|conn| {
            let mut statement = conn.prepare_query(query)?;
            handler.perform_update(&mut statement)
        })
    }

    /// Whether the query yields at least one row.
    fn execute_has_result_rows<H>(&self, query: &Query, handler: H) -> Result<bool>
    where
        H: StatementHandler,
    {
        let mut found = false;
        self.stream(query, handler, &mut |_row: &Row| -> Result<bool> {
            found = true;
            Ok(false)
        })?;
        Ok(found)
    }

    /// The first column of the first row, converted; `None` without rows.
    fn execute_get_first<T, H>(&self, query: &Query, handler: H) -> Result<Option<T>>
    where
        T: FromValue,
        H: StatementHandler,
    {
        self.execute_fetch_first(query, handler)?
            .map(|row| {
                let value = row
                    .into_values()
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::ColumnNotFound("#0".to_string()))?;
                T::from_value(value)
            })
            .transpose()
    }

    /// The first row, if any.
    fn execute_fetch_first<H>(&self, query: &Query, handler: H) -> Result<Option<Row>>
    where
        H: StatementHandler,
    {
        let mut first = None;
        self.stream(query, handler, &mut |row: &Row| -> Result<bool> {
            first = Some(row.clone());
            Ok(false)
        })?;
        Ok(first)
    }

    /// Stream every row through `processor`.
    ///
    /// Returns `false` when the processor stopped the traversal early.
    fn execute_fetch_all<P, H>(&self, query: &Query, processor: &mut P, handler: H) -> Result<bool>
    where
        P: RowProcessor + ?Sized,
        H: StatementHandler,
    {
        Ok(self.stream(query, handler, processor)?.completed)
    }

    /// Every row, collected in memory.
    fn execute_fetch_rows<H>(&self, query: &Query, handler: H) -> Result<Vec<Row>>
    where
        H: StatementHandler,
    {
        self.execute_query(query, CollectRows::new(), handler)
    }

    /// Stream every row through `result_handler` and return its conclusion.
    fn execute_query<R, H>(&self, query: &Query, mut result_handler: R, handler: H) -> Result<R::Output>
    where
        R: ResultHandler,
        H: StatementHandler,
    {
        let summary = self.stream(query, handler, &mut result_handler)?;
        result_handler.conclude(&summary)
    }

    #[doc(hidden)]
    fn stream<P, H>(&self, query: &Query, handler: H, processor: &mut P) -> Result<FetchSummary>
    where
        P: RowProcessor + ?Sized,
        H: StatementHandler,
    {
        self.with_connection(|conn| {
            let mut statement = conn.prepare_query(query)?;
            handler.perform_query(&mut statement, processor)
        })
    }
}

impl Executor for DbConnection {}
