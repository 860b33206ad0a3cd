//! Core traits for dbscope

mod executor;
mod from_value;
mod handler;
mod to_value;
mod transactional;

pub use executor::Executor;
pub use from_value::FromValue;
pub use handler::{bind, BindParameters, CollectRows, NoParameters, ResultHandler, RowProcessor, StatementHandler};
pub use to_value::ToValue;
pub use transactional::{IsolationLevel, Transactional};

pub(crate) use transactional::run_in_transaction;
