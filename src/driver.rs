//! The blocking client interface the pool wraps.
//!
//! A driver exposes plain synchronous calls. The pool never interrupts them:
//! each call runs on the blocking thread pool while the caller races it
//! against its [`Context`](crate::Context). A connection whose call was
//! abandoned is closed through [`Client::close`] from another thread while the
//! abandoned call may still be running, so `close` must be callable
//! concurrently with any other method on the same client.

use crate::error::Result;
use crate::value::Value;

/// Summary of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Number of rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// Identifier generated by the last insert, if the database reports one.
    pub last_insert_id: Option<i64>,
}

/// Opens client connections from a data source name.
pub trait Driver: Send + Sync + 'static {
    /// The connection type produced by this driver.
    type Client: Client;

    /// Open one connection.
    fn open(&self, dsn: &str) -> Result<Self::Client>;
}

/// One live connection to the database.
pub trait Client: Send + Sync + 'static {
    /// Deferred single-row result.
    type Row: RowSource;
    /// Multi-row cursor.
    type Rows: Cursor;
    /// Prepared statement.
    type Stmt: Statement<Row = Self::Row, Rows = Self::Rows>;
    /// Open transaction.
    type Tx: Transaction<Row = Self::Row, Rows = Self::Rows, Stmt = Self::Stmt>;

    /// Verify the connection is alive.
    fn ping(&self) -> Result<()>;

    /// Execute a statement that returns no rows.
    fn execute(&self, query: &str, params: &[Value]) -> Result<ExecResult>;

    /// Execute a query expected to return at most one row.
    ///
    /// Errors are deferred until [`RowSource::scan`].
    fn query_row(&self, query: &str, params: &[Value]) -> Self::Row;

    /// Execute a query that returns rows.
    fn query(&self, query: &str, params: &[Value]) -> Result<Self::Rows>;

    /// Prepare a statement for later execution.
    fn prepare(&self, query: &str) -> Result<Self::Stmt>;

    /// Start a transaction.
    fn begin(&self) -> Result<Self::Tx>;

    /// Close the connection. Called at most once by the pool.
    fn close(&self) -> Result<()>;
}

/// Result of a single-row query.
pub trait RowSource: Send + 'static {
    /// Read the row's column values, or the deferred query error.
    ///
    /// Returns [`Error::NoRows`](crate::Error::NoRows) when nothing matched.
    fn scan(self) -> Result<Vec<Value>>;
}

/// Cursor over a multi-row result set.
pub trait Cursor: Send + 'static {
    /// Move to the next row. Returns false when exhausted or on error.
    fn advance(&mut self) -> bool;

    /// Read the current row's column values.
    fn scan(&mut self) -> Result<Vec<Value>>;

    /// Column names of the result set.
    fn columns(&self) -> Result<Vec<String>>;

    /// The error, if any, that stopped iteration.
    fn err(&self) -> Result<()>;

    /// Release the cursor.
    fn close(&mut self) -> Result<()>;
}

/// Prepared statement.
///
/// Rows and cursors a statement produced must stay readable after the
/// statement is closed; the pool closes pooled statements right after use.
pub trait Statement: Send + 'static {
    /// Single-row result type.
    type Row: RowSource;
    /// Multi-row cursor type.
    type Rows: Cursor;

    /// Execute with parameters, returning no rows.
    fn execute(&mut self, params: &[Value]) -> Result<ExecResult>;

    /// Execute with parameters, returning rows.
    fn query(&mut self, params: &[Value]) -> Result<Self::Rows>;

    /// Execute with parameters, returning at most one row.
    fn query_row(&mut self, params: &[Value]) -> Self::Row;

    /// Release the statement.
    fn close(&mut self) -> Result<()>;
}

/// Open transaction on one connection.
pub trait Transaction: Send + 'static {
    /// Single-row result type.
    type Row: RowSource;
    /// Multi-row cursor type.
    type Rows: Cursor;
    /// Prepared statement type.
    type Stmt: Statement<Row = Self::Row, Rows = Self::Rows>;

    /// Execute a statement that returns no rows.
    fn execute(&mut self, query: &str, params: &[Value]) -> Result<ExecResult>;

    /// Execute a query that returns rows.
    fn query(&mut self, query: &str, params: &[Value]) -> Result<Self::Rows>;

    /// Execute a query expected to return at most one row.
    fn query_row(&mut self, query: &str, params: &[Value]) -> Self::Row;

    /// Prepare a statement bound to this transaction.
    fn prepare(&mut self, query: &str) -> Result<Self::Stmt>;

    /// Commit the transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll the transaction back.
    fn rollback(&mut self) -> Result<()>;
}
