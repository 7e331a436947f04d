//! Row and cursor handles.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::driver::{Client, Cursor, RowSource};
use crate::error::{Error, Result};
use crate::exec::{Binding, is_abandonment};
use crate::row::FromRow;

/// Result of a single-row query.
///
/// Any error from the query itself is held back and returned by
/// [`Row::scan`]. A pooled connection stays checked out until the row is
/// scanned.
pub struct Row<C: Client> {
    row: Option<C::Row>,
    binding: Option<Binding<C>>,
    err: Option<Error>,
}

impl<C: Client> Row<C> {
    pub(crate) fn new(row: C::Row, binding: Binding<C>) -> Self {
        Self {
            row: Some(row),
            binding: Some(binding),
            err: None,
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self {
            row: None,
            binding: None,
            err: Some(err),
        }
    }

    /// Decode the row.
    ///
    /// Returns [`Error::NoRows`] when the query matched nothing. A row can be
    /// scanned once; the connection is given back afterwards.
    pub async fn scan<T: FromRow>(&mut self, ctx: &Context) -> Result<T> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let row = self.row.take().ok_or(Error::InvalidHandle("no row"))?;
        let mut binding = self.binding.take().ok_or(Error::InvalidHandle("no pool"))?;

        let result = binding.call(ctx, move || row.scan()).await;
        binding.finish(result.as_ref().err())?;
        T::from_row(result?)
    }
}

/// Cursor over the rows of a query.
///
/// The connection stays checked out until [`Rows::close`]. Dropping an
/// unclosed cursor destroys its pooled connection, and so does closing one
/// after a scan or column call failed with a driver error.
pub struct Rows<C: Client> {
    cursor: Option<Arc<Mutex<C::Rows>>>,
    binding: Binding<C>,
    err: Option<Error>,
    failure: Option<Error>,
}

impl<C: Client> std::fmt::Debug for Rows<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows").finish_non_exhaustive()
    }
}

impl<C: Client> Rows<C> {
    pub(crate) fn new(cursor: C::Rows, binding: Binding<C>) -> Self {
        Self {
            cursor: Some(Arc::new(Mutex::new(cursor))),
            binding,
            err: None,
            failure: None,
        }
    }

    fn live(&self) -> Result<Arc<Mutex<C::Rows>>> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        self.cursor
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::InvalidHandle("rows are closed"))
    }

    fn latch(&mut self, err: &Error) {
        if err.poisons_connection() && self.failure.is_none() {
            self.failure = Some(err.clone());
        }
        if is_abandonment(err) && self.err.is_none() {
            self.err = Some(err.clone());
        }
    }

    /// Move to the next row.
    ///
    /// Returns false when the rows are exhausted, closed, or the call failed;
    /// check [`Rows::err`] to tell them apart.
    pub async fn advance(&mut self, ctx: &Context) -> bool {
        let Ok(cursor) = self.live() else {
            return false;
        };
        match self.binding.call(ctx, move || Ok(cursor.lock().advance())).await {
            Ok(more) => more,
            Err(err) => {
                self.err = Some(err);
                false
            }
        }
    }

    /// Decode the current row.
    pub async fn scan<T: FromRow>(&mut self, ctx: &Context) -> Result<T> {
        let cursor = self.live()?;
        let result = self.binding.call(ctx, move || cursor.lock().scan()).await;
        if let Err(err) = &result {
            self.latch(err);
        }
        T::from_row(result?)
    }

    /// Column names of the result set.
    pub async fn columns(&mut self, ctx: &Context) -> Result<Vec<String>> {
        let cursor = self.live()?;
        let result = self.binding.call(ctx, move || cursor.lock().columns()).await;
        if let Err(err) = &result {
            self.latch(err);
        }
        result
    }

    /// The error that ended iteration, if any.
    pub fn err(&self) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match &self.cursor {
            Some(cursor) => cursor.lock().err(),
            None => Ok(()),
        }
    }

    /// Close the cursor and give the connection back.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self, ctx: &Context) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let Some(cursor) = self.cursor.take() else {
            return Ok(());
        };

        let result = self.binding.call(ctx, move || cursor.lock().close()).await;
        if let Err(err) = &result {
            self.latch(err);
        }
        self.binding
            .finish(result.as_ref().err().or(self.failure.as_ref()))?;
        result
    }
}
