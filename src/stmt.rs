//! Prepared statement handle.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::driver::{Client, ExecResult, Statement};
use crate::error::{Error, Result};
use crate::exec::Binding;
use crate::pool::Pool;
use crate::rows::{Row, Rows};
use crate::tx::TxCore;
use crate::value::Value;

/// A prepared statement.
///
/// A statement prepared on the pool is not tied to a connection: each call
/// checks one out and prepares the query on it. A statement prepared inside a
/// transaction runs on the transaction's connection.
pub struct Stmt<C: Client> {
    sql: Arc<str>,
    target: Target<C>,
    closed: bool,
}

enum Target<C: Client> {
    Pool(Pool<C>),
    Tx {
        core: Arc<TxCore<C>>,
        stmt: Arc<Mutex<C::Stmt>>,
    },
}

impl<C: Client> std::fmt::Debug for Stmt<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stmt").finish_non_exhaustive()
    }
}

impl<C: Client> Stmt<C> {
    pub(crate) fn pooled(sql: &str, pool: Pool<C>) -> Self {
        Self {
            sql: Arc::from(sql),
            target: Target::Pool(pool),
            closed: false,
        }
    }

    pub(crate) fn in_tx(sql: &str, core: Arc<TxCore<C>>, stmt: C::Stmt) -> Self {
        Self {
            sql: Arc::from(sql),
            target: Target::Tx {
                core,
                stmt: Arc::new(Mutex::new(stmt)),
            },
            closed: false,
        }
    }

    /// The statement's query text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidHandle("statement is closed"));
        }
        Ok(())
    }

    /// Execute the statement, returning no rows.
    pub async fn exec(&self, ctx: &Context, params: &[Value]) -> Result<ExecResult> {
        self.check_open()?;
        let params = params.to_vec();
        match &self.target {
            Target::Pool(pool) => {
                let sql = Arc::clone(&self.sql);
                pool.lease(ctx)
                    .await?
                    .run(ctx, move |client| {
                        one_shot(client, &sql, |stmt| stmt.execute(&params))
                    })
                    .await
            }
            Target::Tx { core, stmt } => {
                let stmt = Arc::clone(stmt);
                core.call(ctx, move |_| stmt.lock().execute(&params)).await
            }
        }
    }

    /// Execute the statement, returning rows.
    pub async fn query(&self, ctx: &Context, params: &[Value]) -> Result<Rows<C>> {
        self.check_open()?;
        let params = params.to_vec();
        match &self.target {
            Target::Pool(pool) => {
                let sql = Arc::clone(&self.sql);
                let (lease, rows) = pool
                    .lease(ctx)
                    .await?
                    .open_handle(ctx, move |client| {
                        one_shot(client, &sql, |stmt| stmt.query(&params))
                    })
                    .await?;
                Ok(Rows::new(rows, Binding::pooled(lease)))
            }
            Target::Tx { core, stmt } => {
                let stmt = Arc::clone(stmt);
                let rows = core.call(ctx, move |_| stmt.lock().query(&params)).await?;
                Ok(Rows::new(rows, Binding::Tx(Arc::clone(core))))
            }
        }
    }

    /// Execute the statement, expecting at most one row.
    ///
    /// Errors are deferred until [`Row::scan`].
    pub async fn query_row(&self, ctx: &Context, params: &[Value]) -> Row<C> {
        if let Err(err) = self.check_open() {
            return Row::failed(err);
        }
        let params = params.to_vec();
        match &self.target {
            Target::Pool(pool) => {
                let lease = match pool.lease(ctx).await {
                    Ok(lease) => lease,
                    Err(err) => return Row::failed(err),
                };
                let sql = Arc::clone(&self.sql);
                let opened = lease
                    .open_handle(ctx, move |client| {
                        one_shot(client, &sql, |stmt| Ok(stmt.query_row(&params)))
                    })
                    .await;
                match opened {
                    Ok((lease, row)) => Row::new(row, Binding::pooled(lease)),
                    Err(err) => Row::failed(err),
                }
            }
            Target::Tx { core, stmt } => {
                let stmt = Arc::clone(stmt);
                match core.call(ctx, move |_| Ok(stmt.lock().query_row(&params))).await {
                    Ok(row) => Row::new(row, Binding::Tx(Arc::clone(core))),
                    Err(err) => Row::failed(err),
                }
            }
        }
    }

    /// Close the statement. Closing twice is a no-op.
    pub async fn close(&mut self, ctx: &Context) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Target::Tx { core, stmt } = &self.target {
            let stmt = Arc::clone(stmt);
            core.call(ctx, move |_| stmt.lock().close()).await?;
        }
        self.closed = true;
        Ok(())
    }
}

/// Prepare, run and close a statement in one blocking call.
///
/// The statement is closed before the cursor or row it produced is read, so
/// drivers must keep those valid past the statement's close.
fn one_shot<C, T, F>(client: &C, sql: &str, call: F) -> Result<T>
where
    C: Client,
    F: FnOnce(&mut C::Stmt) -> Result<T>,
{
    let mut stmt = client.prepare(sql)?;
    let result = call(&mut stmt);
    let closed = stmt.close();
    let value = result?;
    closed.map(|()| value)
}
