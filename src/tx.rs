//! Transactions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::driver::{Client, ExecResult, Transaction};
use crate::error::{Error, Result};
use crate::exec::{self, Binding, Outcome};
use crate::pool::Lease;
use crate::rows::{Row, Rows};
use crate::stmt::Stmt;
use crate::value::Value;

/// A transaction on one pooled connection.
///
/// The first call that fails or is cancelled ends the transaction: it is
/// rolled back, its connection is destroyed, and every later call, including
/// `commit` and `rollback`, returns that same error. `NoRows` from a scan
/// counts as a failure too. After a successful commit or rollback every call
/// returns [`Error::TxDone`].
///
/// A call abandoned by its context still holds the transaction on its worker
/// thread, so no rollback is sent; the transaction ends when the connection
/// is closed.
///
/// Calls on a transaction, and on the rows and statements it produced, run
/// one at a time. Dropping a transaction that is still open closes its
/// connection.
pub struct Tx<C: Client> {
    core: Arc<TxCore<C>>,
}

impl<C: Client> std::fmt::Debug for Tx<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx").finish_non_exhaustive()
    }
}

impl<C: Client> Tx<C> {
    pub(crate) fn new(lease: Lease<C>, tx: C::Tx) -> Self {
        Self {
            core: Arc::new(TxCore {
                state: tokio::sync::Mutex::new(TxState::Open {
                    lease,
                    tx: Arc::new(Mutex::new(tx)),
                }),
            }),
        }
    }

    /// Execute a statement that returns no rows.
    pub async fn exec(&self, ctx: &Context, query: &str, params: &[Value]) -> Result<ExecResult> {
        let query = query.to_owned();
        let params = params.to_vec();
        self.core
            .call(ctx, move |tx| tx.execute(&query, &params))
            .await
    }

    /// Execute a query that returns rows.
    pub async fn query(&self, ctx: &Context, query: &str, params: &[Value]) -> Result<Rows<C>> {
        let query = query.to_owned();
        let params = params.to_vec();
        let rows = self
            .core
            .call(ctx, move |tx| tx.query(&query, &params))
            .await?;
        Ok(Rows::new(rows, Binding::Tx(Arc::clone(&self.core))))
    }

    /// Execute a query expected to return at most one row.
    ///
    /// Errors are deferred until [`Row::scan`].
    pub async fn query_row(&self, ctx: &Context, query: &str, params: &[Value]) -> Row<C> {
        let query = query.to_owned();
        let params = params.to_vec();
        match self
            .core
            .call(ctx, move |tx| Ok(tx.query_row(&query, &params)))
            .await
        {
            Ok(row) => Row::new(row, Binding::Tx(Arc::clone(&self.core))),
            Err(err) => Row::failed(err),
        }
    }

    /// Prepare a statement bound to this transaction.
    pub async fn prepare(&self, ctx: &Context, query: &str) -> Result<Stmt<C>> {
        let sql = query.to_owned();
        let stmt = self.core.call(ctx, move |tx| tx.prepare(&sql)).await?;
        Ok(Stmt::in_tx(query, Arc::clone(&self.core), stmt))
    }

    /// Bind an existing statement to this transaction.
    pub async fn stmt(&self, ctx: &Context, stmt: &Stmt<C>) -> Result<Stmt<C>> {
        self.prepare(ctx, stmt.sql()).await
    }

    /// Commit and give the connection back to the pool.
    pub async fn commit(&self, ctx: &Context) -> Result<()> {
        self.core.end(ctx, End::Commit).await
    }

    /// Roll back and give the connection back to the pool.
    pub async fn rollback(&self, ctx: &Context) -> Result<()> {
        self.core.end(ctx, End::Rollback).await
    }

    /// The error that ended the transaction, if it failed.
    pub async fn failure(&self) -> Option<Error> {
        match &*self.core.state.lock().await {
            TxState::Latched(err) => Some(err.clone()),
            TxState::Open { .. } | TxState::Done => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum End {
    Commit,
    Rollback,
}

/// State shared by a transaction and the handles it produced.
pub(crate) struct TxCore<C: Client> {
    state: tokio::sync::Mutex<TxState<C>>,
}

enum TxState<C: Client> {
    Open {
        lease: Lease<C>,
        tx: Arc<Mutex<C::Tx>>,
    },
    Latched(Error),
    Done,
}

impl<C: Client> TxState<C> {
    fn live(&self) -> Result<Arc<Mutex<C::Tx>>> {
        match self {
            TxState::Open { tx, .. } => Ok(Arc::clone(tx)),
            TxState::Latched(err) => Err(err.clone()),
            TxState::Done => Err(Error::TxDone),
        }
    }
}

impl<C: Client> TxCore<C> {
    /// Run one call inside the transaction.
    pub(crate) async fn call<T, F>(&self, ctx: &Context, work: F) -> Result<T>
    where
        F: FnOnce(&mut C::Tx) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut state = self.state.lock().await;
        let tx = state.live()?;
        let outcome = exec::race(ctx, move || work(&mut tx.lock())).await;
        Self::resolve(&mut state, outcome)
    }

    async fn end(&self, ctx: &Context, end: End) -> Result<()> {
        let mut state = self.state.lock().await;
        let tx = state.live()?;
        let outcome = exec::race(ctx, move || {
            let mut tx = tx.lock();
            match end {
                End::Commit => tx.commit(),
                End::Rollback => tx.rollback(),
            }
        })
        .await;

        if let Outcome::Completed(Ok(())) = outcome {
            if let TxState::Open { lease, .. } = std::mem::replace(&mut *state, TxState::Done) {
                lease.release()?;
            }
            tracing::trace!(?end, "transaction finished");
            return Ok(());
        }
        Self::resolve(&mut state, outcome)
    }

    fn resolve<T>(state: &mut TxState<C>, outcome: Outcome<T>) -> Result<T> {
        let err = match outcome {
            Outcome::Completed(Ok(value)) => return Ok(value),
            Outcome::Completed(Err(err)) | Outcome::Abandoned(err) => err,
        };
        Self::fail(state, &err);
        Err(err)
    }

    /// Latch `err`, roll back, and destroy the connection.
    fn fail(state: &mut TxState<C>, err: &Error) {
        let TxState::Open { lease, tx } = std::mem::replace(state, TxState::Latched(err.clone()))
        else {
            return;
        };
        lease.abandon_after(err, move || {
            let Some(mut tx) = tx.try_lock() else {
                tracing::debug!("transaction busy on an abandoned call, skipping rollback");
                return;
            };
            if let Err(e) = tx.rollback() {
                tracing::warn!(error = %e, "rollback of failed transaction failed");
            }
        });
    }
}
