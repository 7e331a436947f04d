//! Racing blocking driver calls against a [`Context`].

use std::sync::Arc;

use crate::context::Context;
use crate::driver::Client;
use crate::error::{Error, Result};
use crate::pool::Lease;
use crate::tx::TxCore;

/// How a raced call ended.
pub(crate) enum Outcome<T> {
    /// The call finished before the context fired.
    Completed(Result<T>),
    /// The caller stopped waiting. The call may still be running.
    Abandoned(Error),
}

/// Run `work` on the blocking pool and wait for it or for `ctx`, whichever
/// comes first.
pub(crate) async fn race<T, F>(ctx: &Context, work: F) -> Outcome<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    race_with(ctx, work, drop).await
}

/// Like [`race`], but hand a result that arrives after the caller gave up to
/// `on_late`.
///
/// If `ctx` is already done the work never starts.
pub(crate) async fn race_with<T, F, L>(ctx: &Context, work: F, on_late: L) -> Outcome<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
    L: FnOnce(Result<T>) + Send + 'static,
{
    if let Some(err) = ctx.err() {
        return Outcome::Abandoned(err);
    }

    let mut handle = tokio::task::spawn_blocking(work);
    let reason = tokio::select! {
        biased;
        joined = &mut handle => {
            return match joined {
                Ok(result) => Outcome::Completed(result),
                Err(e) => Outcome::Abandoned(Error::from(e)),
            };
        }
        reason = ctx.done() => reason,
    };

    tokio::spawn(async move {
        match handle.await {
            Ok(late) => {
                tracing::debug!("abandoned call finished after its caller left");
                on_late(late);
            }
            Err(e) => tracing::warn!(error = %e, "abandoned call did not finish"),
        }
    });
    Outcome::Abandoned(reason)
}

/// Returns true if the error means the caller stopped waiting, leaving the
/// connection behind.
pub(crate) fn is_abandonment(err: &Error) -> bool {
    err.is_cancellation() || matches!(err, Error::Panicked(_))
}

/// What a row, cursor or statement handle runs its calls on.
pub(crate) enum Binding<C: Client> {
    /// A connection checked out for this handle alone. `None` once settled.
    Pooled(Option<Lease<C>>),
    /// A connection owned by a transaction.
    Tx(Arc<TxCore<C>>),
}

impl<C: Client> Binding<C> {
    pub(crate) fn pooled(lease: Lease<C>) -> Self {
        Binding::Pooled(Some(lease))
    }

    /// Run one call for the handle.
    ///
    /// An abandoned call destroys a pooled connection. Through a transaction
    /// the transaction's own failure rules apply.
    pub(crate) async fn call<T, F>(&mut self, ctx: &Context, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Binding::Pooled(lease) => {
                if lease.is_none() {
                    return Err(Error::InvalidHandle("no connection"));
                }
                match race(ctx, work).await {
                    Outcome::Completed(result) => result,
                    Outcome::Abandoned(err) => {
                        if let Some(lease) = lease.take() {
                            lease.abandon(&err);
                        }
                        Err(err)
                    }
                }
            }
            Binding::Tx(core) => core.call(ctx, move |_| work()).await,
        }
    }

    /// The handle is finished with its connection. A pooled connection goes
    /// back to the pool, or is destroyed after a failure that leaves it in
    /// doubt. A transaction keeps its connection.
    pub(crate) fn finish(&mut self, failure: Option<&Error>) -> Result<()> {
        match self {
            Binding::Pooled(lease) => match lease.take() {
                Some(lease) => lease.settle(failure),
                None => Ok(()),
            },
            Binding::Tx(_) => Ok(()),
        }
    }
}
