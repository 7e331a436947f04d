//! Admission control: a resizable budget of connection slots.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::context::Context;
use crate::error::{Error, Result};

/// Counting permit set bounding how many connections are checked out.
pub(crate) struct Slots {
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    in_use: AtomicUsize,
    /// Permits to retire as slots come back after a shrink.
    debt: AtomicUsize,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
}

/// One held slot. Dropping it releases the slot exactly once.
pub(crate) struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    slots: Arc<Slots>,
}

impl Slots {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            in_use: AtomicUsize::new(0),
            debt: AtomicUsize::new(0),
            wait_count: AtomicU64::new(0),
            wait_nanos: AtomicU64::new(0),
        })
    }

    /// Wait for a free slot.
    ///
    /// Returns the context error if it fires first; no slot is consumed in that
    /// case. `usage_timeout` bounds the wait independently of the context.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        ctx: &Context,
        usage_timeout: Option<Duration>,
    ) -> Result<Slot> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
            Err(TryAcquireError::NoPermits) => self.wait(ctx, usage_timeout).await?,
        };

        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(Slot {
            permit: Some(permit),
            slots: Arc::clone(self),
        })
    }

    async fn wait(
        &self,
        ctx: &Context,
        usage_timeout: Option<Duration>,
    ) -> Result<OwnedSemaphorePermit> {
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        tracing::trace!("waiting for a free connection slot");

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let result = tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            permit = bounded(acquire, usage_timeout) => permit,
        };

        let waited = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.wait_nanos.fetch_add(waited, Ordering::Relaxed);
        result
    }

    /// Change the slot budget.
    ///
    /// Growing takes effect immediately. Shrinking retires free permits now and
    /// the rest as checked-out slots come back.
    pub(crate) fn resize(&self, capacity: usize) {
        let old = self.capacity.swap(capacity, Ordering::SeqCst);
        if capacity > old {
            let grow = capacity - old;
            let forgiven = take_up_to(&self.debt, grow);
            if grow > forgiven {
                self.semaphore.add_permits(grow - forgiven);
            }
        } else {
            let mut shrink = old - capacity;
            while shrink > 0 {
                match self.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            self.debt.fetch_add(shrink, Ordering::SeqCst);
        }
        tracing::debug!(old, new = capacity, "connection slot budget changed");
    }

    /// Wake every waiter with `PoolClosed` and refuse new acquisitions.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_count(&self) -> u64 {
        self.wait_count.load(Ordering::Relaxed)
    }

    pub(crate) fn wait_duration(&self) -> Duration {
        Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed))
    }

    #[expect(clippy::panic, reason = "over-release is a fatal invariant violation")]
    fn give_back(&self) {
        if self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            panic!("connection slot released more times than it was acquired");
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.slots.give_back();
        if let Some(permit) = self.permit.take() {
            if take_up_to(&self.slots.debt, 1) == 1 {
                permit.forget();
            }
        }
    }
}

async fn bounded<F>(acquire: F, limit: Option<Duration>) -> Result<OwnedSemaphorePermit>
where
    F: Future<Output = core::result::Result<OwnedSemaphorePermit, AcquireError>>,
{
    let acquired = match limit {
        Some(limit) => tokio::time::timeout(limit, acquire)
            .await
            .map_err(|_| Error::TimedOut)?,
        None => acquire.await,
    };
    acquired.map_err(|_| Error::PoolClosed)
}

/// Subtract up to `n` from `counter`, returning how much was taken.
fn take_up_to(counter: &AtomicUsize, n: usize) -> usize {
    let prev = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(n)))
        .unwrap_or_else(|d| d);
    prev.min(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let slots = Slots::new(2);
        let ctx = Context::background();
        let a = slots.acquire(&ctx, None).await.unwrap();
        let b = slots.acquire(&ctx, None).await.unwrap();
        assert_eq!(slots.in_use(), 2);
        drop(a);
        drop(b);
        assert_eq!(slots.in_use(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait_consumes_nothing() {
        let slots = Slots::new(1);
        let held = slots.acquire(&Context::background(), None).await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = slots.acquire(&ctx, None).await.err().unwrap();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(slots.in_use(), 1);
        assert_eq!(slots.wait_count(), 1);

        drop(held);
        let again = slots.acquire(&Context::background(), None).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_usage_timeout() {
        let slots = Slots::new(1);
        let _held = slots.acquire(&Context::background(), None).await.unwrap();
        let err = slots
            .acquire(&Context::background(), Some(Duration::from_millis(10)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::TimedOut));
    }

    #[tokio::test]
    async fn test_closed_slots() {
        let slots = Slots::new(1);
        slots.close();
        let err = slots.acquire(&Context::background(), None).await.err().unwrap();
        assert!(matches!(err, Error::PoolClosed));
    }

    #[tokio::test]
    async fn test_shrink_while_checked_out() {
        let slots = Slots::new(2);
        let ctx = Context::background();
        let a = slots.acquire(&ctx, None).await.unwrap();
        let b = slots.acquire(&ctx, None).await.unwrap();

        slots.resize(1);
        drop(a);
        // The returned permit pays the shrink; the budget is full.
        let short = Context::background().with_timeout(Duration::from_millis(10));
        assert!(slots.acquire(&short, None).await.is_err());

        drop(b);
        assert!(slots.acquire(&ctx, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_grow() {
        let slots = Slots::new(1);
        let ctx = Context::background();
        let _a = slots.acquire(&ctx, None).await.unwrap();
        slots.resize(2);
        assert_eq!(slots.capacity(), 2);
        let short = Context::background().with_timeout(Duration::from_millis(10));
        assert!(slots.acquire(&short, None).await.is_ok());
    }

    #[test]
    #[should_panic(expected = "released more times")]
    fn test_over_release_panics() {
        let slots = Slots::new(1);
        slots.give_back();
    }
}
