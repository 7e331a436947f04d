//! Bounded connection pool with per-operation cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;

use crate::context::Context;
use crate::driver::{Client, Driver, ExecResult, Statement};
use crate::error::{Error, Result};
use crate::exec::{self, Binding, Outcome};
use crate::opts::Opts;
use crate::rows::{Row, Rows};
use crate::slot::{Slot, Slots};
use crate::stmt::Stmt;
use crate::tx::Tx;
use crate::value::Value;

type Factory<C> = Arc<dyn Fn() -> Result<C> + Send + Sync>;

/// A pool of blocking database connections.
///
/// Every operation takes a [`Context`]. The blocking driver call runs on the
/// blocking thread pool; if the context fires first the caller gets the
/// context error at once and the connection that was in use is destroyed
/// rather than returned.
///
/// Cloning a pool is cheap and yields a handle to the same pool.
///
/// # Example
///
/// ```ignore
/// let pool = Pool::open(driver, "postgres://localhost/app?pool_max_open_conns=4")?;
/// let ctx = Context::background().with_timeout(Duration::from_secs(1));
///
/// pool.exec(&ctx, "INSERT INTO t VALUES ($1)", &params![42]).await?;
/// let (n,): (i64,) = pool.query_row(&ctx, "SELECT n FROM t", &[]).await.scan(&ctx).await?;
/// ```
pub struct Pool<C: Client> {
    shared: Arc<Shared<C>>,
}

impl<C: Client> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Client> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Current slot budget.
    pub max_open_connections: usize,
    /// Connections checked out right now.
    pub in_use: usize,
    /// Connections waiting in the idle buffer.
    pub idle: usize,
    /// Acquisitions that had to wait for a slot.
    pub wait_count: u64,
    /// Total time spent waiting for slots.
    pub wait_duration: Duration,
    /// Connections opened by the factory.
    pub connections_created: u64,
    /// Connections closed by the pool.
    pub connections_destroyed: u64,
    /// Operations abandoned because their context fired.
    pub cancelled: u64,
}

impl PoolStats {
    /// Connections currently open, in use or idle.
    pub fn open_connections(&self) -> usize {
        self.in_use + self.idle
    }
}

impl<C: Client> Pool<C> {
    /// Create a pool that opens connections with `factory`.
    pub fn new<F>(opts: Opts, factory: F) -> Result<Self>
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        opts.validate()?;

        let shared = Arc::new(Shared {
            factory: Arc::new(factory),
            slots: Slots::new(opts.max_open_conns),
            idle: Idle::new(
                opts.max_idle_conns,
                opts.max_idle_conns.min(opts.max_open_conns),
            ),
            max_idle: opts.max_idle_conns,
            usage_timeout: RwLock::new(opts.usage_timeout),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        });

        tracing::info!(
            max_open = opts.max_open_conns,
            max_idle = opts.max_idle_conns,
            "connection pool created"
        );

        Ok(Self { shared })
    }

    /// Create a pool whose connections come from `driver`.
    ///
    /// `pool_*` query parameters of a URL data source name configure the pool
    /// (see [`Opts`]); the rest of the DSN is handed to the driver. No
    /// connection is opened until the first operation.
    pub fn open<D>(driver: D, dsn: &str) -> Result<Self>
    where
        D: Driver<Client = C>,
    {
        let opts = Opts::try_from(dsn)?;
        let dsn = opts.dsn.clone();
        Self::new(opts, move || driver.open(&dsn))
    }

    /// Verify a connection to the database is alive.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.lease(ctx).await?.run(ctx, |client| client.ping()).await
    }

    /// Execute a statement that returns no rows.
    pub async fn exec(&self, ctx: &Context, query: &str, params: &[Value]) -> Result<ExecResult> {
        let query = query.to_owned();
        let params = params.to_vec();
        self.lease(ctx)
            .await?
            .run(ctx, move |client| client.execute(&query, &params))
            .await
    }

    /// Execute a query expected to return at most one row.
    ///
    /// Always returns a row handle; errors are deferred until [`Row::scan`].
    pub async fn query_row(&self, ctx: &Context, query: &str, params: &[Value]) -> Row<C> {
        let lease = match self.lease(ctx).await {
            Ok(lease) => lease,
            Err(err) => return Row::failed(err),
        };
        let query = query.to_owned();
        let params = params.to_vec();
        match lease
            .open_handle(ctx, move |client| Ok(client.query_row(&query, &params)))
            .await
        {
            Ok((lease, row)) => Row::new(row, Binding::pooled(lease)),
            Err(err) => Row::failed(err),
        }
    }

    /// Execute a query that returns rows.
    ///
    /// The connection stays checked out until [`Rows::close`].
    pub async fn query(&self, ctx: &Context, query: &str, params: &[Value]) -> Result<Rows<C>> {
        let query = query.to_owned();
        let params = params.to_vec();
        let (lease, rows) = self
            .lease(ctx)
            .await?
            .open_handle(ctx, move |client| client.query(&query, &params))
            .await?;
        Ok(Rows::new(rows, Binding::pooled(lease)))
    }

    /// Prepare a statement.
    ///
    /// The statement is validated once here and prepared again on whichever
    /// connection each later call checks out.
    pub async fn prepare(&self, ctx: &Context, query: &str) -> Result<Stmt<C>> {
        let sql = query.to_owned();
        self.lease(ctx)
            .await?
            .run(ctx, move |client| client.prepare(&sql)?.close())
            .await?;
        Ok(Stmt::pooled(query, self.clone()))
    }

    /// Start a transaction. The transaction holds one connection until it is
    /// committed, rolled back, or fails.
    pub async fn begin(&self, ctx: &Context) -> Result<Tx<C>> {
        let (lease, tx) = self
            .lease(ctx)
            .await?
            .open_handle(ctx, |client| client.begin())
            .await?;
        Ok(Tx::new(lease, tx))
    }

    /// Close the pool and every idle connection.
    ///
    /// Checked-out connections are closed when they come back. Operations
    /// started afterwards fail with [`Error::PoolClosed`], and so does a
    /// second call to `close`.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Returns true once [`Pool::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.shared.idle.is_closed()
    }

    /// Change how many connections may be checked out at once.
    ///
    /// Lowering the limit never interrupts checked-out connections; the new
    /// limit applies as they come back. Idle connections above the new limit
    /// are closed. Values below 1 are raised to 1.
    pub fn set_max_open_connections(&self, n: usize) {
        let n = n.max(1);
        self.shared.slots.resize(n);
        let shed = self.shared.idle.set_limit(self.shared.max_idle.min(n));
        if !shed.is_empty() {
            tracing::debug!(count = shed.len(), "closing surplus idle connections");
        }
        for conn in shed {
            self.shared.discard(conn);
        }
    }

    /// Bound how long an operation waits for a free slot, independently of
    /// its context. `None` removes the bound.
    pub fn set_usage_timeout(&self, timeout: Option<Duration>) {
        *self.shared.usage_timeout.write() = timeout;
    }

    /// Pool statistics.
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            max_open_connections: shared.slots.capacity(),
            in_use: shared.slots.in_use(),
            idle: shared.idle.len(),
            wait_count: shared.slots.wait_count(),
            wait_duration: shared.slots.wait_duration(),
            connections_created: shared.created.load(Ordering::Relaxed),
            connections_destroyed: shared.destroyed.load(Ordering::Relaxed),
            cancelled: shared.cancelled.load(Ordering::Relaxed),
        }
    }

    pub(crate) async fn lease(&self, ctx: &Context) -> Result<Lease<C>> {
        self.shared.acquire(ctx).await
    }
}

struct Shared<C: Client> {
    factory: Factory<C>,
    slots: Arc<Slots>,
    idle: Idle<Arc<C>>,
    max_idle: usize,
    usage_timeout: RwLock<Option<Duration>>,
    created: AtomicU64,
    destroyed: AtomicU64,
    cancelled: AtomicU64,
}

impl<C: Client> Shared<C> {
    async fn acquire(self: &Arc<Self>, ctx: &Context) -> Result<Lease<C>> {
        if self.idle.is_closed() {
            return Err(Error::PoolClosed);
        }

        let usage_timeout = *self.usage_timeout.read();
        let slot = self.slots.acquire(ctx, usage_timeout).await?;
        let conn = match self.idle.pop()? {
            Some(conn) => conn,
            None => self.connect(ctx).await?,
        };

        tracing::trace!(in_use = self.slots.in_use(), "connection checked out");
        Ok(Lease {
            conn: Some(conn),
            _slot: slot,
            shared: Arc::clone(self),
        })
    }

    async fn connect(self: &Arc<Self>, ctx: &Context) -> Result<Arc<C>> {
        let factory = Arc::clone(&self.factory);
        let shared = Arc::clone(self);
        let outcome = exec::race_with(
            ctx,
            move || (*factory)(),
            move |late| {
                if let Ok(conn) = late {
                    shared.created.fetch_add(1, Ordering::Relaxed);
                    shared.discard(Arc::new(conn));
                }
            },
        )
        .await;

        match outcome {
            Outcome::Completed(result) => {
                let conn = result?;
                self.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("opened new connection");
                Ok(Arc::new(conn))
            }
            Outcome::Abandoned(err) => {
                self.note_abandoned(&err);
                Err(err)
            }
        }
    }

    fn check_in(&self, conn: Option<Arc<C>>) -> Result<()> {
        if let Some(rejected) = self.idle.check_in(conn)? {
            self.discard(rejected);
        }
        Ok(())
    }

    fn discard(&self, conn: Arc<C>) {
        self.discard_after(conn, || {});
    }

    /// Close `conn` on the blocking pool after running `before`, without
    /// waiting for either.
    fn discard_after<F>(&self, conn: Arc<C>, before: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        let teardown = move || {
            before();
            if let Err(e) = conn.close() {
                tracing::warn!(error = %e, "failed to close connection");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(teardown)),
            Err(_) => teardown(),
        }
    }

    fn note_abandoned(&self, err: &Error) {
        if err.is_cancellation() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn close(&self) -> Result<()> {
        let drained = self.idle.close()?;
        self.slots.close();
        let count = drained.len();
        for conn in drained {
            self.discard(conn);
        }
        tracing::info!(destroyed = count, "connection pool closed");
        Ok(())
    }
}

impl<C: Client> Drop for Shared<C> {
    fn drop(&mut self) {
        if let Ok(drained) = self.idle.close() {
            for conn in drained {
                self.discard(conn);
            }
        }
    }
}

/// A checked-out connection together with the slot that admitted it.
///
/// A lease ends exactly once: [`Lease::release`] returns the connection to the
/// pool, [`Lease::destroy`] closes it. Dropping an unsettled lease destroys
/// the connection, since its state is unknown.
pub(crate) struct Lease<C: Client> {
    conn: Option<Arc<C>>,
    _slot: Slot,
    shared: Arc<Shared<C>>,
}

impl<C: Client> Lease<C> {
    pub(crate) fn client(&self) -> Result<Arc<C>> {
        self.conn
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::InvalidHandle("no connection"))
    }

    /// Return the connection to the idle buffer.
    pub(crate) fn release(mut self) -> Result<()> {
        let conn = self.conn.take();
        self.shared.check_in(conn)
    }

    /// Close the connection.
    pub(crate) fn destroy(self) {
        self.destroy_after(|| {});
    }

    /// Run `before` and then close the connection, both off the calling task.
    pub(crate) fn destroy_after<F>(mut self, before: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(conn) = self.conn.take() {
            self.shared.discard_after(conn, before);
        }
    }

    /// Destroy the connection after an operation on it was abandoned.
    pub(crate) fn abandon(self, reason: &Error) {
        self.abandon_after(reason, || {});
    }

    pub(crate) fn abandon_after<F>(self, reason: &Error, before: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.note_abandoned(reason);
        tracing::debug!(error = %reason, "operation abandoned, destroying its connection");
        self.destroy_after(before);
    }

    /// End the lease after a completed operation: a failure that leaves the
    /// connection in doubt destroys it, anything else returns it.
    pub(crate) fn settle(self, failure: Option<&Error>) -> Result<()> {
        match failure {
            Some(err) if err.poisons_connection() => {
                tracing::debug!(error = %err, "operation failed, destroying its connection");
                self.destroy();
                Ok(())
            }
            _ => self.release(),
        }
    }

    /// Run one call and end the lease.
    pub(crate) async fn run<T, F>(self, ctx: &Context, work: F) -> Result<T>
    where
        F: FnOnce(&C) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.client()?;
        match exec::race(ctx, move || work(&client)).await {
            Outcome::Completed(result) => {
                self.settle(result.as_ref().err())?;
                result
            }
            Outcome::Abandoned(err) => {
                self.abandon(&err);
                Err(err)
            }
        }
    }

    /// Run one call whose result becomes a handle that keeps the connection.
    ///
    /// On failure or abandonment the lease ends here.
    pub(crate) async fn open_handle<T, F>(self, ctx: &Context, work: F) -> Result<(Self, T)>
    where
        F: FnOnce(&C) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.client()?;
        match exec::race(ctx, move || work(&client)).await {
            Outcome::Completed(Ok(value)) => Ok((self, value)),
            Outcome::Completed(Err(err)) => {
                self.settle(Some(&err))?;
                Err(err)
            }
            Outcome::Abandoned(err) => {
                self.abandon(&err);
                Err(err)
            }
        }
    }
}

impl<C: Client> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!("connection dropped without being settled, destroying it");
            self.shared.discard(conn);
        }
    }
}

/// Bounded buffer of idle connections.
///
/// Holds at most `limit` connections, which never exceeds the buffer's
/// capacity.
struct Idle<T> {
    queue: Option<ArrayQueue<T>>,
    limit: AtomicUsize,
    closed: AtomicBool,
}

impl<T> Idle<T> {
    fn new(capacity: usize, limit: usize) -> Self {
        Self {
            queue: (capacity > 0).then(|| ArrayQueue::new(capacity)),
            limit: AtomicUsize::new(limit.min(capacity)),
            closed: AtomicBool::new(false),
        }
    }

    /// Change how many connections the buffer keeps, and hand back the ones
    /// above the new limit.
    fn set_limit(&self, limit: usize) -> Vec<T> {
        let Some(queue) = &self.queue else {
            return Vec::new();
        };
        let limit = limit.min(queue.capacity());
        self.limit.store(limit, Ordering::SeqCst);
        let mut shed = Vec::new();
        while queue.len() > limit {
            match queue.pop() {
                Some(conn) => shed.push(conn),
                None => break,
            }
        }
        shed
    }

    fn pop(&self) -> Result<Option<T>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        Ok(self.queue.as_ref().and_then(ArrayQueue::pop))
    }

    /// Offer a connection back. Returns the connection to destroy, if any:
    /// the offered one when the buffer is full or closed, or one drained after
    /// losing a race with `close`.
    fn check_in(&self, conn: Option<T>) -> Result<Option<T>> {
        let conn = conn.ok_or(Error::NilConnection)?;
        if self.is_closed() {
            return Ok(Some(conn));
        }
        let Some(queue) = &self.queue else {
            return Ok(Some(conn));
        };
        if queue.len() >= self.limit.load(Ordering::SeqCst) {
            return Ok(Some(conn));
        }
        if let Err(rejected) = queue.push(conn) {
            return Ok(Some(rejected));
        }
        if self.is_closed() {
            return Ok(queue.pop());
        }
        Ok(None)
    }

    fn close(&self) -> Result<Vec<T>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        let mut drained = Vec::new();
        if let Some(queue) = &self.queue {
            while let Some(conn) = queue.pop() {
                drained.push(conn);
            }
        }
        Ok(drained)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn len(&self) -> usize {
        self.queue.as_ref().map_or(0, ArrayQueue::len)
    }
}
