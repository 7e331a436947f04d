//! In-memory driver for integration tests.
//!
//! Queries are a single command word:
//! - `INSERT`: store the params as one row
//! - `SELECT`: rows whose leading columns equal the params
//! - `DELETE`: remove rows whose leading columns equal the params
//! - `SLEEP <ms>`: block for that long, returning nothing
//! - `FAIL`: return a driver error
//! - `PANIC`: panic on the worker thread
//!
//! Inside a transaction, inserts stay pending until commit.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use ctxdb::{
    Client, Context, Cursor, Driver, Error, ExecResult, Opts, Pool, Result, RowSource, Statement,
    Transaction, Value,
};
use parking_lot::Mutex;

type Table = Vec<Vec<Value>>;

#[derive(Default)]
pub struct MemDb {
    rows: Mutex<Table>,
    last_dsn: Mutex<String>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    busy: AtomicUsize,
    max_busy: AtomicUsize,
    fail_open: AtomicBool,
    open_delay_ms: AtomicU64,
    scan_delay_ms: AtomicU64,
}

impl MemDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn driver(self: &Arc<Self>) -> MemDriver {
        MemDriver {
            db: Arc::clone(self),
        }
    }

    /// A pool of at most `max_open` connections over this database.
    pub fn pool(self: &Arc<Self>, max_open: usize) -> Pool<MemConn> {
        self.pool_with(Opts {
            max_open_conns: max_open,
            max_idle_conns: max_open,
            ..Opts::default()
        })
    }

    pub fn pool_with(self: &Arc<Self>, opts: Opts) -> Pool<MemConn> {
        let db = Arc::clone(self);
        Pool::new(opts, move || db.connect("mem://test")).unwrap()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Most `SLEEP` commands seen running at the same time.
    pub fn max_busy(&self) -> usize {
        self.max_busy.load(Ordering::SeqCst)
    }

    pub fn last_dsn(&self) -> String {
        self.last_dsn.lock().clone()
    }

    pub fn rows(&self) -> Table {
        self.rows.lock().clone()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        self.scan_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn scan_delay(&self) -> Duration {
        Duration::from_millis(self.scan_delay_ms.load(Ordering::SeqCst))
    }

    fn connect(self: &Arc<Self>, dsn: &str) -> Result<MemConn> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::driver("connection refused"));
        }
        std::thread::sleep(Duration::from_millis(
            self.open_delay_ms.load(Ordering::SeqCst),
        ));
        *self.last_dsn.lock() = dsn.to_owned();
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemConn {
            db: Arc::clone(self),
            closed: AtomicBool::new(false),
        })
    }

    fn sleep(&self, ms: u64) {
        let now = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_busy.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(ms));
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }

    fn execute(&self, sql: &str, params: &[Value], pending: Option<&Mutex<Table>>) -> Result<ExecResult> {
        match Command::parse(sql)? {
            Command::Insert => {
                let mut rows = match pending {
                    Some(pending) => pending.lock(),
                    None => self.rows.lock(),
                };
                rows.push(params.to_vec());
                Ok(ExecResult {
                    rows_affected: 1,
                    last_insert_id: Some(rows.len() as i64),
                })
            }
            Command::Delete => {
                let mut rows = self.rows.lock();
                let before = rows.len();
                rows.retain(|row| !matches(row, params));
                Ok(ExecResult {
                    rows_affected: (before - rows.len()) as u64,
                    last_insert_id: None,
                })
            }
            Command::Select => Ok(ExecResult::default()),
            Command::Sleep(ms) => {
                self.sleep(ms);
                Ok(ExecResult::default())
            }
            Command::Fail => Err(Error::driver("forced failure")),
            Command::Panic => panic!("driver panicked"),
        }
    }

    fn select(&self, sql: &str, params: &[Value], pending: Option<&Mutex<Table>>) -> Result<Table> {
        match Command::parse(sql)? {
            Command::Select => {
                let mut found: Table = self
                    .rows
                    .lock()
                    .iter()
                    .filter(|row| matches(row, params))
                    .cloned()
                    .collect();
                if let Some(pending) = pending {
                    found.extend(pending.lock().iter().filter(|row| matches(row, params)).cloned());
                }
                Ok(found)
            }
            _ => self.execute(sql, params, pending).map(|_| Vec::new()),
        }
    }
}

fn matches(row: &[Value], params: &[Value]) -> bool {
    row.len() >= params.len() && row.iter().zip(params).all(|(a, b)| a == b)
}

enum Command {
    Insert,
    Select,
    Delete,
    Sleep(u64),
    Fail,
    Panic,
}

impl Command {
    fn parse(sql: &str) -> Result<Self> {
        let mut words = sql.split_whitespace();
        match words.next().unwrap_or_default() {
            "INSERT" => Ok(Command::Insert),
            "SELECT" => Ok(Command::Select),
            "DELETE" => Ok(Command::Delete),
            "SLEEP" => words
                .next()
                .and_then(|ms| ms.parse().ok())
                .map(Command::Sleep)
                .ok_or_else(|| Error::driver("SLEEP needs milliseconds")),
            "FAIL" => Ok(Command::Fail),
            "PANIC" => Ok(Command::Panic),
            other => Err(Error::driver(format!("syntax error at {:?}", other))),
        }
    }
}

pub struct MemDriver {
    db: Arc<MemDb>,
}

impl Driver for MemDriver {
    type Client = MemConn;

    fn open(&self, dsn: &str) -> Result<MemConn> {
        self.db.connect(dsn)
    }
}

pub struct MemConn {
    db: Arc<MemDb>,
    closed: AtomicBool,
}

impl MemConn {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::driver("connection is closed"));
        }
        Ok(())
    }
}

impl Client for MemConn {
    type Row = MemRow;
    type Rows = MemRows;
    type Stmt = MemStmt;
    type Tx = MemTx;

    fn ping(&self) -> Result<()> {
        self.check()
    }

    fn execute(&self, query: &str, params: &[Value]) -> Result<ExecResult> {
        self.check()?;
        self.db.execute(query, params, None)
    }

    fn query_row(&self, query: &str, params: &[Value]) -> MemRow {
        let found = self.check().and_then(|()| self.db.select(query, params, None));
        MemRow::new(&self.db, found)
    }

    fn query(&self, query: &str, params: &[Value]) -> Result<MemRows> {
        self.check()?;
        let found = self.db.select(query, params, None)?;
        Ok(MemRows::new(&self.db, found))
    }

    fn prepare(&self, query: &str) -> Result<MemStmt> {
        self.check()?;
        MemStmt::new(&self.db, query, None)
    }

    fn begin(&self) -> Result<MemTx> {
        self.check()?;
        Ok(MemTx {
            db: Arc::clone(&self.db),
            pending: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::driver("connection closed twice"));
        }
        self.db.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemRow {
    found: Result<Table>,
    delay: Duration,
}

impl MemRow {
    fn new(db: &MemDb, found: Result<Table>) -> Self {
        Self {
            found,
            delay: db.scan_delay(),
        }
    }
}

impl RowSource for MemRow {
    fn scan(self) -> Result<Vec<Value>> {
        std::thread::sleep(self.delay);
        self.found?.into_iter().next().ok_or(Error::NoRows)
    }
}

pub struct MemRows {
    rows: std::vec::IntoIter<Vec<Value>>,
    width: usize,
    current: Option<Vec<Value>>,
    delay: Duration,
    closed: bool,
}

impl MemRows {
    fn new(db: &MemDb, found: Table) -> Self {
        Self {
            width: found.first().map_or(1, Vec::len),
            rows: found.into_iter(),
            current: None,
            delay: db.scan_delay(),
            closed: false,
        }
    }
}

impl Cursor for MemRows {
    fn advance(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.current = self.rows.next();
        self.current.is_some()
    }

    fn scan(&mut self) -> Result<Vec<Value>> {
        std::thread::sleep(self.delay);
        self.current
            .clone()
            .ok_or_else(|| Error::driver("scan called without a current row"))
    }

    fn columns(&self) -> Result<Vec<String>> {
        Ok((0..self.width).map(|i| format!("c{}", i)).collect())
    }

    fn err(&self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

pub struct MemStmt {
    db: Arc<MemDb>,
    sql: String,
    pending: Option<Arc<Mutex<Table>>>,
}

impl MemStmt {
    fn new(db: &Arc<MemDb>, sql: &str, pending: Option<Arc<Mutex<Table>>>) -> Result<Self> {
        Command::parse(sql)?;
        Ok(Self {
            db: Arc::clone(db),
            sql: sql.to_owned(),
            pending,
        })
    }
}

impl Statement for MemStmt {
    type Row = MemRow;
    type Rows = MemRows;

    fn execute(&mut self, params: &[Value]) -> Result<ExecResult> {
        self.db.execute(&self.sql, params, self.pending.as_deref())
    }

    fn query(&mut self, params: &[Value]) -> Result<MemRows> {
        let found = self.db.select(&self.sql, params, self.pending.as_deref())?;
        Ok(MemRows::new(&self.db, found))
    }

    fn query_row(&mut self, params: &[Value]) -> MemRow {
        let found = self.db.select(&self.sql, params, self.pending.as_deref());
        MemRow::new(&self.db, found)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct MemTx {
    db: Arc<MemDb>,
    pending: Arc<Mutex<Table>>,
}

impl Transaction for MemTx {
    type Row = MemRow;
    type Rows = MemRows;
    type Stmt = MemStmt;

    fn execute(&mut self, query: &str, params: &[Value]) -> Result<ExecResult> {
        self.db.execute(query, params, Some(&*self.pending))
    }

    fn query(&mut self, query: &str, params: &[Value]) -> Result<MemRows> {
        let found = self.db.select(query, params, Some(&*self.pending))?;
        Ok(MemRows::new(&self.db, found))
    }

    fn query_row(&mut self, query: &str, params: &[Value]) -> MemRow {
        let found = self.db.select(query, params, Some(&*self.pending));
        MemRow::new(&self.db, found)
    }

    fn prepare(&mut self, query: &str) -> Result<MemStmt> {
        MemStmt::new(&self.db, query, Some(Arc::clone(&self.pending)))
    }

    fn commit(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        self.db.rows.lock().extend(pending);
        self.db.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.pending.lock().clear();
        self.db.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn bg() -> Context {
    Context::background()
}

pub fn within(ms: u64) -> Context {
    Context::background().with_timeout(Duration::from_millis(ms))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
