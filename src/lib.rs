//! A context-aware connection pool around blocking database clients.
//!
//! # Features
//!
//! - **Cancellable calls**: every operation takes a [`Context`] and returns as
//!   soon as it is cancelled or its deadline passes, even while the driver call
//!   is still blocked
//! - **Safe reuse**: a connection whose call was abandoned is closed, never
//!   returned to the pool
//! - **Bounded**: at most `max_open_conns` connections are checked out at once
//! - **Sticky transactions**: the first failure rolls the transaction back and
//!   is returned by every later call
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ctxdb::{params, Context, Pool};
//!
//! async fn run(driver: impl ctxdb::Driver) -> ctxdb::Result<()> {
//!     let pool = Pool::open(driver, "postgres://localhost/app?pool_max_open_conns=4")?;
//!     let ctx = Context::background().with_timeout(Duration::from_millis(500));
//!
//!     let tx = pool.begin(&ctx).await?;
//!     tx.exec(&ctx, "INSERT INTO users (name) VALUES ($1)", &params!["ada"]).await?;
//!     tx.commit(&ctx).await?;
//!
//!     let (count,): (i64,) = pool
//!         .query_row(&ctx, "SELECT count(*) FROM users", &[])
//!         .await
//!         .scan(&ctx)
//!         .await?;
//!     println!("{count} users");
//!
//!     pool.close()
//! }
//! ```

pub mod context;
pub mod driver;
pub mod error;
pub mod opts;
pub mod row;
pub mod value;

mod exec;
mod pool;
mod rows;
mod slot;
mod stmt;
mod tx;

pub use context::Context;
pub use driver::{Client, Cursor, Driver, ExecResult, RowSource, Statement, Transaction};
pub use error::{DriverError, Error, Result};
pub use opts::Opts;
pub use pool::{Pool, PoolStats};
pub use row::FromRow;
pub use rows::{Row, Rows};
pub use stmt::Stmt;
pub use tx::Tx;
pub use value::{FromValue, Value};
