//! Connection pool and async access helpers.
//!
//! The store is the single source of truth shared by every coordinator
//! instance. All access goes through `run` (plain) or `run_serializable`
//! (exclusive transaction); diesel work is moved off the async runtime with
//! `spawn_blocking`.

use anyhow::{Context, Result};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};

pub mod bootstrap;

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

/// Applies per-connection PRAGMAs.
///
/// `busy_timeout` gives serializable writers a bounded 5 s wait;
/// WAL keeps readers from blocking the sync loop's writes.
#[derive(Debug, Clone, Copy)]
struct ConnectionCustomizer;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA foreign_keys = ON;\
             PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = 5000;\
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Create the connection pool.
pub fn create_pool(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .max_size(16)
        .connection_timeout(std::time::Duration::from_secs(30))
        .connection_customizer(Box::new(ConnectionCustomizer))
        .build(manager)
        .context("Failed to create database connection pool")?;
    Ok(pool)
}

/// Run blocking database work on the blocking thread pool.
pub async fn run<F, T>(pool: &DbPool, work: F) -> Result<T>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut conn = pool.get().context("Failed to get DB connection")?;
    tokio::task::spawn_blocking(move || work(&mut conn))
        .await
        .context("Database task join error")?
}

/// Run a multi-row mutation under serializable isolation.
///
/// SQLite's exclusive transaction takes the write lock up front, so every
/// check-then-write sequence inside `work` observes and produces a single
/// consistent snapshot. Concurrent writers wait up to the busy timeout and
/// then fail, which callers treat as a transient error.
pub async fn run_serializable<F, T>(pool: &DbPool, work: F) -> Result<T>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut conn = pool.get().context("Failed to get DB connection")?;
    tokio::task::spawn_blocking(move || conn.exclusive_transaction(work))
        .await
        .context("Database task join error")?
}
