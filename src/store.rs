//! Opens the embedded SQLite file backing a [`crate::ack_queue::AckQueue`].
//!
//! Mirrors the teacher runtime's pool setup: WAL journaling so readers don't
//! block writers, `NORMAL` synchronous (durability is "survive a process
//! crash", not "survive a power loss mid-write"), and a busy timeout so lock
//! contention between queues sharing one file blocks instead of surfacing
//! `SQLITE_BUSY`.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::error::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 5;

pub async fn open_sqlite(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;
    Ok(pool)
}
