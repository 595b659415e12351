//! The ack queue: a single table backing a durable, at-least-once queue with
//! an ack state machine, dynamic schema growth, array flattening, and a
//! visibility-timeout sweep.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::flatten::{flatten_record, unflatten_record};
use crate::record::{validate_field_name, validate_record, Record, Value, RESERVED_COLUMNS};
use crate::store::open_sqlite;
use crate::util::now_epoch_secs;

/// Approximate-count cache TTL used by `max_size` backpressure.
const APPROX_COUNT_TTL_SECS: f64 = 10.0;

/// Ack state machine. Ordering matters: the numeric codes in [`AckState::code`]
/// are an on-disk encoding detail, never compared directly outside this
/// module — core code only ever asks `is_available` / `is_in_flight` /
/// `is_done`. Note that `is_in_flight` and `is_done` overlap at `Acked`
/// (mirroring the counter definitions in [`AckQueue::active`] and
/// [`AckQueue::done`]): an acked row still counts as in-flight until it
/// clears `AckFailed`, since nothing has reconciled it to a final state yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Just inserted, available to workers.
    Inited,
    /// Returned to the pool after a visibility timeout.
    Ready,
    /// Handed to a worker, not yet acked.
    Unack,
    /// Worker acked OK.
    Acked,
    /// Worker reported failure.
    AckFailed,
    /// Worker reported explicit completion.
    AckDone,
}

impl AckState {
    pub const fn code(self) -> i64 {
        match self {
            AckState::Inited => 0,
            AckState::Ready => 1,
            AckState::Unack => 2,
            AckState::Acked => 5,
            AckState::AckFailed => 9,
            AckState::AckDone => 17,
        }
    }

    pub fn is_available(self) -> bool {
        self.code() < AckState::Unack.code()
    }

    pub fn is_in_flight(self) -> bool {
        self.code() >= AckState::Unack.code() && self.code() < AckState::AckFailed.code()
    }

    pub fn is_done(self) -> bool {
        self.code() > AckState::Unack.code()
    }
}

/// Construction parameters for an [`AckQueue`].
#[derive(Debug, Clone)]
pub struct AckQueueConfig {
    pub table_name: String,
    /// A field whose duplicate values are silently ignored on insert.
    pub unique_column: Option<String>,
    /// Visibility timeout: how long an `UNACK` row may be held before the
    /// sweep resets it to `READY`.
    pub timeout: Duration,
    /// Producer backpressure ceiling; `puts` blocks until the approximate
    /// row count falls at or below this value.
    pub max_size: Option<u64>,
    /// Physically remove rows on ack instead of leaving them in a terminal
    /// state.
    pub delete_on_ack: bool,
}

impl AckQueueConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    pub fn with_unique_column(mut self, column: impl Into<String>) -> Self {
        self.unique_column = Some(column.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_delete_on_ack(mut self, delete_on_ack: bool) -> Self {
        self.delete_on_ack = delete_on_ack;
        self
    }
}

impl Default for AckQueueConfig {
    fn default() -> Self {
        Self {
            table_name: "queue".to_string(),
            unique_column: None,
            timeout: Duration::from_secs(300),
            max_size: None,
            delete_on_ack: false,
        }
    }
}

/// Options for [`AckQueue::gets`].
#[derive(Debug, Clone, Copy)]
pub struct GetsOptions {
    /// Pick the SELECT offset uniformly in `[0, 100*n)` instead of `0`.
    pub random_offset: bool,
    /// Transition returned rows to `UNACK` before returning them.
    pub ack: bool,
    /// Drop the `status < UNACK` filter and return every row.
    pub read_all: bool,
}

impl Default for GetsOptions {
    fn default() -> Self {
        Self {
            random_offset: false,
            ack: true,
            read_all: false,
        }
    }
}

impl GetsOptions {
    pub fn random_offset(mut self, value: bool) -> Self {
        self.random_offset = value;
        self
    }

    pub fn ack(mut self, value: bool) -> Self {
        self.ack = value;
        self
    }

    pub fn read_all(mut self, value: bool) -> Self {
        self.read_all = value;
        self
    }
}

/// A durable, table-backed queue with an ack state machine.
pub struct AckQueue {
    pool: SqlitePool,
    table: String,
    unique_column: Option<String>,
    timeout_secs: f64,
    max_size: Option<u64>,
    delete_on_ack: bool,
    columns: RwLock<Vec<String>>,
    /// SQL type each known column was created with, keyed by column name.
    /// Used by `ensure_schema_for_batch` to reject a `puts` batch that would
    /// need a different type for a column that already exists, per the
    /// silent-coercion-vs-reject policy documented in `DESIGN.md`.
    column_types: RwLock<HashMap<String, String>>,
    last_sweep: Mutex<Option<f64>>,
    count_cache: Mutex<Option<(f64, i64)>>,
}

impl AckQueue {
    /// Opens `path`, creating the table if it doesn't exist, with a
    /// dedicated connection pool (each ack queue owns one connection to the
    /// backing store, per the concurrency model).
    pub async fn open(path: impl AsRef<Path>, config: AckQueueConfig) -> Result<Self> {
        let pool = open_sqlite(path.as_ref()).await?;
        Self::with_pool(pool, config).await
    }

    /// Attaches to an already-open pool. Used when several queues share one
    /// backing file, e.g. the input and output side of an [`crate::io_queue::IoQueue`].
    pub async fn with_pool(pool: SqlitePool, config: AckQueueConfig) -> Result<Self> {
        validate_field_name(&config.table_name)?;
        if let Some(column) = &config.unique_column {
            validate_field_name(column)?;
        }

        let ddl = match &config.unique_column {
            Some(column) => format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (_id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp REAL, status INTEGER, \"{column}\" TEXT UNIQUE)",
                table = config.table_name,
            ),
            None => format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (_id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp REAL, status INTEGER)",
                table = config.table_name,
            ),
        };
        sqlx::query(&ddl).execute(&pool).await?;

        let (mut columns, mut column_types) = read_columns(&pool, &config.table_name).await?;
        if let Some(column) = &config.unique_column {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.clone());
                column_types.insert(column.clone(), "TEXT".to_string());
            }
        }

        Ok(Self {
            pool,
            table: config.table_name,
            unique_column: config.unique_column,
            timeout_secs: config.timeout.as_secs_f64(),
            max_size: config.max_size,
            delete_on_ack: config.delete_on_ack,
            columns: RwLock::new(columns),
            column_types: RwLock::new(column_types),
            last_sweep: Mutex::new(None),
            count_cache: Mutex::new(None),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Snapshot of known (non-reserved) columns, in insertion order. Used by
    /// [`crate::io_queue::IoQueue`] to build its join queries against this
    /// queue's table without re-deriving the schema.
    pub(crate) async fn columns_snapshot(&self) -> Vec<String> {
        self.columns.read().await.clone()
    }

    /// Inserts a single record, returning its key, or `None` if it collided
    /// on `unique_column`.
    pub async fn put(&self, record: Record) -> Result<Option<i64>> {
        let mut keys = self.puts(vec![record]).await?;
        Ok(keys.pop())
    }

    /// Bulk-inserts records. A record colliding on `unique_column` is
    /// silently dropped (no error, no key in the returned list).
    pub async fn puts(&self, records: Vec<Record>) -> Result<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        for record in &records {
            validate_record(record)?;
        }
        self.sweep().await?;
        self.max_size_block().await?;

        let flattened: Vec<Record> = records.into_iter().map(flatten_record).collect();
        self.ensure_schema_for_batch(&flattened).await?;

        let column_order = self.columns.read().await.clone();
        let now = now_epoch_secs();
        let quoted_columns: Vec<String> = column_order.iter().map(|c| format!("\"{c}\"")).collect();
        let placeholders = vec!["?"; column_order.len()].join(", ");
        let sql = if column_order.is_empty() {
            format!(
                "INSERT OR IGNORE INTO \"{table}\" (timestamp, status) VALUES (?, ?) RETURNING _id",
                table = self.table
            )
        } else {
            format!(
                "INSERT OR IGNORE INTO \"{table}\" (timestamp, status, {columns}) VALUES (?, ?, {placeholders}) RETURNING _id",
                table = self.table,
                columns = quoted_columns.join(", "),
            )
        };

        let mut keys = Vec::new();
        for mut row in flattened {
            let values: Vec<Value> = column_order
                .iter()
                .map(|column| row.remove(column).unwrap_or(Value::Null))
                .collect();

            let mut query = sqlx::query(&sql).bind(now).bind(AckState::Inited.code());
            for value in &values {
                query = bind_value(query, value);
            }
            if let Some(row) = query.fetch_optional(&self.pool).await? {
                keys.push(row.try_get::<i64, _>("_id")?);
            }
        }
        Ok(keys)
    }

    /// Selects up to `n` rows per `opts`, unflattens array fields, and (by
    /// default) marks them `UNACK` before returning.
    pub async fn gets(&self, n: i64, opts: GetsOptions) -> Result<(Vec<i64>, Vec<Record>)> {
        self.sweep().await?;
        let columns = self.columns.read().await.clone();

        let offset = if opts.random_offset {
            rand::thread_rng().gen_range(0..(n.max(1) * 100))
        } else {
            0
        };
        let select_list = select_column_list(&columns);
        let where_clause = if opts.read_all {
            String::new()
        } else {
            format!("WHERE status < {}", AckState::Unack.code())
        };
        let sql = format!(
            "SELECT _id{select_list} FROM \"{table}\" {where_clause} ORDER BY _id ASC LIMIT ? OFFSET ?",
            table = self.table,
        );
        let rows = sqlx::query(&sql).bind(n).bind(offset).fetch_all(&self.pool).await?;

        let mut keys = Vec::with_capacity(rows.len());
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            keys.push(row.try_get::<i64, _>("_id")?);
            let mut flat = Record::new();
            for column in &columns {
                flat.insert(column.clone(), decode_value(row, column)?);
            }
            records.push(unflatten_record(flat)?);
        }

        if opts.ack && !keys.is_empty() {
            self.updates(&keys, AckState::Unack).await?;
        }

        Ok((keys, records))
    }

    /// Bulk `UPDATE status WHERE _id IN (...)`. Fails with [`Error::MissingKeys`]
    /// if any key doesn't exist.
    pub async fn updates(&self, keys: &[i64], status: AckState) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.sweep().await?;
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "UPDATE \"{table}\" SET status = ? WHERE _id IN ({placeholders}) RETURNING _id",
            table = self.table,
        );
        let mut query = sqlx::query(&sql).bind(status.code());
        for key in keys {
            query = query.bind(key);
        }
        let rows = query.fetch_all(&self.pool).await?;
        if rows.len() != keys.len() {
            return Err(Error::missing_keys(keys.len(), rows.len()));
        }
        Ok(())
    }

    /// Acks `keys` to [`AckState::Acked`] (or `status`, if using
    /// [`AckQueue::acks_with_status`]). Idempotent for keys already in a
    /// terminal state; fails if a key no longer exists.
    pub async fn acks(&self, keys: &[i64]) -> Result<()> {
        self.acks_with_status(keys, AckState::Acked).await
    }

    pub async fn acks_with_status(&self, keys: &[i64], status: AckState) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.updates(keys, status).await?;
        if self.delete_on_ack {
            self.delete(keys).await?;
        }
        Ok(())
    }

    /// In-place update of arbitrary columns on a single row, creating
    /// columns as needed.
    pub async fn set(&self, key: i64, fields: Record) -> Result<()> {
        self.sets(&[key], std::slice::from_ref(&fields)).await
    }

    pub async fn sets(&self, keys: &[i64], field_maps: &[Record]) -> Result<()> {
        self.sweep().await?;
        for (key, fields) in keys.iter().zip(field_maps) {
            for (column, value) in fields {
                validate_field_name(column)?;
                self.ensure_columns_for(std::iter::once((column.as_str(), value)))
                    .await?;
                let sql = format!(
                    "UPDATE \"{table}\" SET \"{column}\" = ? WHERE _id = ? RETURNING _id",
                    table = self.table,
                );
                let query = bind_value(sqlx::query(&sql), value).bind(key);
                let rows = query.fetch_all(&self.pool).await?;
                if rows.len() != 1 {
                    return Err(Error::missing_keys(1, rows.len()));
                }
            }
        }
        Ok(())
    }

    /// Physically removes rows.
    pub async fn delete(&self, keys: &[i64]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.sweep().await?;
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "DELETE FROM \"{table}\" WHERE _id IN ({placeholders})",
            table = self.table,
        );
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        self.sweep().await?;
        self.scalar_count(&format!("SELECT COUNT(*) FROM \"{}\"", self.table)).await
    }

    pub async fn free(&self) -> Result<i64> {
        self.sweep().await?;
        self.scalar_count(&format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE status < {}",
            self.table,
            AckState::Unack.code()
        ))
        .await
    }

    pub async fn done(&self) -> Result<i64> {
        self.sweep().await?;
        self.scalar_count(&format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE status > {}",
            self.table,
            AckState::Unack.code()
        ))
        .await
    }

    pub async fn active(&self) -> Result<i64> {
        self.sweep().await?;
        self.scalar_count(&format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE status >= {} AND status < {}",
            self.table,
            AckState::Unack.code(),
            AckState::AckFailed.code()
        ))
        .await
    }

    /// `count`, cached for ~10s, used by [`AckQueue::max_size_block`].
    pub async fn approx_count(&self) -> Result<i64> {
        let now = now_epoch_secs();
        {
            let cache = self.count_cache.lock().await;
            if let Some((cached_at, value)) = *cache {
                if now - cached_at < APPROX_COUNT_TTL_SECS {
                    return Ok(value);
                }
            }
        }
        let value = self.count().await?;
        *self.count_cache.lock().await = Some((now, value));
        Ok(value)
    }

    async fn scalar_count(&self, sql: &str) -> Result<i64> {
        let row = sqlx::query(sql).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Blocks, polling `approx_count` once a second, until the queue has
    /// drained below `max_size`. No-op if `max_size` wasn't configured.
    async fn max_size_block(&self) -> Result<()> {
        let Some(max_size) = self.max_size else {
            return Ok(());
        };
        let mut waited: u32 = 0;
        loop {
            let approx = self.approx_count().await?;
            if approx <= max_size as i64 {
                break;
            }
            waited += 1;
            if waited.is_power_of_two() {
                tracing::info!(table = %self.table, waited_secs = waited, "waiting for queue to drop below max_size");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if waited > 1 {
            tracing::info!(table = %self.table, waited_secs = waited, "finished waiting for queue to drain");
        }
        Ok(())
    }

    /// Resets `UNACK` rows whose *original* insert timestamp is older than
    /// `now - timeout` back to `READY`. Only runs once per `timeout`
    /// interval; cheap to call from every operation.
    ///
    /// Exposed crate-wide so [`crate::io_queue::IoQueue`] can sweep the
    /// input side before its join queries, the same way the source's
    /// connection property applies the timeout before every query that
    /// touches the table.
    pub(crate) async fn sweep(&self) -> Result<()> {
        let now = now_epoch_secs();
        let mut last = self.last_sweep.lock().await;
        if let Some(previous) = *last {
            if now - previous < self.timeout_secs {
                return Ok(());
            }
        }
        let cutoff = now - self.timeout_secs;
        let sql = format!(
            "UPDATE \"{table}\" SET status = ? WHERE status = ? AND timestamp < ?",
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(AckState::Ready.code())
            .bind(AckState::Unack.code())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::debug!(
                table = %self.table,
                recycled = result.rows_affected(),
                "visibility timeout recycled unacked rows"
            );
        }
        *last = Some(now);
        Ok(())
    }

    /// Creates any column named in `batch` that isn't already known, using
    /// the first value seen for each field to infer its SQL type. Scoped to
    /// the whole batch rather than just the first row (the source only
    /// inspects `items[0]`, which panics on a later row with an unseen
    /// field — see `DESIGN.md`).
    ///
    /// Also rejects the batch with [`Error::SchemaConflict`] if a
    /// non-null value for a field that already has a column disagrees with
    /// that column's established type: this crate's policy (documented in
    /// `DESIGN.md`) is to reject rather than silently let SQLite store a
    /// mismatched value under the column's original affinity.
    async fn ensure_schema_for_batch(&self, batch: &[Record]) -> Result<()> {
        let mut new_fields: Vec<(String, Value)> = Vec::new();
        {
            let existing = self.columns.read().await;
            let existing_types = self.column_types.read().await;
            for row in batch {
                for (name, value) in row {
                    if existing.iter().any(|c| c == name) {
                        // the unique column is always declared TEXT UNIQUE at
                        // construction regardless of what value type callers
                        // dedup on, so it's exempt from this check.
                        if value.is_null() || self.unique_column.as_deref() == Some(name.as_str()) {
                            continue;
                        }
                        if let Some(established) = existing_types.get(name) {
                            let required = value.sql_type();
                            if established != required {
                                return Err(Error::schema_conflict(
                                    name.clone(),
                                    format!(
                                        "column `{name}` was created as `{established}`, value requires `{required}`"
                                    ),
                                ));
                            }
                        }
                        continue;
                    }
                    if !new_fields.iter().any(|(n, _)| n == name) {
                        new_fields.push((name.clone(), value.clone()));
                    }
                }
            }
        }
        if new_fields.is_empty() {
            return Ok(());
        }
        self.ensure_columns_for(new_fields.iter().map(|(n, v)| (n.as_str(), v)))
            .await
    }

    /// Adds missing columns under a single write-lock hold, serializing
    /// concurrent `ALTER TABLE` calls against this queue instance.
    async fn ensure_columns_for<'a>(
        &self,
        fields: impl Iterator<Item = (&'a str, &'a Value)>,
    ) -> Result<()> {
        let mut columns = self.columns.write().await;
        let mut column_types = self.column_types.write().await;
        for (name, value) in fields {
            if columns.iter().any(|c| c == name) {
                continue;
            }
            validate_field_name(name)?;
            let sql_type = value.sql_type();
            let sql = format!(
                "ALTER TABLE \"{table}\" ADD COLUMN \"{name}\" {sql_type}",
                table = self.table,
            );
            sqlx::query(&sql).execute(&self.pool).await?;
            columns.push(name.to_string());
            column_types.insert(name.to_string(), sql_type.to_string());
        }
        Ok(())
    }
}

/// Introspects the table's live columns (minus the reserved triple), along
/// with the SQL type each was declared with, so schema-conflict checks on a
/// later `puts` can compare against what's actually on disk.
async fn read_columns(pool: &SqlitePool, table: &str) -> Result<(Vec<String>, HashMap<String, String>)> {
    let sql = format!("PRAGMA table_info(\"{table}\")");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    let mut columns = Vec::new();
    let mut types = HashMap::new();
    for row in rows {
        let name: String = row.try_get("name")?;
        if !RESERVED_COLUMNS.contains(&name.as_str()) {
            let sql_type: String = row.try_get("type")?;
            types.insert(name.clone(), sql_type);
            columns.push(name);
        }
    }
    Ok((columns, types))
}

fn select_column_list(columns: &[String]) -> String {
    if columns.is_empty() {
        String::new()
    } else {
        let quoted: Vec<String> = columns.iter().map(|c| format!(", \"{c}\"")).collect();
        quoted.join("")
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Int(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::List(_) => unreachable!("list values are flattened before binding"),
    }
}

/// Decodes a column by inspecting its runtime SQLite storage class rather
/// than assuming the declared column type — SQLite has per-value dynamic
/// typing, so a `REAL` column can still hold an integer-looking value.
pub(crate) fn decode_value(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Value> {
    let raw = row.try_get_raw(column)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let value = match raw.type_info().name() {
        "INTEGER" | "BOOLEAN" => Value::Int(row.try_get::<i64, _>(column)?),
        "REAL" => Value::Real(row.try_get::<f64, _>(column)?),
        _ => Value::Text(row.try_get::<String, _>(column)?),
    };
    Ok(value)
}
