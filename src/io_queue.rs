//! Joins an input [`AckQueue`] against an output one so a stage can tell
//! what work it hasn't produced output for yet, without relying on
//! exactly-once delivery: a row counts as done once *some* row with a
//! matching id shows up on the output side, full stop.

use std::path::Path;
use std::time::Duration;

use sqlx::{Row, SqlitePool};

use crate::ack_queue::{decode_value, AckQueue, AckQueueConfig, AckState};
use crate::error::{Error, Result};
use crate::flatten::unflatten_record;
use crate::record::Record;
use crate::store::open_sqlite;

/// Construction parameters for an [`IoQueue`].
#[derive(Debug, Clone)]
pub struct IoQueueConfig {
    pub input_table: Option<String>,
    pub output_table: Option<String>,
    pub input_id_column: String,
    pub output_id_column: String,
    pub batch_size: i64,
    pub queue_timeout: Duration,
    pub queue_max_size: Option<u64>,
}

impl IoQueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_table(mut self, table: impl Into<String>) -> Self {
        self.input_table = Some(table.into());
        self
    }

    pub fn with_output_table(mut self, table: impl Into<String>) -> Self {
        self.output_table = Some(table.into());
        self
    }

    pub fn with_input_id_column(mut self, column: impl Into<String>) -> Self {
        self.input_id_column = column.into();
        self
    }

    pub fn with_output_id_column(mut self, column: impl Into<String>) -> Self {
        self.output_id_column = column.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_queue_max_size(mut self, max_size: u64) -> Self {
        self.queue_max_size = Some(max_size);
        self
    }
}

impl Default for IoQueueConfig {
    fn default() -> Self {
        Self {
            input_table: None,
            output_table: None,
            input_id_column: "_id".to_string(),
            output_id_column: "_id".to_string(),
            batch_size: 1,
            queue_timeout: Duration::from_secs(300),
            queue_max_size: None,
        }
    }
}

/// Tracks unfinished work between an input queue and an output queue backed
/// by the same SQLite file, via a `LEFT JOIN ... WHERE output.id IS NULL`.
pub struct IoQueue {
    pool: SqlitePool,
    input_q: Option<AckQueue>,
    output_q: Option<AckQueue>,
    input_id_column: String,
    output_id_column: String,
    batch_size: i64,
}

impl IoQueue {
    /// Opens `path` once and builds the configured sides against it. Input
    /// and output must live in the same file for the join queries to see
    /// both tables from a single connection.
    pub async fn open(path: impl AsRef<Path>, config: IoQueueConfig) -> Result<Self> {
        let pool = open_sqlite(path.as_ref()).await?;

        let input_q = match &config.input_table {
            Some(table) => Some(
                AckQueue::with_pool(pool.clone(), side_config(table, &config)).await?,
            ),
            None => None,
        };
        let output_q = match &config.output_table {
            Some(table) => Some(
                AckQueue::with_pool(pool.clone(), side_config(table, &config)).await?,
            ),
            None => None,
        };

        Ok(Self {
            pool,
            input_q,
            output_q,
            input_id_column: config.input_id_column,
            output_id_column: config.output_id_column,
            batch_size: config.batch_size,
        })
    }

    pub fn input_queue(&self) -> Option<&AckQueue> {
        self.input_q.as_ref()
    }

    pub fn output_queue(&self) -> Option<&AckQueue> {
        self.output_q.as_ref()
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Places raw source rows onto the input side.
    pub async fn load(&self, rows: Vec<Record>) -> Result<Vec<i64>> {
        let input = self
            .input_q
            .as_ref()
            .ok_or_else(|| Error::invalid_record("io queue has no input table configured"))?;
        input.puts(rows).await
    }

    /// Places produced results onto the output side.
    pub async fn puts(&self, rows: Vec<Record>) -> Result<Vec<i64>> {
        let output = self
            .output_q
            .as_ref()
            .ok_or_else(|| Error::invalid_record("io queue has no output table configured"))?;
        output.puts(rows).await
    }

    /// Acks input-side keys, same as calling `acks` on the input queue
    /// directly.
    pub async fn acks(&self, keys: &[i64]) -> Result<()> {
        let input = self
            .input_q
            .as_ref()
            .ok_or_else(|| Error::invalid_record("io queue has no input table configured"))?;
        input.acks(keys).await
    }

    /// Counts input rows not yet reflected in the output (by id) and not
    /// already claimed (`status < UNACK`).
    ///
    /// Sweeps the input queue's visibility timeout first, matching the
    /// source's connection property (`io_queues.py`), which runs
    /// `apply_timeout()` before every query issued through it. Without this
    /// a row that has timed out back to `READY` would still read as
    /// in-flight here even though a plain `gets` on the input queue would
    /// already see it as available.
    pub async fn size_ready(&self) -> Result<i64> {
        let (Some(input), Some(output)) = (&self.input_q, &self.output_q) else {
            return Ok(0);
        };
        input.sweep().await?;
        let (input_table, output_table) = (input.table_name(), output.table_name());
        let sql = format!(
            "SELECT COUNT(*) FROM \"{input_table}\" \
             LEFT JOIN \"{output_table}\" ON \"{input_table}\".\"{in_col}\" = \"{output_table}\".\"{out_col}\" \
             WHERE \"{output_table}\".\"{out_col}\" IS NULL AND \"{input_table}\".status < {unack}",
            in_col = self.input_id_column,
            out_col = self.output_id_column,
            unack = AckState::Unack.code(),
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Pulls up to `batch_size` (or the override) input rows that have no
    /// matching output row yet, marking them `UNACK` as they're returned.
    ///
    /// Sweeps the input queue's visibility timeout first, for the same
    /// reason as [`IoQueue::size_ready`].
    pub async fn gets(&self, batch_size: Option<i64>) -> Result<(Vec<i64>, Vec<Record>)> {
        let (Some(input), Some(output)) = (&self.input_q, &self.output_q) else {
            return Ok((Vec::new(), Vec::new()));
        };
        input.sweep().await?;
        let (input_table, output_table) = (input.table_name(), output.table_name());

        let columns = input.columns_snapshot().await;
        let select_list = if columns.is_empty() {
            String::new()
        } else {
            let quoted: Vec<String> = columns
                .iter()
                .map(|c| format!(", \"{input_table}\".\"{c}\""))
                .collect();
            quoted.concat()
        };
        let limit = batch_size.unwrap_or(self.batch_size);
        let sql = format!(
            "SELECT \"{input_table}\".\"_id\"{select_list} FROM \"{input_table}\" \
             LEFT JOIN \"{output_table}\" ON \"{input_table}\".\"{in_col}\" = \"{output_table}\".\"{out_col}\" \
             WHERE \"{output_table}\".\"{out_col}\" IS NULL AND \"{input_table}\".status < {unack} \
             LIMIT ?",
            in_col = self.input_id_column,
            out_col = self.output_id_column,
            unack = AckState::Unack.code(),
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;

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

        if !keys.is_empty() {
            input.updates(&keys, AckState::Unack).await?;
        }

        Ok((keys, records))
    }
}

fn side_config(table: &str, config: &IoQueueConfig) -> AckQueueConfig {
    let mut side = AckQueueConfig::new(table).with_timeout(config.queue_timeout);
    if let Some(max_size) = config.queue_max_size {
        side = side.with_max_size(max_size);
    }
    side
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_path(label: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("stageflow-ioqueue-{label}-{nanos}.db"))
    }

    fn idx_rows(n: i64) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let mut record = Record::new();
                record.insert("idx".to_string(), Value::Int(i));
                record
            })
            .collect()
    }

    #[tokio::test]
    async fn puts_only_targets_output_table() {
        let path = unique_temp_path("puts");
        let ioq = IoQueue::open(
            &path,
            IoQueueConfig::new().with_output_table("test_outputq"),
        )
        .await
        .expect("open");

        assert_eq!(ioq.size_ready().await.expect("size_ready"), 0);
        ioq.puts(idx_rows(25)).await.expect("puts");
        assert_eq!(
            ioq.output_queue().expect("output queue").count().await.expect("count"),
            25
        );
    }

    #[tokio::test]
    async fn gets_returns_unjoined_input_rows() {
        let path = unique_temp_path("gets");
        let ioq = IoQueue::open(
            &path,
            IoQueueConfig::new()
                .with_input_table("test_inputq")
                .with_output_table("test_outputq"),
        )
        .await
        .expect("open");

        assert_eq!(ioq.size_ready().await.expect("size_ready"), 0);
        ioq.load(idx_rows(25)).await.expect("load");
        assert_eq!(ioq.size_ready().await.expect("size_ready"), 25);

        let (keys, items) = ioq.gets(Some(1)).await.expect("gets 1");
        assert_eq!(keys.len(), 1);
        assert_eq!(items.len(), 1);
        let (keys, _) = ioq.gets(Some(2)).await.expect("gets 2");
        assert_eq!(keys.len(), 2);
        let (keys, _) = ioq.gets(Some(5)).await.expect("gets 5");
        assert_eq!(keys.len(), 5);
    }

    #[tokio::test]
    async fn end_to_end_timeout_and_ack() {
        let path = unique_temp_path("e2e");
        let n = 25;

        let loader = IoQueue::open(&path, IoQueueConfig::new().with_output_table("test_inputq"))
            .await
            .expect("open loader");
        loader.puts(idx_rows(n)).await.expect("load rows");

        let ioq = IoQueue::open(
            &path,
            IoQueueConfig::new()
                .with_input_table("test_inputq")
                .with_output_table("test_outputq")
                .with_queue_timeout(Duration::from_millis(200)),
        )
        .await
        .expect("open ioq");

        assert_eq!(ioq.size_ready().await.expect("size_ready"), n);

        let (_, batch) = ioq.gets(Some(n * 2)).await.expect("first gets");
        assert_eq!(batch.len() as i64, n);
        assert_eq!(ioq.size_ready().await.expect("size_ready"), 0);

        let (_, batch2) = ioq.gets(Some(n * 2)).await.expect("second gets");
        assert_eq!(batch2.len(), 0);
        assert_eq!(ioq.size_ready().await.expect("size_ready"), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ioq.size_ready().await.expect("size_ready"), n);

        let (keys, batch3) = ioq.gets(Some(n * 2)).await.expect("third gets");
        assert_eq!(batch3.len() as i64, n);

        ioq.acks(&keys).await.expect("ack");
        assert_eq!(ioq.size_ready().await.expect("size_ready"), 0);
    }

    #[tokio::test]
    async fn join_marks_input_done_once_output_exists() {
        let path = unique_temp_path("join");
        let n = 25;

        let loader = IoQueue::open(&path, IoQueueConfig::new().with_output_table("test_inputq"))
            .await
            .expect("open loader");
        loader.puts(idx_rows(n)).await.expect("load rows");

        let ioq = IoQueue::open(
            &path,
            IoQueueConfig::new()
                .with_input_table("test_inputq")
                .with_output_table("test_outputq")
                .with_queue_timeout(Duration::from_micros(100)),
        )
        .await
        .expect("open ioq");

        let (_, batch) = ioq.gets(Some(n * 2)).await.expect("gets");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ioq.size_ready().await.expect("size_ready"), n);

        let mut transformed = Vec::with_capacity(batch.len());
        for mut row in batch {
            row.insert("processed".to_string(), Value::Int(1));
            transformed.push(row);
        }
        ioq.puts(transformed).await.expect("puts transformed");
        assert_eq!(ioq.size_ready().await.expect("size_ready"), 0);
    }
}
