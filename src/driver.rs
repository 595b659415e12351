//! The Job DAG Driver: wires stages (an [`IoQueue`] plus a user function)
//! into a DAG, decides how many task attempts each stage needs to drain its
//! ready work, and hands them to an injected [`Submitter`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ack_queue::{AckQueue, AckQueueConfig, AckState, GetsOptions};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::io_queue::{IoQueue, IoQueueConfig};
use crate::record::{Record, Value};

/// A stage's user-supplied processing function. Receives the input batch
/// (`None` if the stage has no input queue) and the task's per-attempt
/// index, and returns the rows to write to the output queue (ignored if
/// the stage has none).
#[async_trait]
pub trait StageFn: Send + Sync {
    async fn call(&self, batch: Option<Vec<Record>>, task_index: i64) -> Result<Vec<Record>>;
}

/// Adapts a plain synchronous closure into a [`StageFn`], for the common
/// case of a pure transform with no need to `.await` anything itself.
pub struct SyncStageFn<F>(pub F);

#[async_trait]
impl<F> StageFn for SyncStageFn<F>
where
    F: Fn(Option<Vec<Record>>, i64) -> Result<Vec<Record>> + Send + Sync,
{
    async fn call(&self, batch: Option<Vec<Record>>, task_index: i64) -> Result<Vec<Record>> {
        (self.0)(batch, task_index)
    }
}

/// Injected submission strategy. `submit` must eventually invoke the
/// stage's wrapped function at most once per call; it may run it inline or
/// hand it to a worker pool. Because the trait returns `()`, a submitter
/// that runs the task itself is responsible for surfacing or logging any
/// error — the driver loop never sees it, matching the source's
/// fire-and-forget dispatch plus timeout-based recovery.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, stage: Arc<Stage>, task_key: i64, task_index: i64);
}

/// Runs the stage's wrapped function synchronously on the calling task.
/// The default, matching the source's `submit_func_default`.
#[derive(Debug, Default)]
pub struct InlineSubmitter;

#[async_trait]
impl Submitter for InlineSubmitter {
    async fn submit(&self, stage: Arc<Stage>, task_key: i64, task_index: i64) {
        if let Err(error) = stage.run_task(task_key, task_index).await {
            tracing::warn!(
                stage = %stage.name,
                task_key,
                task_index,
                %error,
                "stage task failed; task attempt left unacked for timeout recovery"
            );
        }
    }
}

/// Per-stage registration options. `batch_size` and timeouts fall back to
/// the driver's [`Config`] defaults when left unset.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub input_table: Option<String>,
    pub output_table: Option<String>,
    pub batch_size: Option<i64>,
    pub queue_timeout: Option<Duration>,
    pub queue_max_size: Option<u64>,
    pub task_timeout: Option<Duration>,
}

impl StageOptions {
    pub fn with_input_table(mut self, table: impl Into<String>) -> Self {
        self.input_table = Some(table.into());
        self
    }

    pub fn with_output_table(mut self, table: impl Into<String>) -> Self {
        self.output_table = Some(table.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn with_queue_max_size(mut self, max_size: u64) -> Self {
        self.queue_max_size = Some(max_size);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }
}

/// One node of the DAG: an [`IoQueue`] (input/output queues), the user
/// function, and a dedicated `tasks_<name>` queue tracking task attempts.
pub struct Stage {
    name: String,
    has_input: bool,
    has_output: bool,
    ioqueues: IoQueue,
    tasks: AckQueue,
    stage_fn: Arc<dyn StageFn>,
    task_counter: AtomicI64,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seeds the stage's input queue (DAG entry points only; downstream
    /// stages are fed by upstream `puts`).
    pub async fn set_inputs(&self, rows: Vec<Record>) -> Result<Vec<i64>> {
        self.ioqueues.load(rows).await
    }

    /// Reads from the stage's output queue. Not side-effect free: like any
    /// `gets`, this marks the returned rows `UNACK`. Callers wanting a
    /// non-destructive peek should read the output queue directly with
    /// `GetsOptions::default().ack(false).read_all(true)`.
    pub async fn get_outputs(&self, n: i64) -> Result<Vec<Record>> {
        let output = self
            .ioqueues
            .output_queue()
            .ok_or_else(|| Error::invalid_record(format!("stage `{}` has no output queue", self.name)))?;
        let (_, items) = output.gets(n, GetsOptions::default()).await?;
        Ok(items)
    }

    fn next_task_index(&self) -> i64 {
        self.task_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// The wrapped function: mark the attempt in-flight, run one batch (or
    /// none, for a source stage) through the user function, forward its
    /// output, then mark the attempt done. Input rows are never acked here
    /// — completion is implicit via the downstream join (see `IoQueue`).
    async fn run_task(&self, task_key: i64, task_index: i64) -> Result<()> {
        self.tasks.updates(&[task_key], AckState::Unack).await?;

        let batch = if self.has_input {
            let (_, items) = self.ioqueues.gets(None).await?;
            Some(items)
        } else {
            None
        };

        let out_rows = self.stage_fn.call(batch, task_index).await?;

        if self.has_output {
            self.ioqueues.puts(out_rows).await?;
        }

        self.tasks.updates(&[task_key], AckState::AckDone).await?;
        Ok(())
    }
}

/// Holds the registered stages and drives them to quiescence.
///
/// Unlike the source (whose stage registry and task counters are class
/// attributes shared process-wide), every piece of mutable state here is
/// owned by the `JobDagDriver` instance.
pub struct JobDagDriver {
    queues_path: PathBuf,
    tasks_path: PathBuf,
    default_timeout: Duration,
    default_batch_size: i64,
    submitter: Arc<dyn Submitter>,
    stages: Vec<Arc<Stage>>,
}

impl JobDagDriver {
    pub fn new(config: &Config, submitter: Arc<dyn Submitter>) -> Self {
        Self {
            queues_path: config.queues_db_path.clone(),
            tasks_path: config.tasks_db_path.clone(),
            default_timeout: config.default_timeout(),
            default_batch_size: config.default_batch_size,
            submitter,
            stages: Vec::new(),
        }
    }

    /// Builds a driver with [`InlineSubmitter`] and default [`Config`],
    /// convenient for tests and single-process demos.
    pub fn with_defaults() -> Self {
        Self::new(&Config::default(), Arc::new(InlineSubmitter))
    }

    /// Registers a stage: builds its `IoQueue` (against the shared
    /// `queues_db_path`) and its `tasks_<name>` ack queue (against
    /// `tasks_db_path`), then stores the user function under `name`.
    pub async fn register(
        &mut self,
        name: impl Into<String>,
        options: StageOptions,
        stage_fn: Arc<dyn StageFn>,
    ) -> Result<()> {
        let name = name.into();
        let has_input = options.input_table.is_some();
        let has_output = options.output_table.is_some();

        let mut ioq_config = IoQueueConfig::new()
            .with_batch_size(options.batch_size.unwrap_or(self.default_batch_size))
            .with_queue_timeout(options.queue_timeout.unwrap_or(self.default_timeout));
        if let Some(table) = &options.input_table {
            ioq_config = ioq_config.with_input_table(table.clone());
        }
        if let Some(table) = &options.output_table {
            ioq_config = ioq_config.with_output_table(table.clone());
        }
        if let Some(max_size) = options.queue_max_size {
            ioq_config = ioq_config.with_queue_max_size(max_size);
        }
        let ioqueues = IoQueue::open(&self.queues_path, ioq_config).await?;

        let tasks_config = AckQueueConfig::new(format!("tasks_{name}"))
            .with_timeout(options.task_timeout.unwrap_or(self.default_timeout));
        let tasks = AckQueue::open(&self.tasks_path, tasks_config).await?;

        self.stages.push(Arc::new(Stage {
            name,
            has_input,
            has_output,
            ioqueues,
            tasks,
            stage_fn,
            task_counter: AtomicI64::new(0),
        }));
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&Arc<Stage>> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// One driver tick: for each stage in registration order, submit task
    /// attempts while `need >= active` (deliberately not `>`, see
    /// `DESIGN.md`).
    pub async fn run_once(&self) -> Result<()> {
        for stage in &self.stages {
            let delta = stage.ioqueues.size_ready().await?;
            let batch_size = stage.ioqueues.batch_size().max(1);
            let need = ((delta as f64) / (batch_size as f64)).ceil() as i64;
            let mut active = stage.tasks.active().await?;

            tracing::debug!(stage = %stage.name, delta, need, active, "stage snapshot");

            while need >= active {
                let task_index = stage.next_task_index();
                let mut task_row = Record::new();
                task_row.insert("task_index".to_string(), Value::Int(task_index));
                let task_key = stage
                    .tasks
                    .put(task_row)
                    .await?
                    .ok_or_else(|| Error::invalid_record("task attempt insert was unexpectedly ignored"))?;

                tracing::info!(stage = %stage.name, task_index, task_key, "submitting task");
                self.submitter.submit(Arc::clone(stage), task_key, task_index).await;
                active += 1;
            }
        }
        Ok(())
    }

    /// Runs `run_once` until every stage reports `size_ready == 0`. Does
    /// not wait for `tasks_AQ` to drain, only for no input to remain
    /// unjoined to output.
    pub async fn run_until_complete(&self) -> Result<()> {
        while !self.is_complete().await? {
            self.run_once().await?;
        }
        Ok(())
    }

    async fn is_complete(&self) -> Result<bool> {
        for stage in &self.stages {
            if stage.ioqueues.size_ready().await? != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_paths(label: &str) -> (PathBuf, PathBuf) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir();
        (
            dir.join(format!("stageflow-driver-{label}-{nanos}-queues.db")),
            dir.join(format!("stageflow-driver-{label}-{nanos}-tasks.db")),
        )
    }

    fn config_for(queues_path: PathBuf, tasks_path: PathBuf) -> Config {
        Config {
            queues_db_path: queues_path,
            tasks_db_path: tasks_path,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn s5_linear_dag_sums_vectors() {
        let (queues_path, tasks_path) = unique_paths("s5");
        let config = config_for(queues_path, tasks_path);
        let mut driver = JobDagDriver::new(&config, Arc::new(InlineSubmitter));

        driver
            .register(
                "crawler",
                StageOptions::default()
                    .with_input_table("urls")
                    .with_output_table("links")
                    .with_batch_size(10),
                Arc::new(SyncStageFn(|batch: Option<Vec<Record>>, _task_index: i64| {
                    let mut out = Vec::new();
                    for item in batch.unwrap_or_default() {
                        let url = item.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
                        for suffix in ["a.html", "b.html"] {
                            let mut row = item.clone();
                            row.insert("link".to_string(), Value::Text(format!("{url}/{suffix}")));
                            out.push(row);
                        }
                    }
                    Ok(out)
                })),
            )
            .await
            .expect("register crawler");

        driver
            .register(
                "transform",
                StageOptions::default()
                    .with_input_table("links")
                    .with_output_table("vecs")
                    .with_batch_size(10),
                Arc::new(SyncStageFn(|batch: Option<Vec<Record>>, _task_index: i64| {
                    let mut out = Vec::new();
                    for mut item in batch.unwrap_or_default() {
                        item.insert("vector".to_string(), Value::from(vec![1_i64, 2, 3]));
                        out.push(item);
                    }
                    Ok(out)
                })),
            )
            .await
            .expect("register transform");

        driver
            .register(
                "sum_vector",
                StageOptions::default()
                    .with_input_table("vecs")
                    .with_output_table("mean_vec")
                    .with_batch_size(10_000),
                Arc::new(SyncStageFn(|batch: Option<Vec<Record>>, _task_index: i64| {
                    let items = batch.unwrap_or_default();
                    if items.is_empty() {
                        return Ok(Vec::new());
                    }
                    let mut total = 0.0;
                    for item in &items {
                        if let Some(vector) = item.get("vector").and_then(Value::as_list) {
                            for value in vector {
                                total += value.as_f64().unwrap_or(0.0);
                            }
                        }
                    }
                    let mut row = Record::new();
                    row.insert("sum_vector".to_string(), Value::Real(total));
                    Ok(vec![row])
                })),
            )
            .await
            .expect("register sum_vector");

        let urls: Vec<Record> = (0..5)
            .map(|idx| {
                let mut row = Record::new();
                row.insert("url".to_string(), Value::Text(format!("{idx}.com")));
                row
            })
            .collect();
        driver
            .stage("crawler")
            .expect("crawler stage")
            .set_inputs(urls)
            .await
            .expect("seed urls");

        driver.run_until_complete().await.expect("run to completion");

        let outputs = driver
            .stage("sum_vector")
            .expect("sum_vector stage")
            .get_outputs(100)
            .await
            .expect("get outputs");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].get("sum_vector"), Some(&Value::Real(60.0)));
    }

    #[tokio::test]
    async fn no_input_stage_runs_without_a_batch() {
        let (queues_path, tasks_path) = unique_paths("source");
        let config = config_for(queues_path, tasks_path);
        let mut driver = JobDagDriver::new(&config, Arc::new(InlineSubmitter));

        driver
            .register(
                "seed",
                StageOptions::default().with_output_table("seeded").with_batch_size(1),
                Arc::new(SyncStageFn(|batch: Option<Vec<Record>>, _task_index: i64| {
                    assert!(batch.is_none());
                    let mut row = Record::new();
                    row.insert("value".to_string(), Value::Int(1));
                    Ok(vec![row])
                })),
            )
            .await
            .expect("register seed");

        driver.run_once().await.expect("run once");

        let outputs = driver.stage("seed").expect("seed stage").get_outputs(10).await.expect("outputs");
        assert_eq!(outputs.len(), 1);
    }
}
