//! Minimal end-to-end demo of the stageflow runtime: seeds a single-stage
//! DAG, runs it to completion, and prints what landed in the output queue.
//!
//! Follows the same shape as the teacher's log-tailing binary: parse args
//! with `clap`, wire `tracing_subscriber` to `RUST_LOG`, surface failures
//! with `anyhow::Context`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stageflow::driver::{InlineSubmitter, JobDagDriver, StageOptions, SyncStageFn};
use stageflow::record::{Record, Value};
use stageflow::Config;

#[derive(Debug, Parser)]
#[command(name = "stageflow-demo")]
#[command(about = "Run a tiny one-stage pipeline end to end")]
struct Args {
    /// Path to the queues database.
    #[arg(long, default_value = "queues.db")]
    queues_db: PathBuf,

    /// Path to the tasks database.
    #[arg(long, default_value = "tasks.db")]
    tasks_db: PathBuf,

    /// Number of input rows to seed.
    #[arg(long, default_value_t = 25)]
    count: i64,

    /// Batch size for the single demo stage.
    #[arg(long, default_value_t = 10)]
    batch_size: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let started_at = Utc::now();
    println!("run started at {}", started_at.to_rfc3339_opts(SecondsFormat::Millis, true));

    let config = Config {
        queues_db_path: args.queues_db,
        tasks_db_path: args.tasks_db,
        ..Config::default()
    };

    let mut driver = JobDagDriver::new(&config, Arc::new(InlineSubmitter));
    driver
        .register(
            "transform",
            StageOptions::default()
                .with_input_table("inq")
                .with_output_table("outq")
                .with_batch_size(args.batch_size),
            Arc::new(SyncStageFn(transform)),
        )
        .await
        .context("failed to register the transform stage")?;

    let inputs: Vec<Record> = (0..args.count)
        .map(|idx| {
            let mut row = Record::new();
            row.insert("idx".to_string(), Value::Int(idx));
            row
        })
        .collect();

    let transform_stage = driver
        .stage("transform")
        .ok_or_else(|| anyhow::anyhow!("transform stage was just registered"))?;
    transform_stage
        .set_inputs(inputs)
        .await
        .context("failed to seed input rows")?;

    driver
        .run_until_complete()
        .await
        .context("pipeline run failed")?;

    let transform_stage = driver
        .stage("transform")
        .ok_or_else(|| anyhow::anyhow!("transform stage was just registered"))?;
    let outputs = transform_stage
        .get_outputs(args.count * 2)
        .await
        .context("failed to read outputs")?;

    let finished_at: DateTime<Utc> = Utc::now();
    println!("produced {} output rows", outputs.len());
    for row in &outputs {
        println!("{row:?}");
    }
    println!(
        "run finished at {} ({:.3}s elapsed)",
        finished_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        (finished_at - started_at).num_milliseconds() as f64 / 1000.0
    );

    Ok(())
}

fn transform(batch: Option<Vec<Record>>, task_index: i64) -> stageflow::Result<Vec<Record>> {
    let items = batch.unwrap_or_default();
    tracing::info!(task_index, count = items.len(), "transforming batch");
    let out = items
        .into_iter()
        .map(|mut row| {
            let idx = row.get("idx").and_then(Value::as_i64).unwrap_or(0);
            row.insert("out".to_string(), Value::Int(idx + 50));
            row
        })
        .collect();
    Ok(out)
}
