//! An embedded, SQLite-backed job pipeline runtime.
//!
//! A stage reads from an input queue, runs a user function over a batch,
//! and writes to an output queue; a join between the two gives at-least-once
//! delivery with idempotent re-processing, no external broker required. The
//! [`driver`] module composes stages into a DAG and drives it to
//! quiescence.
//!
//! This crate never initializes global logging; it only emits `tracing`
//! events. The embedding binary decides how (or whether) to subscribe.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod ack_queue;
pub mod config;
pub mod driver;
pub mod error;
mod flatten;
pub mod io_queue;
pub mod record;
mod store;
mod util;

pub use ack_queue::{AckQueue, AckQueueConfig, AckState, GetsOptions};
pub use config::Config;
pub use driver::{InlineSubmitter, JobDagDriver, Stage, StageFn, StageOptions, Submitter, SyncStageFn};
pub use error::{Error, Result};
pub use io_queue::{IoQueue, IoQueueConfig};
pub use record::{Record, Value};
