//! Typed error hierarchy for the queue engine.
//!
//! Every fallible operation in this crate returns [`Result`]. The variants
//! mirror the error kinds named in the design: a malformed record, a bulk
//! update/ack that referenced keys the table doesn't have, a column whose
//! type can't be reconciled, a pass-through store failure, and a user stage
//! function that failed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("missing keys: expected {expected} row(s), found {found}")]
    MissingKeys { expected: usize, found: usize },

    #[error("schema conflict on column `{column}`: {reason}")]
    SchemaConflict { column: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("stage `{stage}` task {task_id} failed: {source}")]
    Worker {
        stage: String,
        task_id: i64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Error::InvalidRecord(reason.into())
    }

    pub fn missing_keys(expected: usize, found: usize) -> Self {
        Error::MissingKeys { expected, found }
    }

    pub fn schema_conflict(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SchemaConflict {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn worker(
        stage: impl Into<String>,
        task_id: i64,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Worker {
            stage: stage.into(),
            task_id,
            source: Box::new(source),
        }
    }
}
