//! Deployment-level knobs the source hard-codes or threads through
//! constructor keyword arguments. `Config::default()` reproduces those
//! hard-coded defaults exactly; a TOML file can override any subset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Top-level configuration for a [`crate::driver::JobDagDriver`].
///
/// Per-stage registration options still take precedence over these
/// defaults when supplied, matching the source's per-call `queue_kwargs`
/// and `taskq_kwargs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queues_db_path: PathBuf,
    pub tasks_db_path: PathBuf,
    pub default_timeout_secs: f64,
    pub default_batch_size: i64,
    pub backpressure_poll_interval_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues_db_path: PathBuf::from("queues.db"),
            tasks_db_path: PathBuf::from("tasks.db"),
            default_timeout_secs: 300.0,
            default_batch_size: 1,
            backpressure_poll_interval_secs: 1.0,
        }
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&contents)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_timeout_secs)
    }

    pub fn backpressure_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.backpressure_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_source_hardcoded_values() {
        let config = Config::default();
        assert_eq!(config.queues_db_path, PathBuf::from("queues.db"));
        assert_eq!(config.tasks_db_path, PathBuf::from("tasks.db"));
        assert_eq!(config.default_timeout_secs, 300.0);
        assert_eq!(config.default_batch_size, 1);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = Config::from_toml_str("default_batch_size = 25\n").expect("parse");
        assert_eq!(config.default_batch_size, 25);
        assert_eq!(config.queues_db_path, PathBuf::from("queues.db"));
    }
}
