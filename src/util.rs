//! Small helpers shared across the queue engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the epoch, as a float so sub-second visibility
/// timeouts (the test suite uses timeouts as small as 100 microseconds)
/// compare correctly.
pub(crate) fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
