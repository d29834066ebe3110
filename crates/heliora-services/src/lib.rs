//! Long-lived oracle tasks.
//!
//! Each service is an independent tokio task consuming one stream (or
//! one schedule) strictly sequentially. A shared watch channel carries
//! the shutdown signal; every storage round-trip runs on the blocking
//! pool under a bounded timeout so a wedged disk cannot stall the
//! runtime.

use std::time::Duration;

use heliora_core::{OracleError, Result};

pub mod baseline_service;
pub mod metrics_service;
pub mod reward_service;
pub mod turn_service;

pub use baseline_service::BaselineService;
pub use metrics_service::serve_http;
pub use reward_service::RewardService;
pub use turn_service::TurnService;

/// Timeout for point reads on the hot path.
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout for the finalize transaction.
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for one reward round's accruals.
pub const REWARD_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for one upstream baseline fetch.
pub const BASELINE_TIMEOUT: Duration = Duration::from_secs(45);

/// Run a blocking storage call on the blocking pool under a timeout.
/// A timeout abandons the statement, not the task.
pub async fn blocking_with_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(OracleError::Storage(format!("blocking task failed: {join}"))),
        Err(_) => Err(OracleError::Timeout {
            elapsed_ms: limit.as_millis() as u64,
        }),
    }
}

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
