use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};

use crate::error::Error;

/*
 * Backoff retries for in-process operations (optimistic-concurrency writes, bus publishes).
 * Only errors reporting `is_retryable` are retried.
 *
 * Event-level redelivery (re-publishing an item with `retry_times + 1`) is a different
 * mechanism and lives in `retry_ctrl`.
 */

#[derive(Debug, Deserialize, Copy, Clone, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_num_retries")]
    pub num_retries: usize,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f32,
}

impl std::fmt::Display for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{json}")
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            num_retries: default_num_retries(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_s: default_max_delay_s(),
        }
    }
}

fn default_num_retries() -> usize {
    0
}

fn default_min_delay_ms() -> u64 {
    10
}

fn default_max_delay_s() -> f32 {
    1.0
}

impl RetryConfig {
    pub fn retry<R, F: Future<Output = Result<R, Error>>>(
        &self,
        func: impl FnMut() -> F,
    ) -> impl Future<Output = Result<R, Error>> {
        let backoff = self.get_backoff();
        func.retry(backoff).when(Error::is_retryable)
    }

    fn get_backoff(&self) -> backon::ExponentialBuilder {
        ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_secs_f32(self.max_delay_s))
            .with_max_times(self.num_retries)
    }
}
