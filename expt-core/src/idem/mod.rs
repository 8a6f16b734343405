//! Self-expiring keys used as locks and dedup markers, plus the per-space set of running
//! experiments.

mod memory;
mod valkey;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use tracing::info;

use crate::error::Error;

pub use memory::MemoryIdempotencyStore;
pub use valkey::ValkeyIdempotencyStore;

#[async_trait]
#[cfg_attr(test, automock)]
pub trait IdempotencyStore: Send + Sync {
    /// Sets `key` unless it exists. Returns whether this call set it.
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, Error>;

    async fn del(&self, key: &str) -> Result<(), Error>;

    async fn exists(&self, key: &str) -> Result<bool, Error>;

    /// Adds `member` to `set_key` with its own expiry, unless the set already holds `limit`
    /// live members. Re-adding a present member refreshes its expiry and succeeds.
    async fn try_add_member(
        &self,
        set_key: &str,
        member: &str,
        ttl: Duration,
        limit: usize,
    ) -> Result<bool, Error>;

    async fn remove_member(&self, set_key: &str, member: &str) -> Result<(), Error>;
}

/// Opens the store named by `valkey_url`. Without a URL the keys live in process memory,
/// which only holds for a single engine process.
pub async fn connect_idempotency_store(
    valkey_url: Option<&str>,
) -> Result<Arc<dyn IdempotencyStore>, Error> {
    match valkey_url {
        Some(url) => {
            let store = ValkeyIdempotencyStore::new(url).await?;
            info!("Connected to Valkey");
            Ok(Arc::new(store))
        }
        None => {
            info!("No Valkey URL configured, keeping idempotency keys in memory");
            Ok(Arc::new(MemoryIdempotencyStore::new()))
        }
    }
}

#[async_trait]
pub trait HealthCheckable {
    async fn health(&self) -> Result<(), Error>;
}

pub fn schedule_lock_key(experiment_id: i64, run_id: i64) -> String {
    format!("schedule:{experiment_id}:{run_id}")
}

pub fn item_eval_key(run_id: i64, item_id: i64) -> String {
    format!("eval:{run_id}:{item_id}")
}

/// Marks the quota of an item attempt in a run as already deducted.
pub fn quota_deduct_key(run_id: i64, item_id: i64) -> String {
    format!("quota:{run_id}:{item_id}")
}

pub fn space_running_key(space_id: i64) -> String {
    format!("space_running_expt:{space_id}")
}
