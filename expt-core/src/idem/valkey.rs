use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::timeout;

use super::{HealthCheckable, IdempotencyStore};
use crate::error::{Error, ErrorDetails};

const RUNNING_SET_SCRIPT: &str = include_str!("lua/running_set.lua");
const HEALTH_CHECK_TIMEOUT_MS: u64 = 1000;

/// Valkey-backed store, shared by every engine process.
///
/// Plain keys are written with `SET NX PX`. Running sets are sorted sets scored by member
/// expiry, maintained by a Lua script so that purge, limit check and insert are atomic.
#[derive(Clone)]
pub struct ValkeyIdempotencyStore {
    connection: ConnectionManager,
}

impl ValkeyIdempotencyStore {
    pub async fn new(valkey_url: &str) -> Result<Self, Error> {
        let client = Client::open(valkey_url).map_err(|e| {
            Error::new(ErrorDetails::ValkeyConnection {
                message: format!("Failed to create Valkey client: {e}"),
            })
        })?;
        let connection = ConnectionManager::new(client).await.map_err(|e| {
            Error::new(ErrorDetails::ValkeyConnection {
                message: format!("Failed to connect to Valkey: {e}"),
            })
        })?;
        Ok(Self { connection })
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl IdempotencyStore for ValkeyIdempotencyStore {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.connection.clone();
        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found > 0)
    }

    async fn try_add_member(
        &self,
        set_key: &str,
        member: &str,
        ttl: Duration,
        limit: usize,
    ) -> Result<bool, Error> {
        let mut conn = self.connection.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let added: i64 = redis::cmd("EVAL")
            .arg(RUNNING_SET_SCRIPT)
            .arg(1)
            .arg(set_key)
            .arg(member)
            .arg(now_ms)
            .arg(ttl_ms(ttl))
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn remove_member(&self, set_key: &str, member: &str) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(set_key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HealthCheckable for ValkeyIdempotencyStore {
    async fn health(&self) -> Result<(), Error> {
        let check = async {
            let mut conn = self.connection.clone();
            let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
                Error::new(ErrorDetails::ValkeyConnection {
                    message: format!("Valkey health check failed: {e}"),
                })
            })?;
            Ok(())
        };
        match timeout(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS), check).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::ValkeyConnection {
                message: "Valkey health check timed out".to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_connection_error() {
        let Err(err) = ValkeyIdempotencyStore::new("not a url").await else {
            panic!("expected an invalid URL to be rejected");
        };
        assert!(matches!(
            err.get_details(),
            ErrorDetails::ValkeyConnection { .. }
        ));
    }

    #[test]
    fn test_ttl_ms_is_never_zero() {
        assert_eq!(ttl_ms(Duration::ZERO), 1);
        assert_eq!(ttl_ms(Duration::from_secs(2)), 2000);
    }
}
