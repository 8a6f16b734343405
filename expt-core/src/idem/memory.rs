use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{HealthCheckable, IdempotencyStore};
use crate::error::Error;

/// Process-local store. Expiry uses the tokio clock.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    keys: DashMap<String, Instant>,
    sets: DashMap<String, HashMap<String, Instant>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        let mut entry = self.keys.entry(key.to_string()).or_insert(now);
        if *entry > now {
            return Ok(false);
        }
        *entry = now + ttl;
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        self.keys.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self
            .keys
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now()))
    }

    async fn try_add_member(
        &self,
        set_key: &str,
        member: &str,
        ttl: Duration,
        limit: usize,
    ) -> Result<bool, Error> {
        let now = Instant::now();
        let mut members = self.sets.entry(set_key.to_string()).or_default();
        members.retain(|_, expires_at| *expires_at > now);
        if !members.contains_key(member) && members.len() >= limit {
            return Ok(false);
        }
        members.insert(member.to_string(), now + ttl);
        Ok(true)
    }

    async fn remove_member(&self, set_key: &str, member: &str) -> Result<(), Error> {
        if let Some(mut members) = self.sets.get_mut(set_key) {
            members.remove(member);
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheckable for MemoryIdempotencyStore {
    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_and_expiry() {
        let store = MemoryIdempotencyStore::new();
        assert!(store.set_nx("k", Duration::from_millis(30)).await.unwrap());
        assert!(!store.set_nx("k", Duration::from_millis(30)).await.unwrap());
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_nx("k", Duration::from_secs(10)).await.unwrap());

        store.del("k").await.unwrap();
        assert!(store.set_nx("k", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_running_set_limit() {
        let store = MemoryIdempotencyStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.try_add_member("s", "a", ttl, 2).await.unwrap());
        assert!(store.try_add_member("s", "b", ttl, 2).await.unwrap());
        assert!(!store.try_add_member("s", "c", ttl, 2).await.unwrap());
        assert!(store.try_add_member("s", "a", ttl, 2).await.unwrap());

        store.remove_member("s", "a").await.unwrap();
        assert!(store.try_add_member("s", "c", ttl, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_running_set_members_expire() {
        let store = MemoryIdempotencyStore::new();
        assert!(
            store
                .try_add_member("s", "a", Duration::from_millis(10), 1)
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            store
                .try_add_member("s", "b", Duration::from_secs(60), 1)
                .await
                .unwrap()
        );
    }
}
