use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use uuid::Uuid;

/// Hands out process-unique, monotonically increasing ids for engine rows.
///
/// Ids are seeded from the wall clock in microseconds so that restarts do not reuse ids
/// handed out by a previous process.
#[derive(Clone, Debug)]
pub struct IdGenerator {
    next: Arc<AtomicI64>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp_micros())
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: Arc::new(AtomicI64::new(first)),
        }
    }

    pub fn gen_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Log ids and completion ids are UUIDv7 so they sort by creation time.
pub fn new_log_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase() {
        let ids = IdGenerator::starting_at(10);
        let cloned = ids.clone();
        assert_eq!(ids.gen_id(), 10);
        assert_eq!(cloned.gen_id(), 11);
        assert_eq!(ids.gen_id(), 12);
    }

    #[test]
    fn test_log_ids_are_unique() {
        assert_ne!(new_log_id(), new_log_id());
    }
}
