use serde::{Deserialize, Serialize};

/// Experiment-level turn counters. They survive across runs.
///
/// `pending + processing + success + fail + terminated` always equals the number of turns
/// the experiment is expected to evaluate.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptStats {
    pub space_id: i64,
    pub experiment_id: i64,
    pub pending_turn_cnt: i32,
    pub processing_turn_cnt: i32,
    pub success_turn_cnt: i32,
    pub fail_turn_cnt: i32,
    pub terminated_turn_cnt: i32,
    pub credit_cost: f64,
    pub input_token_cost: i64,
    pub output_token_cost: i64,
}

impl ExptStats {
    pub fn total_turn_cnt(&self) -> i32 {
        self.pending_turn_cnt
            + self.processing_turn_cnt
            + self.success_turn_cnt
            + self.fail_turn_cnt
            + self.terminated_turn_cnt
    }

    pub fn apply(&mut self, delta: &StatsDelta) {
        self.pending_turn_cnt += delta.pending;
        self.processing_turn_cnt += delta.processing;
        self.success_turn_cnt += delta.success;
        self.fail_turn_cnt += delta.fail;
        self.terminated_turn_cnt += delta.terminated;
        self.credit_cost += delta.credit_cost;
        self.input_token_cost += delta.input_tokens;
        self.output_token_cost += delta.output_tokens;
    }
}

/// Relative change applied atomically by the repository; never computed read-modify-write.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub pending: i32,
    pub processing: i32,
    pub success: i32,
    pub fail: i32,
    pub terminated: i32,
    pub credit_cost: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl StatsDelta {
    /// Turns moved from one counter to another.
    pub fn dispatch(turns: i32) -> Self {
        Self {
            pending: -turns,
            processing: turns,
            ..Default::default()
        }
    }

    pub fn requeue_processing(turns: i32) -> Self {
        Self {
            pending: turns,
            processing: -turns,
            ..Default::default()
        }
    }

    /// Puts a failed item back in the queue. `success_turns` of its `turns` had succeeded
    /// before the item failed.
    pub fn requeue_failed(turns: i32, success_turns: i32) -> Self {
        Self {
            pending: turns,
            success: -success_turns,
            fail: success_turns - turns,
            ..Default::default()
        }
    }

    pub fn enqueue(turns: i32) -> Self {
        Self {
            pending: turns,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_preserve_total() {
        let mut stats = ExptStats::default();
        stats.apply(&StatsDelta::enqueue(4));
        stats.apply(&StatsDelta::dispatch(3));
        stats.apply(&StatsDelta {
            processing: -2,
            success: 1,
            fail: 1,
            ..Default::default()
        });
        stats.apply(&StatsDelta::requeue_processing(1));
        stats.apply(&StatsDelta::requeue_failed(2, 1));
        assert_eq!(stats.total_turn_cnt(), 4);
        assert_eq!(stats.pending_turn_cnt, 4);
        assert_eq!(stats.processing_turn_cnt, 0);
        assert_eq!(stats.success_turn_cnt, 0);
        assert_eq!(stats.fail_turn_cnt, 0);
        assert!(StatsDelta::default().is_empty());
    }
}
