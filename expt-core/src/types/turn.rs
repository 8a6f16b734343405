use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
pub enum TurnRunState {
    #[default]
    Queueing,
    Success,
    Fail,
    Processing,
    Terminal,
}

impl TurnRunState {
    pub fn code(self) -> i32 {
        match self {
            TurnRunState::Queueing => 0,
            TurnRunState::Success => 1,
            TurnRunState::Fail => 2,
            TurnRunState::Processing => 3,
            TurnRunState::Terminal => 4,
        }
    }
}

/// Result of one turn within one run. Unique per `(experiment_id, run_id, item_id, turn_id)`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExptTurnResult {
    pub id: i64,
    pub space_id: i64,
    pub experiment_id: i64,
    pub run_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub turn_idx: i32,
    /// Zero when the target never produced a record.
    pub target_result_id: i64,
    /// `evaluator_version_id -> evaluator_record_id`.
    pub evaluator_results: BTreeMap<i64, i64>,
    pub status: TurnRunState,
    pub err_msg: String,
    pub log_id: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExptTurnResult {
    /// Whether this turn already has a target record and a record for every evaluator.
    pub fn is_complete_for(&self, evaluator_version_ids: &[i64]) -> bool {
        self.status == TurnRunState::Success
            && self.target_result_id != 0
            && evaluator_version_ids
                .iter()
                .all(|id| self.evaluator_results.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_turn_run_state_string_round_trip() {
        for state in [
            TurnRunState::Queueing,
            TurnRunState::Success,
            TurnRunState::Fail,
            TurnRunState::Processing,
            TurnRunState::Terminal,
        ] {
            assert_eq!(TurnRunState::from_str(&state.to_string()).unwrap(), state);
        }
        assert!(TurnRunState::from_str("nonsense").is_err());
    }

    #[test]
    fn test_is_complete_for() {
        let mut turn = ExptTurnResult {
            target_result_id: 5,
            status: TurnRunState::Success,
            ..Default::default()
        };
        turn.evaluator_results.insert(1, 10);
        assert!(turn.is_complete_for(&[1]));
        assert!(!turn.is_complete_for(&[1, 2]));
        turn.status = TurnRunState::Fail;
        assert!(!turn.is_complete_for(&[1]));
    }
}
