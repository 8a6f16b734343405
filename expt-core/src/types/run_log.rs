use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ItemRunState, TurnRunState};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ResultState {
    #[default]
    Unknown,
    /// An attempt was started and logged.
    Logged,
    /// The attempt finished and its results were written.
    Resulted,
}

/// Snapshot of the latest attempt of an item in a run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExptItemResultRunLog {
    pub space_id: i64,
    pub experiment_id: i64,
    pub run_id: i64,
    pub item_id: i64,
    pub status: ItemRunState,
    /// Run-log error blob, empty on success.
    pub err_msg: String,
    pub log_id: String,
    pub result_state: ResultState,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of the latest attempt of a turn in a run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExptTurnResultRunLog {
    pub space_id: i64,
    pub experiment_id: i64,
    pub run_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub target_result_id: i64,
    pub evaluator_results: BTreeMap<i64, i64>,
    pub status: TurnRunState,
    /// Run-log error blob, empty on success.
    pub err_msg: String,
    pub log_id: String,
    pub updated_at: DateTime<Utc>,
}
