use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
pub enum ItemRunState {
    #[default]
    Unknown,
    Queueing,
    Processing,
    Success,
    Fail,
    /// Only reached through termination, never through natural completion.
    Terminal,
}

impl ItemRunState {
    pub fn code(self) -> i32 {
        match self {
            ItemRunState::Unknown => -1,
            ItemRunState::Queueing => 0,
            ItemRunState::Processing => 1,
            ItemRunState::Success => 2,
            ItemRunState::Fail => 3,
            ItemRunState::Terminal => 5,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ItemRunState::Queueing,
            1 => ItemRunState::Processing,
            2 => ItemRunState::Success,
            3 => ItemRunState::Fail,
            5 => ItemRunState::Terminal,
            _ => ItemRunState::Unknown,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ItemRunState::Success | ItemRunState::Fail | ItemRunState::Terminal
        )
    }
}

/// Per-experiment state of one eval-set item. `run_id` is the last run that scheduled it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExptEvalItem {
    pub space_id: i64,
    pub experiment_id: i64,
    pub eval_set_version_id: i64,
    pub item_id: i64,
    pub item_idx: i32,
    pub turn_cnt: i32,
    pub state: ItemRunState,
    pub run_id: i64,
    pub err_msg: String,
    pub updated_at: DateTime<Utc>,
}
