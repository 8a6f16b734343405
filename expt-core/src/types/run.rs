use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::ExptStatus;

/// Which items a run schedules.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
pub enum RunMode {
    /// Every item of the bound eval-set version, from scratch.
    #[default]
    Submit,
    /// Items whose previous attempt failed with a retryable error.
    FailRetry,
    /// Items added to the eval set since the previous runs.
    Append,
}

impl RunMode {
    pub fn code(self) -> i32 {
        match self {
            RunMode::Submit => 1,
            RunMode::FailRetry => 2,
            RunMode::Append => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(RunMode::Submit),
            2 => Some(RunMode::FailRetry),
            3 => Some(RunMode::Append),
            _ => None,
        }
    }
}

/// One scheduling attempt of an experiment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExptRun {
    pub id: i64,
    pub space_id: i64,
    pub experiment_id: i64,
    pub run_mode: RunMode,
    pub status: ExptStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Set once admission succeeded on the first tick of this run.
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExptRun {
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}
