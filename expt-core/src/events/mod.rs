//! Messages exchanged over the bus and the publishing interface.

mod bus;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

use crate::error::Error;
use crate::types::{Correction, FieldType, RunMode};

pub use bus::{BusReceivers, InMemoryEventBus};

/// `ext` key marking a redelivery whose quota was already charged.
pub const EXT_RETRY_IN_DEBT: &str = "retry_in_debt";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub app_id: i32,
}

/// Drives one scheduler tick of one run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExptScheduleEvent {
    pub space_id: i64,
    pub experiment_id: i64,
    pub run_id: i64,
    pub run_mode: RunMode,
    pub retry_times: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
    #[serde(default)]
    pub session: Session,
}

/// Asks an item worker to evaluate one item within a run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExptItemEvalEvent {
    pub space_id: i64,
    pub experiment_id: i64,
    pub run_id: i64,
    pub run_mode: RunMode,
    pub eval_set_item_id: i64,
    pub retry_times: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
    #[serde(default)]
    pub session: Session,
}

impl ExptItemEvalEvent {
    pub fn is_in_debt_retry(&self) -> bool {
        self.ext.get(EXT_RETRY_IN_DEBT).is_some_and(|v| v == "1")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalculateType {
    /// Recompute one aggregate row.
    UpdateSpecificField {
        field_type: FieldType,
        field_key: String,
    },
    /// Recompute every evaluator of the experiment.
    CreateAll,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AggrCalculateEvent {
    pub space_id: i64,
    pub experiment_id: i64,
    pub calculate_type: CalculateType,
}

impl AggrCalculateEvent {
    pub fn for_evaluator(space_id: i64, experiment_id: i64, evaluator_version_id: i64) -> Self {
        Self {
            space_id,
            experiment_id,
            calculate_type: CalculateType::UpdateSpecificField {
                field_type: FieldType::EvaluatorScore,
                field_key: evaluator_version_id.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorRecordCorrectionEvent {
    pub space_id: i64,
    pub experiment_id: i64,
    pub evaluator_record_id: i64,
    pub correction: Correction,
}

/// Per-turn scores of an online experiment, for downstream consumers.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OnlineExptResultEvent {
    pub space_id: i64,
    pub experiment_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub evaluator_scores: BTreeMap<i64, Option<f64>>,
}

#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Topic {
    ExptSchedule,
    ExptItemEval,
    AggrCalculate,
    EvaluatorCorrection,
    OnlineExptResult,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    ExptSchedule(ExptScheduleEvent),
    ExptItemEval(ExptItemEvalEvent),
    AggrCalculate(AggrCalculateEvent),
    EvaluatorCorrection(EvaluatorRecordCorrectionEvent),
    OnlineExptResult(OnlineExptResultEvent),
}

impl EngineEvent {
    pub fn topic(&self) -> Topic {
        match self {
            EngineEvent::ExptSchedule(_) => Topic::ExptSchedule,
            EngineEvent::ExptItemEval(_) => Topic::ExptItemEval,
            EngineEvent::AggrCalculate(_) => Topic::AggrCalculate,
            EngineEvent::EvaluatorCorrection(_) => Topic::EvaluatorCorrection,
            EngineEvent::OnlineExptResult(_) => Topic::OnlineExptResult,
        }
    }
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait EventPublisher: Send + Sync {
    /// Publishes `event`, delivering it after `delay` when one is given.
    async fn publish(&self, event: EngineEvent, delay: Option<Duration>) -> Result<(), Error>;

    async fn batch_publish(&self, events: Vec<EngineEvent>) -> Result<(), Error> {
        for event in events {
            self.publish(event, None).await?;
        }
        Ok(())
    }
}
