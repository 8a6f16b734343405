use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Experiment lifecycle status. The numeric codes are the persisted representation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
pub enum ExptStatus {
    #[default]
    Unknown,
    Pending,
    Processing,
    Success,
    Failed,
    UserTerminated,
    SystemTerminated,
    Draining,
}

impl ExptStatus {
    pub fn code(self) -> i32 {
        match self {
            ExptStatus::Unknown => 0,
            ExptStatus::Pending => 2,
            ExptStatus::Processing => 3,
            ExptStatus::Success => 11,
            ExptStatus::Failed => 12,
            ExptStatus::UserTerminated => 13,
            ExptStatus::SystemTerminated => 14,
            ExptStatus::Draining => 21,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            2 => ExptStatus::Pending,
            3 => ExptStatus::Processing,
            11 => ExptStatus::Success,
            12 => ExptStatus::Failed,
            13 => ExptStatus::UserTerminated,
            14 => ExptStatus::SystemTerminated,
            21 => ExptStatus::Draining,
            _ => ExptStatus::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExptStatus::Success
                | ExptStatus::Failed
                | ExptStatus::UserTerminated
                | ExptStatus::SystemTerminated
        )
    }

    /// Statuses in which the scheduler keeps ticking.
    pub fn is_running(self) -> bool {
        matches!(self, ExptStatus::Processing | ExptStatus::Draining)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ExptType {
    #[default]
    Offline,
    Online,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum SourceType {
    #[default]
    Evaluation,
    Trace,
}

/// Reference to an evaluator by id, never by embedding it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EvaluatorRef {
    pub evaluator_id: i64,
    pub evaluator_version_id: i64,
}

/// Maps an input field of a target or evaluator to where its value comes from.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FieldConf {
    /// Name of the field in the callee's input.
    pub field_name: String,
    /// Name of the source field (eval-set column or target output field).
    #[serde(default)]
    pub from_field: String,
    /// Literal value used instead of `from_field` when present.
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FieldAdapter {
    #[serde(default)]
    pub field_confs: Vec<FieldConf>,
}

impl FieldAdapter {
    pub fn is_empty(&self) -> bool {
        self.field_confs.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TargetIngressConf {
    #[serde(default)]
    pub eval_set_adapter: FieldAdapter,
    #[serde(default)]
    pub custom_conf: Option<FieldAdapter>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TargetConf {
    pub target_version_id: i64,
    #[serde(default)]
    pub ingress_conf: Option<TargetIngressConf>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorIngressConf {
    #[serde(default)]
    pub eval_set_adapter: FieldAdapter,
    #[serde(default)]
    pub target_adapter: FieldAdapter,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorConf {
    pub evaluator_version_id: i64,
    #[serde(default)]
    pub ingress_conf: Option<EvaluatorIngressConf>,
}

/// How eval-set fields and target outputs are routed into the target and evaluators.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluationConfiguration {
    #[serde(default)]
    pub item_concur_num: Option<usize>,
    #[serde(default)]
    pub evaluator_concur_num: Option<usize>,
    #[serde(default)]
    pub target_conf: Option<TargetConf>,
    #[serde(default)]
    pub evaluators_conf: Vec<EvaluatorConf>,
}

impl EvaluationConfiguration {
    pub fn evaluator_conf(&self, evaluator_version_id: i64) -> Option<&EvaluatorConf> {
        self.evaluators_conf
            .iter()
            .find(|conf| conf.evaluator_version_id == evaluator_version_id)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Experiment {
    pub id: i64,
    pub space_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub eval_set_id: i64,
    pub eval_set_version_id: i64,
    pub target_id: i64,
    pub target_version_id: i64,
    pub evaluator_refs: Vec<EvaluatorRef>,
    pub eval_conf: EvaluationConfiguration,
    #[serde(default)]
    pub status: ExptStatus,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub latest_run_id: i64,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expt_type: ExptType,
    #[serde(default)]
    pub source_type: SourceType,
    /// Seconds the experiment may stay running before it is terminated by the system.
    #[serde(default)]
    pub max_alive_time: Option<u64>,
    /// Annotation tag keys that must be active for the experiment to be admitted.
    #[serde(default)]
    pub tag_key_ids: Vec<i64>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub last_tick_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminate_requested: bool,
}

impl Experiment {
    pub fn evaluator_version_ids(&self) -> Vec<i64> {
        self.evaluator_refs
            .iter()
            .map(|r| r.evaluator_version_id)
            .collect()
    }

    /// True once `max_alive_time` has elapsed since the experiment started.
    pub fn deadline_exceeded(&self, now: DateTime<Utc>) -> bool {
        match (self.start_at, self.max_alive_time) {
            (Some(start), Some(max_alive)) => {
                let max_alive = i64::try_from(max_alive).unwrap_or(i64::MAX);
                (now - start).num_seconds() >= max_alive
            }
            _ => false,
        }
    }
}
