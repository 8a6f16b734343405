use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Content;
use crate::llm::{Message, TokenUsage};

/// Error recorded on a target or evaluator record.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RecordError {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TargetInput {
    pub fields: BTreeMap<String, Content>,
    /// Earlier turns of the same item, oldest first.
    pub history: Vec<Message>,
    pub ext: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TargetOutput {
    pub output_fields: BTreeMap<String, Content>,
    pub usage: TokenUsage,
    pub time_consuming_ms: i64,
    pub error: Option<RecordError>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum TargetRunStatus {
    #[default]
    Unknown,
    Success,
    Fail,
}

/// Immutable record of one target invocation.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvalTargetRecord {
    pub id: i64,
    pub space_id: i64,
    pub target_id: i64,
    pub target_version_id: i64,
    pub experiment_run_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub log_id: String,
    pub input: TargetInput,
    pub output: TargetOutput,
    pub status: TargetRunStatus,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorInput {
    pub input_fields: BTreeMap<String, Content>,
    pub evaluate_target_output_fields: BTreeMap<String, Content>,
    pub history: Vec<Message>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorOutput {
    pub score: Option<f64>,
    pub reasoning: String,
    pub usage: TokenUsage,
    pub error: Option<RecordError>,
}

/// Human override of an evaluator score.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Correction {
    pub score: Option<f64>,
    pub explain: String,
    pub updated_by: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum EvaluatorRunStatus {
    #[default]
    Unknown,
    Success,
    Fail,
}

/// Record of one evaluator invocation. Unique per
/// `(experiment_run_id, item_id, turn_id, evaluator_version_id)`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvaluatorRecord {
    pub id: i64,
    pub space_id: i64,
    pub experiment_id: i64,
    pub experiment_run_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub evaluator_version_id: i64,
    pub target_record_id: i64,
    pub log_id: String,
    pub input: EvaluatorInput,
    pub output: EvaluatorOutput,
    pub correction: Option<Correction>,
    pub status: EvaluatorRunStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EvaluatorRecord {
    /// The corrected score when a correction carries one, otherwise the raw score.
    pub fn get_score(&self) -> Option<f64> {
        self.correction
            .as_ref()
            .and_then(|correction| correction.score)
            .or(self.output.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_score_prefers_correction() {
        let mut record = EvaluatorRecord {
            output: EvaluatorOutput {
                score: Some(0.4),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(record.get_score(), Some(0.4));

        record.correction = Some(Correction {
            score: Some(1.0),
            explain: "reviewed".to_string(),
            updated_by: "alice".to_string(),
        });
        assert_eq!(record.get_score(), Some(1.0));
        assert_eq!(record.output.score, Some(0.4));

        record.correction = Some(Correction::default());
        assert_eq!(record.get_score(), Some(0.4));
    }
}
