use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum FieldType {
    #[default]
    EvaluatorScore,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AggregatorType {
    Average,
    Sum,
    Max,
    Min,
    Distribution,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ScoreBucket {
    /// Score rendered as text, or `other` for the folded tail.
    pub score: String,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregateData {
    Value { value: f64 },
    Distribution { buckets: Vec<ScoreBucket> },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AggregatorResult {
    pub aggregator_type: AggregatorType,
    pub data: AggregateData,
}

/// Per-evaluator aggregate row. Writes are conditional on `version`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExptAggrResult {
    pub space_id: i64,
    pub experiment_id: i64,
    pub field_type: FieldType,
    pub field_key: String,
    /// Average score, denormalized for listing.
    pub score: f64,
    pub aggr_result: Vec<AggregatorResult>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl ExptAggrResult {
    pub fn value_of(&self, aggregator_type: AggregatorType) -> Option<f64> {
        self.aggr_result
            .iter()
            .find(|result| result.aggregator_type == aggregator_type)
            .and_then(|result| match &result.data {
                AggregateData::Value { value } => Some(*value),
                AggregateData::Distribution { .. } => None,
            })
    }

    pub fn distribution(&self) -> Option<&[ScoreBucket]> {
        self.aggr_result.iter().find_map(|result| match &result.data {
            AggregateData::Distribution { buckets } => Some(buckets.as_slice()),
            AggregateData::Value { .. } => None,
        })
    }
}
