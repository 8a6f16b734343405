//! Per-evaluator score aggregation.
//!
//! Aggregates are always recomputed from the evaluator records, never patched, so any number
//! of [`AggrCalculateEvent`]s for the same evaluator converge on the same row. Rows are
//! written with a version check; a writer that loses the race recomputes and tries again.

use std::collections::HashMap;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::engine::EngineDeps;
use crate::error::{Error, ErrorDetails};
use crate::events::{AggrCalculateEvent, CalculateType};
use crate::observability::AGGR_CONFLICTS_TOTAL;
use crate::repo::{AggrQueries, ExperimentQueries, RecordQueries};
use crate::types::{
    AggregateData, AggregatorResult, AggregatorType, EvaluatorRecord, EvaluatorRunStatus,
    ExptAggrResult, FieldType, ScoreBucket,
};
use crate::utils::retries::RetryConfig;

/// Buckets kept in a distribution before the tail is folded into [`OTHER_BUCKET`].
pub const DISTRIBUTION_TOP_N: usize = 5;
pub const OTHER_BUCKET: &str = "other";

/// Three attempts in total.
const WRITE_RETRY: RetryConfig = RetryConfig {
    num_retries: 2,
    min_delay_ms: 10,
    max_delay_s: 0.2,
};

#[derive(Clone)]
pub struct ResultAggregator {
    deps: EngineDeps,
}

impl ResultAggregator {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip_all, fields(space_id = event.space_id, experiment_id = event.experiment_id))]
    pub async fn calculate(&self, event: AggrCalculateEvent) -> Result<(), Error> {
        let evaluator_version_ids = match &event.calculate_type {
            CalculateType::CreateAll => self
                .deps
                .repo
                .get_experiment(event.space_id, event.experiment_id)
                .await?
                .evaluator_version_ids(),
            CalculateType::UpdateSpecificField {
                field_type: FieldType::EvaluatorScore,
                field_key,
            } => {
                let evaluator_version_id = field_key.parse::<i64>().map_err(|e| {
                    Error::new(ErrorDetails::InvalidRequest {
                        message: format!("Invalid evaluator field key `{field_key}`: {e}"),
                    })
                })?;
                vec![evaluator_version_id]
            }
        };
        for evaluator_version_id in evaluator_version_ids {
            self.aggregate_evaluator(event.space_id, event.experiment_id, evaluator_version_id)
                .await?;
        }
        Ok(())
    }

    async fn aggregate_evaluator(
        &self,
        space_id: i64,
        experiment_id: i64,
        evaluator_version_id: i64,
    ) -> Result<(), Error> {
        let result = WRITE_RETRY
            .retry(|| self.try_aggregate(space_id, experiment_id, evaluator_version_id))
            .await;
        match result {
            Err(e) if matches!(e.get_details(), ErrorDetails::ConcurrentModification { .. }) => {
                counter!(AGGR_CONFLICTS_TOTAL).increment(1);
                warn!(
                    evaluator_version_id,
                    "Dropping aggregate write after repeated version conflicts"
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn try_aggregate(
        &self,
        space_id: i64,
        experiment_id: i64,
        evaluator_version_id: i64,
    ) -> Result<(), Error> {
        let repo = &self.deps.repo;
        let records = repo
            .list_evaluator_records(space_id, experiment_id, evaluator_version_id)
            .await?;
        let scores = latest_scores(&records);
        let Some((aggr_result, average)) = compute_aggregates(&scores) else {
            debug!(evaluator_version_id, "No scores to aggregate yet");
            return Ok(());
        };

        let field_key = evaluator_version_id.to_string();
        let existing = repo
            .get_aggr_result(
                space_id,
                experiment_id,
                FieldType::EvaluatorScore,
                field_key.clone(),
            )
            .await?;
        let mut row = ExptAggrResult {
            space_id,
            experiment_id,
            field_type: FieldType::EvaluatorScore,
            field_key,
            score: average,
            aggr_result,
            version: 1,
            updated_at: Utc::now(),
        };
        let written = match existing {
            None => repo.create_aggr_result(row).await?,
            Some(existing) => {
                row.version = existing.version + 1;
                repo.update_aggr_result_if_version(row, existing.version)
                    .await?
            }
        };
        if !written {
            return Err(Error::new(ErrorDetails::ConcurrentModification {
                message: format!(
                    "aggregate of evaluator version {evaluator_version_id} in experiment {experiment_id} changed underneath"
                ),
            }));
        }
        debug!(evaluator_version_id, count = scores.len(), "Aggregate written");
        Ok(())
    }
}

/// Scores that count towards the aggregate: for each turn, the record of its latest run,
/// if that record succeeded and has a score. Corrections shadow raw scores.
pub fn latest_scores(records: &[EvaluatorRecord]) -> Vec<f64> {
    let mut latest: HashMap<(i64, i64), &EvaluatorRecord> = HashMap::new();
    for record in records {
        latest
            .entry((record.item_id, record.turn_id))
            .and_modify(|current| {
                if (record.experiment_run_id, record.id) > (current.experiment_run_id, current.id) {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    let mut scores: Vec<(i64, i64, f64)> = latest
        .into_values()
        .filter(|record| record.status == EvaluatorRunStatus::Success)
        .filter_map(|record| {
            record
                .get_score()
                .map(|score| (record.item_id, record.turn_id, score))
        })
        .collect();
    scores.sort_by_key(|(item_id, turn_id, _)| (*item_id, *turn_id));
    scores.into_iter().map(|(_, _, score)| score).collect()
}

/// Computes every aggregator over `scores`, returning them with the average.
pub fn compute_aggregates(scores: &[f64]) -> Option<(Vec<AggregatorResult>, f64)> {
    if scores.is_empty() {
        return None;
    }
    let sum: f64 = scores.iter().sum();
    let average = sum / scores.len() as f64;
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);

    let value = |aggregator_type, value| AggregatorResult {
        aggregator_type,
        data: AggregateData::Value { value },
    };
    let results = vec![
        value(AggregatorType::Average, average),
        value(AggregatorType::Sum, sum),
        value(AggregatorType::Max, max),
        value(AggregatorType::Min, min),
        AggregatorResult {
            aggregator_type: AggregatorType::Distribution,
            data: AggregateData::Distribution {
                buckets: score_distribution(scores),
            },
        },
    ];
    Some((results, average))
}

/// Most frequent scores first (ties by label), the tail beyond [`DISTRIBUTION_TOP_N`]
/// folded into one [`OTHER_BUCKET`].
fn score_distribution(scores: &[f64]) -> Vec<ScoreBucket> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for score in scores {
        *counts.entry(format!("{score}")).or_default() += 1;
    }
    let mut counts: Vec<(String, i64)> = counts.into_iter().collect();
    counts.sort_by(|(a_label, a_count), (b_label, b_count)| {
        b_count.cmp(a_count).then_with(|| a_label.cmp(b_label))
    });

    let total = scores.len() as f64;
    let bucket = |score: String, count: i64| ScoreBucket {
        score,
        count,
        percentage: count as f64 / total,
    };
    let other: i64 = counts
        .iter()
        .skip(DISTRIBUTION_TOP_N)
        .map(|(_, count)| count)
        .sum();
    let mut buckets: Vec<ScoreBucket> = counts
        .into_iter()
        .take(DISTRIBUTION_TOP_N)
        .map(|(label, count)| bucket(label, count))
        .collect();
    if other > 0 {
        buckets.push(bucket(OTHER_BUCKET.to_string(), other));
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{RecordingPublisher, test_deps};
    use crate::types::{Correction, EvaluatorOutput};

    fn record(run: i64, item: i64, status: EvaluatorRunStatus, score: f64) -> EvaluatorRecord {
        EvaluatorRecord {
            space_id: 1,
            experiment_id: 10,
            experiment_run_id: run,
            item_id: item,
            turn_id: item * 10,
            evaluator_version_id: 7,
            status,
            output: EvaluatorOutput {
                score: Some(score),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregates() {
        let (results, average) = compute_aggregates(&[0.4, 0.8, 0.6]).unwrap();
        assert!((average - 0.6).abs() < 1e-9);
        let row = ExptAggrResult {
            space_id: 1,
            experiment_id: 1,
            field_type: FieldType::EvaluatorScore,
            field_key: "7".to_string(),
            score: average,
            aggr_result: results,
            version: 1,
            updated_at: Utc::now(),
        };
        assert!((row.value_of(AggregatorType::Sum).unwrap() - 1.8).abs() < 1e-9);
        assert_eq!(row.value_of(AggregatorType::Max), Some(0.8));
        assert_eq!(row.value_of(AggregatorType::Min), Some(0.4));
        assert_eq!(row.distribution().unwrap().len(), 3);
        assert!(compute_aggregates(&[]).is_none());
    }

    #[test]
    fn test_distribution_folds_tail() {
        let scores = [1.0, 1.0, 1.0, 0.5, 0.5, 0.1, 0.2, 0.3, 0.4, 0.6];
        let buckets = score_distribution(&scores);
        let labels: Vec<&str> = buckets.iter().map(|b| b.score.as_str()).collect();
        assert_eq!(labels, vec!["1", "0.5", "0.1", "0.2", "0.3", OTHER_BUCKET]);
        assert_eq!(buckets.last().unwrap().count, 2);
        let total: f64 = buckets.iter().map(|b| b.percentage).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_latest_run_wins_and_failures_drop_out() {
        let mut corrected = record(1, 1, EvaluatorRunStatus::Success, 0.2);
        corrected.correction = Some(Correction {
            score: Some(0.9),
            explain: String::new(),
            updated_by: "reviewer".to_string(),
        });
        let records = vec![
            corrected,
            record(1, 2, EvaluatorRunStatus::Success, 0.5),
            record(2, 2, EvaluatorRunStatus::Success, 0.7),
            record(1, 3, EvaluatorRunStatus::Success, 0.3),
            record(2, 3, EvaluatorRunStatus::Fail, 0.0),
        ];
        assert_eq!(latest_scores(&records), vec![0.9, 0.7]);
    }

    #[tokio::test]
    async fn test_calculate_creates_then_bumps_version() {
        let deps = test_deps(RecordingPublisher::default());
        for record in [
            record(1, 1, EvaluatorRunStatus::Success, 0.4),
            record(1, 2, EvaluatorRunStatus::Success, 0.8),
        ] {
            deps.repo.save_evaluator_record(record).await.unwrap();
        }
        let aggregator = ResultAggregator::new(deps.clone());
        aggregator
            .calculate(AggrCalculateEvent::for_evaluator(1, 10, 7))
            .await
            .unwrap();
        let row = deps
            .repo
            .get_aggr_result(1, 10, FieldType::EvaluatorScore, "7".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.version, 1);
        assert!((row.score - 0.6).abs() < 1e-9);

        aggregator
            .calculate(AggrCalculateEvent::for_evaluator(1, 10, 7))
            .await
            .unwrap();
        let row = deps
            .repo
            .get_aggr_result(1, 10, FieldType::EvaluatorScore, "7".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn test_bad_field_key_is_rejected() {
        let deps = test_deps(RecordingPublisher::default());
        let event = AggrCalculateEvent {
            space_id: 1,
            experiment_id: 10,
            calculate_type: CalculateType::UpdateSpecificField {
                field_type: FieldType::EvaluatorScore,
                field_key: "seven".to_string(),
            },
        };
        let err = ResultAggregator::new(deps).calculate(event).await.unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::InvalidRequest { .. }));
    }
}
