//! Human corrections of evaluator scores.

use tracing::{info, instrument};

use crate::engine::EngineDeps;
use crate::error::{Error, ErrorDetails};
use crate::events::{AggrCalculateEvent, EngineEvent, EvaluatorRecordCorrectionEvent};
use crate::repo::RecordQueries;

/// Stores a correction on its evaluator record and re-aggregates the evaluator.
///
/// The raw score stays on the record; aggregates read the corrected one. The experiment's
/// status is never touched.
#[derive(Clone)]
pub struct CorrectionHandler {
    deps: EngineDeps,
}

impl CorrectionHandler {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip_all, fields(space_id = event.space_id, experiment_id = event.experiment_id, record_id = event.evaluator_record_id))]
    pub async fn apply(&self, event: EvaluatorRecordCorrectionEvent) -> Result<(), Error> {
        let repo = &self.deps.repo;
        let record = repo
            .get_evaluator_record(event.space_id, event.evaluator_record_id)
            .await?
            .ok_or_else(|| {
                Error::new(ErrorDetails::EvaluatorRecordNotFound {
                    record_id: event.evaluator_record_id,
                })
            })?;
        if record.experiment_id != event.experiment_id {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!(
                    "Evaluator record {} belongs to experiment {}, not {}",
                    record.id, record.experiment_id, event.experiment_id
                ),
            }));
        }
        let record = repo
            .update_evaluator_correction(
                event.space_id,
                event.evaluator_record_id,
                event.correction,
            )
            .await?;
        info!(
            evaluator_version_id = record.evaluator_version_id,
            "Applied evaluator correction"
        );
        self.deps
            .publisher
            .publish(
                EngineEvent::AggrCalculate(AggrCalculateEvent::for_evaluator(
                    event.space_id,
                    record.experiment_id,
                    record.evaluator_version_id,
                )),
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{RecordingPublisher, test_deps};
    use crate::events::CalculateType;
    use crate::types::{Correction, EvaluatorOutput, EvaluatorRecord, EvaluatorRunStatus};

    #[tokio::test]
    async fn test_correction_shadows_score_and_requests_aggregation() {
        let publisher = RecordingPublisher::default();
        let deps = test_deps(publisher.clone());
        let record_id = deps
            .repo
            .save_evaluator_record(EvaluatorRecord {
                space_id: 1,
                experiment_id: 10,
                experiment_run_id: 1,
                item_id: 1,
                turn_id: 1,
                evaluator_version_id: 7,
                status: EvaluatorRunStatus::Success,
                output: EvaluatorOutput {
                    score: Some(0.4),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let handler = CorrectionHandler::new(deps.clone());
        handler
            .apply(EvaluatorRecordCorrectionEvent {
                space_id: 1,
                experiment_id: 10,
                evaluator_record_id: record_id,
                correction: Correction {
                    score: Some(1.0),
                    explain: "reference was wrong".to_string(),
                    updated_by: "reviewer".to_string(),
                },
            })
            .await
            .unwrap();

        let record = deps
            .repo
            .get_evaluator_record(1, record_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get_score(), Some(1.0));
        assert_eq!(record.output.score, Some(0.4));
        let (event, _) = publisher.pop().unwrap();
        let EngineEvent::AggrCalculate(event) = event else {
            panic!("expected an aggregate event");
        };
        assert_eq!(
            event.calculate_type,
            CalculateType::UpdateSpecificField {
                field_type: crate::types::FieldType::EvaluatorScore,
                field_key: "7".to_string(),
            }
        );

        let err = handler
            .apply(EvaluatorRecordCorrectionEvent {
                space_id: 1,
                experiment_id: 10,
                evaluator_record_id: 999,
                correction: Correction::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::EvaluatorRecordNotFound { .. }
        ));
    }
}
