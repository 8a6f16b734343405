//! Lifecycle operations exposed to callers: create, run, terminate, drain, complete,
//! correct, and read back results.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::engine::EngineDeps;
use crate::error::{Error, ErrorDetails};
use crate::events::{
    EngineEvent, EvaluatorRecordCorrectionEvent, ExptScheduleEvent, Session,
};
use crate::repo::{
    AggrQueries, ExperimentQueries, ExperimentUpdate, RecordQueries, RunQueries, StatsQueries,
    StatusUpdate, TurnResultQueries,
};
use crate::scheduler::validate_eval_conf;
use crate::state::{complete_expt, reopenable_from, validate_transition};
use crate::types::{
    Correction, EvaluationConfiguration, EvaluatorRef, Experiment, ExptAggrResult, ExptRun,
    ExptStats, ExptStatus, ExptTurnResult, ExptType, RunMode, SourceType,
};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CreateExperimentRequest {
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
    pub expt_type: ExptType,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub max_alive_time: Option<u64>,
    #[serde(default)]
    pub tag_key_ids: Vec<i64>,
    #[serde(default)]
    pub created_by: String,
}

#[derive(Clone)]
pub struct ExptManager {
    deps: EngineDeps,
}

impl ExptManager {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    /// Stores a new experiment in `Pending`. The evaluation configuration is checked here
    /// so that obviously broken experiments never reach the scheduler.
    #[instrument(skip_all, fields(space_id = request.space_id))]
    pub async fn create_experiment(
        &self,
        request: CreateExperimentRequest,
    ) -> Result<Experiment, Error> {
        if request.name.trim().is_empty() {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: "Experiment name must not be empty".to_string(),
            }));
        }
        let expt = Experiment {
            id: self.deps.ids.gen_id(),
            space_id: request.space_id,
            name: request.name,
            description: request.description,
            eval_set_id: request.eval_set_id,
            eval_set_version_id: request.eval_set_version_id,
            target_id: request.target_id,
            target_version_id: request.target_version_id,
            evaluator_refs: request.evaluator_refs,
            eval_conf: request.eval_conf,
            status: ExptStatus::Pending,
            expt_type: request.expt_type,
            source_type: request.source_type,
            max_alive_time: request.max_alive_time,
            tag_key_ids: request.tag_key_ids,
            created_by: request.created_by,
            ..Default::default()
        };
        validate_eval_conf(&expt)?;
        self.deps.repo.create_experiment(expt.clone()).await?;
        info!(experiment_id = expt.id, "Created experiment");
        Ok(expt)
    }

    /// Starts a new run and publishes its first tick.
    ///
    /// Submit needs a `Pending` experiment, FailRetry a `Failed` one; Append also reopens
    /// finished experiments. A run that has not ended blocks new ones.
    #[instrument(skip_all, fields(space_id = space_id, experiment_id = experiment_id, run_mode = %run_mode))]
    pub async fn run_expt(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_mode: RunMode,
        session: Session,
    ) -> Result<ExptRun, Error> {
        let repo = &self.deps.repo;
        let expt = repo.get_experiment(space_id, experiment_id).await?;
        if !reopenable_from(run_mode).contains(&expt.status) {
            return Err(Error::new(ErrorDetails::IllegalStatusTransition {
                from: expt.status.to_string(),
                to: ExptStatus::Processing.to_string(),
            }));
        }
        if expt.latest_run_id != 0 {
            let latest = repo
                .get_run(space_id, experiment_id, expt.latest_run_id)
                .await?;
            if !latest.is_ended() {
                return Err(Error::new(ErrorDetails::InvalidRequest {
                    message: format!(
                        "Run {} of experiment {experiment_id} is still in progress",
                        latest.id
                    ),
                }));
            }
        }

        let now = Utc::now();
        let run = ExptRun {
            id: self.deps.ids.gen_id(),
            space_id,
            experiment_id,
            run_mode,
            status: ExptStatus::Pending,
            created_by: session.user_id.clone(),
            created_at: now,
            started_at: None,
            ended_at: None,
        };
        repo.create_run(run.clone()).await?;
        repo.update_experiment(
            space_id,
            experiment_id,
            ExperimentUpdate {
                latest_run_id: Some(run.id),
                terminate_requested: Some(false),
                ..Default::default()
            },
        )
        .await?;
        self.deps
            .publisher
            .publish(
                EngineEvent::ExptSchedule(ExptScheduleEvent {
                    space_id,
                    experiment_id,
                    run_id: run.id,
                    run_mode,
                    retry_times: 0,
                    created_at: now,
                    ext: Default::default(),
                    session,
                }),
                None,
            )
            .await?;
        info!(run_id = run.id, "Run submitted");
        Ok(run)
    }

    /// Requests termination. The next tick of the live run completes the experiment as
    /// `UserTerminated`; an experiment that never ran is terminated at once.
    #[instrument(skip_all, fields(space_id = space_id, experiment_id = experiment_id))]
    pub async fn terminate_expt(&self, space_id: i64, experiment_id: i64) -> Result<(), Error> {
        let repo = &self.deps.repo;
        let expt = repo.get_experiment(space_id, experiment_id).await?;
        if expt.status.is_terminal() {
            return Err(Error::new(ErrorDetails::IllegalStatusTransition {
                from: expt.status.to_string(),
                to: ExptStatus::UserTerminated.to_string(),
            }));
        }
        if expt.latest_run_id == 0 {
            complete_expt(
                &self.deps,
                &expt,
                0,
                ExptStatus::UserTerminated,
                "terminated by user",
                Some("terminate:0"),
            )
            .await?;
            return Ok(());
        }

        repo.update_experiment(
            space_id,
            experiment_id,
            ExperimentUpdate {
                terminate_requested: Some(true),
                ..Default::default()
            },
        )
        .await?;
        let run = repo
            .get_run(space_id, experiment_id, expt.latest_run_id)
            .await?;
        if run.is_ended() {
            // No tick will observe the flag
            complete_expt(
                &self.deps,
                &expt,
                run.id,
                ExptStatus::UserTerminated,
                "terminated by user",
                Some(&format!("terminate:{}", run.id)),
            )
            .await?;
            return Ok(());
        }
        self.deps
            .publisher
            .publish(
                EngineEvent::ExptSchedule(ExptScheduleEvent {
                    space_id,
                    experiment_id,
                    run_id: run.id,
                    run_mode: run.run_mode,
                    retry_times: 0,
                    created_at: Utc::now(),
                    ext: Default::default(),
                    session: Session {
                        user_id: run.created_by,
                        app_id: 0,
                    },
                }),
                None,
            )
            .await?;
        info!(run_id = run.id, "Termination requested");
        Ok(())
    }

    /// Stops an online experiment from taking new items; it completes once in-flight items
    /// finish.
    #[instrument(skip_all, fields(space_id = space_id, experiment_id = experiment_id))]
    pub async fn drain_expt(&self, space_id: i64, experiment_id: i64) -> Result<(), Error> {
        let expt = self
            .deps
            .repo
            .get_experiment(space_id, experiment_id)
            .await?;
        if expt.expt_type != ExptType::Online {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("Experiment {experiment_id} is not an online experiment"),
            }));
        }
        validate_transition(expt.expt_type, expt.status, ExptStatus::Draining)?;
        let applied = self
            .deps
            .repo
            .cas_experiment_status(
                space_id,
                experiment_id,
                StatusUpdate {
                    from: vec![expt.status],
                    to: ExptStatus::Draining,
                    status_message: None,
                    end_at: None,
                },
            )
            .await?;
        if !applied {
            return Err(Error::new(ErrorDetails::ConcurrentModification {
                message: format!("status of experiment {experiment_id} moved while draining"),
            }));
        }
        info!("Experiment draining");
        Ok(())
    }

    /// Completes the experiment's latest run into a terminal `status`. Returns whether the
    /// status changed; repeating a `cid` is a no-op.
    pub async fn complete_expt(
        &self,
        space_id: i64,
        experiment_id: i64,
        status: ExptStatus,
        status_message: &str,
        cid: Option<&str>,
    ) -> Result<bool, Error> {
        let expt = self
            .deps
            .repo
            .get_experiment(space_id, experiment_id)
            .await?;
        complete_expt(
            &self.deps,
            &expt,
            expt.latest_run_id,
            status,
            status_message,
            cid,
        )
        .await
    }

    /// Queues a correction of one evaluator record.
    pub async fn correct_evaluator_record(
        &self,
        space_id: i64,
        experiment_id: i64,
        evaluator_record_id: i64,
        correction: Correction,
    ) -> Result<(), Error> {
        let record = self
            .deps
            .repo
            .get_evaluator_record(space_id, evaluator_record_id)
            .await?
            .filter(|record| record.experiment_id == experiment_id)
            .ok_or_else(|| {
                Error::new(ErrorDetails::EvaluatorRecordNotFound {
                    record_id: evaluator_record_id,
                })
            })?;
        self.deps
            .publisher
            .publish(
                EngineEvent::EvaluatorCorrection(EvaluatorRecordCorrectionEvent {
                    space_id,
                    experiment_id,
                    evaluator_record_id: record.id,
                    correction,
                }),
                None,
            )
            .await
    }

    pub async fn get_experiment(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Experiment, Error> {
        self.deps.repo.get_experiment(space_id, experiment_id).await
    }

    pub async fn get_expt_stats(&self, space_id: i64, experiment_id: i64) -> Result<ExptStats, Error> {
        self.deps.repo.get_stats(space_id, experiment_id).await
    }

    pub async fn get_aggr_results(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Vec<ExptAggrResult>, Error> {
        self.deps
            .repo
            .list_aggr_results(space_id, experiment_id)
            .await
    }

    pub async fn list_turn_results(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Vec<ExptTurnResult>, Error> {
        self.deps
            .repo
            .list_experiment_turn_results(space_id, experiment_id)
            .await
    }

    pub async fn list_runs(&self, space_id: i64, experiment_id: i64) -> Result<Vec<ExptRun>, Error> {
        self.deps.repo.list_runs(space_id, experiment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{RecordingPublisher, SPACE_ID, create_request, test_deps};
    use crate::events::Topic;

    #[tokio::test]
    async fn test_create_rejects_broken_configuration() {
        let manager = ExptManager::new(test_deps(RecordingPublisher::default()));
        let mut request = create_request();
        request.eval_conf.target_conf = None;
        let err = manager.create_experiment(request).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::InvalidEvaluationConfig { .. }
        ));

        let mut request = create_request();
        request.name = "  ".to_string();
        assert!(manager.create_experiment(request).await.is_err());
    }

    #[tokio::test]
    async fn test_run_expt_checks_status_and_live_runs() {
        let publisher = RecordingPublisher::default();
        let manager = ExptManager::new(test_deps(publisher.clone()));
        let expt = manager.create_experiment(create_request()).await.unwrap();

        let err = manager
            .run_expt(SPACE_ID, expt.id, RunMode::FailRetry, Session::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::IllegalStatusTransition { .. }
        ));

        let run = manager
            .run_expt(SPACE_ID, expt.id, RunMode::Submit, Session::default())
            .await
            .unwrap();
        assert_eq!(publisher.topics(), vec![Topic::ExptSchedule]);
        assert_eq!(
            manager.get_experiment(SPACE_ID, expt.id).await.unwrap().latest_run_id,
            run.id
        );

        let err = manager
            .run_expt(SPACE_ID, expt.id, RunMode::Submit, Session::default())
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_terminate_and_drain() {
        let publisher = RecordingPublisher::default();
        let manager = ExptManager::new(test_deps(publisher.clone()));

        let never_ran = manager.create_experiment(create_request()).await.unwrap();
        manager.terminate_expt(SPACE_ID, never_ran.id).await.unwrap();
        let stored = manager.get_experiment(SPACE_ID, never_ran.id).await.unwrap();
        assert_eq!(stored.status, ExptStatus::UserTerminated);
        assert!(manager.terminate_expt(SPACE_ID, never_ran.id).await.is_err());

        let offline = manager.create_experiment(create_request()).await.unwrap();
        let err = manager.drain_expt(SPACE_ID, offline.id).await.unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::InvalidRequest { .. }));

        let mut request = create_request();
        request.expt_type = ExptType::Online;
        let online = manager.create_experiment(request).await.unwrap();
        // Pending online experiments cannot drain yet
        assert!(manager.drain_expt(SPACE_ID, online.id).await.is_err());
    }
}
