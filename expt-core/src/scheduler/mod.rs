//! Experiment scheduler: one tick per live run, driven by [`ExptScheduleEvent`]s.
//!
//! A tick takes the run's lock, starts the run on its first tick, scans the item table,
//! dispatches queued items up to the experiment's item concurrency and either schedules the
//! next tick or finalizes the experiment. Every step is safe to repeat: ticks may be
//! redelivered, skipped or run concurrently on different processes.

mod mode;
mod sweeper;

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::engine::EngineDeps;
use crate::error::{Error, ErrorDetails};
use crate::events::{EngineEvent, ExptItemEvalEvent, ExptScheduleEvent};
use crate::repo::{
    ExperimentQueries, ItemQueries, ItemStateUpdate, RunQueries, RunUpdate, StatsQueries,
};
use crate::retry_ctrl::ResultErrConverter;
use crate::state::complete_expt;
use crate::types::{ExptStatus, Experiment, ItemRunState, StatsDelta};

pub use mode::{
    AppendMode, ExptSchedulerMode, FailRetryMode, ScanResult, ScheduleCtx, SubmitMode,
    scheduler_mode, validate_eval_conf,
};
pub use sweeper::sweep_zombie_experiments;

#[derive(Clone)]
pub struct ExptScheduler {
    deps: EngineDeps,
}

impl ExptScheduler {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip_all, fields(space_id = event.space_id, experiment_id = event.experiment_id, run_id = event.run_id, run_mode = %event.run_mode))]
    pub async fn schedule(&self, event: ExptScheduleEvent) -> Result<(), Error> {
        let ctx = ScheduleCtx {
            deps: &self.deps,
            config: self.deps.config.snapshot(),
            now: Utc::now(),
        };
        let mode = scheduler_mode(event.run_mode);
        if !mode.schedule_start(&ctx, &event).await? {
            debug!("Another tick holds the schedule lock, skipping");
            return Ok(());
        }

        let result = self.tick(&ctx, mode, &event).await;
        if let Err(e) = mode.schedule_end(&ctx, &event).await {
            warn!("Failed to release schedule lock: {e}");
        }
        if let Err(e) = &result
            && e.is_retryable()
        {
            let delay = ctx.config.exec_conf(event.space_id).daemon_interval();
            self.deps
                .publisher
                .publish(EngineEvent::ExptSchedule(event.clone()), Some(delay))
                .await?;
            warn!("Tick failed, rescheduled: {e}");
        }
        result
    }

    async fn tick(
        &self,
        ctx: &ScheduleCtx<'_>,
        mode: &dyn ExptSchedulerMode,
        event: &ExptScheduleEvent,
    ) -> Result<(), Error> {
        let repo = &self.deps.repo;
        let expt = repo
            .get_experiment(event.space_id, event.experiment_id)
            .await?;
        if expt.latest_run_id != event.run_id {
            info!(latest_run_id = expt.latest_run_id, "Dropping tick of a superseded run");
            return Ok(());
        }
        let run = repo
            .get_run(event.space_id, event.experiment_id, event.run_id)
            .await?;
        if run.is_ended() {
            debug!("Run already ended");
            return Ok(());
        }

        if expt.terminate_requested {
            complete_expt(
                ctx.deps,
                &expt,
                event.run_id,
                ExptStatus::UserTerminated,
                "terminated by user",
                Some(&format!("terminate:{}", event.run_id)),
            )
            .await?;
            return Ok(());
        }

        if !run.is_started() {
            match mode.expt_start(ctx, event, &expt).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(status = %expt.status, "Experiment can no longer start, ending run");
                    return self.end_run(&expt, event.run_id, expt.status).await;
                }
                Err(e) => return self.handle_start_error(ctx, event, &expt, e).await,
            }
        }

        let expt = repo
            .get_experiment(event.space_id, event.experiment_id)
            .await?;
        if expt.status.is_terminal() {
            // Status landed but the run never ended: finish the completion
            complete_expt(
                ctx.deps,
                &expt,
                event.run_id,
                expt.status,
                &expt.status_message,
                Some(&format!("run_end:{}", event.run_id)),
            )
            .await?;
            return Ok(());
        }
        if expt.deadline_exceeded(ctx.now) {
            complete_expt(
                ctx.deps,
                &expt,
                event.run_id,
                ExptStatus::SystemTerminated,
                "maximum alive time exceeded",
                Some(&format!("deadline:{}", event.run_id)),
            )
            .await?;
            return Ok(());
        }

        let scan = mode.scan_eval_items(ctx, event, &expt).await?;
        self.dispatch_items(ctx, event, &expt, &scan).await?;
        let next_tick = mode
            .expt_end(ctx, event, &expt, scan.to_submit.len(), scan.incomplete.len())
            .await?;
        debug!(
            to_submit = scan.to_submit.len(),
            incomplete = scan.incomplete.len(),
            complete = scan.complete.len(),
            next_tick,
            "Tick done"
        );
        mode.next_tick(ctx, event, next_tick).await
    }

    async fn handle_start_error(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
        err: Error,
    ) -> Result<(), Error> {
        match err.get_details() {
            ErrorDetails::AdmissionDenied { .. } => {
                let daemon = ctx.config.exec_conf(event.space_id).daemon_interval();
                let backoff = Duration::from_secs(1u64 << event.retry_times.min(16));
                let retry = ExptScheduleEvent {
                    retry_times: event.retry_times.saturating_add(1),
                    ..event.clone()
                };
                self.deps
                    .publisher
                    .publish(EngineEvent::ExptSchedule(retry), Some(backoff.min(daemon)))
                    .await
            }
            ErrorDetails::InvalidEvaluationConfig { .. } | ErrorDetails::Config { .. } => {
                let message = ResultErrConverter::new(&ctx.config).user_message(&err);
                match complete_expt(
                    ctx.deps,
                    expt,
                    event.run_id,
                    ExptStatus::Failed,
                    &message,
                    Some(&format!("start_failed:{}", event.run_id)),
                )
                .await
                {
                    Ok(_) => Ok(()),
                    Err(e) if !e.is_retryable() => {
                        self.end_run(expt, event.run_id, ExptStatus::Failed).await
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Err(err),
        }
    }

    async fn end_run(
        &self,
        expt: &Experiment,
        run_id: i64,
        status: ExptStatus,
    ) -> Result<(), Error> {
        self.deps
            .repo
            .update_run(
                expt.space_id,
                expt.id,
                run_id,
                RunUpdate {
                    status: Some(status),
                    started_at: None,
                    ended_at: Some(Utc::now()),
                },
            )
            .await
    }

    /// Publishes item events for queued items while the experiment has free item slots.
    async fn dispatch_items(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
        scan: &ScanResult,
    ) -> Result<(), Error> {
        let cap = expt
            .eval_conf
            .item_concur_num
            .unwrap_or(ctx.config.item_eval_conf(expt.space_id).concur_num)
            .max(1);
        let slots = cap.saturating_sub(scan.incomplete.len());
        let mut delta = StatsDelta::default();
        let mut events = Vec::new();
        for item in scan.to_submit.iter().take(slots) {
            let claimed = self
                .deps
                .repo
                .cas_item_state(
                    expt.space_id,
                    expt.id,
                    item.item_id,
                    ItemStateUpdate {
                        from: vec![ItemRunState::Queueing],
                        to: ItemRunState::Processing,
                        run_id: Some(event.run_id),
                        err_msg: None,
                        updated_before: None,
                    },
                )
                .await?;
            if !claimed {
                continue;
            }
            let moved = StatsDelta::dispatch(item.turn_cnt);
            delta.pending += moved.pending;
            delta.processing += moved.processing;
            events.push(EngineEvent::ExptItemEval(ExptItemEvalEvent {
                space_id: expt.space_id,
                experiment_id: expt.id,
                run_id: event.run_id,
                run_mode: event.run_mode,
                eval_set_item_id: item.item_id,
                retry_times: 0,
                created_at: ctx.now,
                ext: event.ext.clone(),
                session: event.session.clone(),
            }));
        }
        if events.is_empty() {
            return Ok(());
        }
        self.deps
            .repo
            .apply_stats_delta(expt.space_id, expt.id, delta)
            .await?;
        debug!(dispatched = events.len(), cap, "Dispatching items");
        self.deps.publisher.batch_publish(events).await
    }
}
