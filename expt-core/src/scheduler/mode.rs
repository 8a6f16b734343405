//! Per-run-mode scheduling hooks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clients::{TagStatus, list_all_items};
use crate::config::EngineConfig;
use crate::engine::EngineDeps;
use crate::error::{Error, ErrorDetails, deserialize_err};
use crate::events::{EngineEvent, ExptScheduleEvent};
use crate::idem::{schedule_lock_key, space_running_key};
use crate::repo::{
    ExperimentQueries, ExperimentUpdate, ItemQueries, ItemStateUpdate, RunQueries, RunUpdate,
    StatsQueries, StatusUpdate, TurnResultQueries,
};
use crate::retry_ctrl::{ErrRetryController, ResultErrConverter};
use crate::state::{complete_expt, derive_final_status, reopenable_from};
use crate::types::{
    EvalSetItem, ExptEvalItem, ExptStatus, ExptType, Experiment, ItemRunState, RunMode,
    StatsDelta, TurnRunState,
};

/// State shared by the hooks of one tick.
pub struct ScheduleCtx<'a> {
    pub deps: &'a EngineDeps,
    pub config: Arc<EngineConfig>,
    pub now: DateTime<Utc>,
}

/// Items of an experiment split by what the scheduler still has to do with them.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub to_submit: Vec<ExptEvalItem>,
    pub incomplete: Vec<ExptEvalItem>,
    pub complete: Vec<ExptEvalItem>,
}

/// Hooks driving one run of an experiment.
///
/// The defaults implement the behavior shared by every mode; modes override only the steps
/// in which they differ.
#[async_trait]
pub trait ExptSchedulerMode: Send + Sync {
    fn run_mode(&self) -> RunMode;

    /// Seeds the item table for a run that was just admitted.
    async fn prepare_items(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
    ) -> Result<(), Error>;

    /// Takes the per-run scheduling lock. Returns false when another tick holds it.
    async fn schedule_start(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
    ) -> Result<bool, Error> {
        let ttl = ctx.config.exec_conf(event.space_id).daemon_interval() * 2;
        ctx.deps
            .idem
            .set_nx(&schedule_lock_key(event.experiment_id, event.run_id), ttl)
            .await
    }

    async fn schedule_end(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
    ) -> Result<(), Error> {
        ctx.deps
            .idem
            .del(&schedule_lock_key(event.experiment_id, event.run_id))
            .await
    }

    /// Admits the run and moves the experiment to `Processing`.
    ///
    /// Returns false if the experiment can no longer start, e.g. because it was terminated
    /// after the run was requested.
    async fn expt_start(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
    ) -> Result<bool, Error> {
        admit(ctx, expt).await?;

        let mut from = vec![ExptStatus::Pending, ExptStatus::Processing];
        from.extend_from_slice(reopenable_from(self.run_mode()));
        let started = ctx
            .deps
            .repo
            .cas_experiment_status(
                expt.space_id,
                expt.id,
                StatusUpdate {
                    from,
                    to: ExptStatus::Processing,
                    status_message: Some(String::new()),
                    end_at: None,
                },
            )
            .await?;
        if !started {
            release_space_slot(ctx, expt).await?;
            return Ok(false);
        }

        self.prepare_items(ctx, event, expt).await?;
        ctx.deps
            .repo
            .update_experiment(
                expt.space_id,
                expt.id,
                ExperimentUpdate {
                    start_at: Some(ctx.now),
                    last_tick_at: Some(ctx.now),
                    ..Default::default()
                },
            )
            .await?;
        ctx.deps
            .repo
            .update_run(
                expt.space_id,
                expt.id,
                event.run_id,
                RunUpdate {
                    status: Some(ExptStatus::Processing),
                    started_at: Some(ctx.now),
                    ended_at: None,
                },
            )
            .await?;
        info!("Run started");
        Ok(true)
    }

    async fn scan_eval_items(
        &self,
        ctx: &ScheduleCtx<'_>,
        _event: &ExptScheduleEvent,
        expt: &Experiment,
    ) -> Result<ScanResult, Error> {
        reclaim_zombie_items(ctx, expt).await?;
        classify_items(ctx, expt).await
    }

    /// Returns whether another tick is needed, finalizing the experiment when not.
    async fn expt_end(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
        to_submit: usize,
        incomplete: usize,
    ) -> Result<bool, Error> {
        if to_submit > 0 || incomplete > 0 {
            return Ok(true);
        }
        finalize_run(ctx, event, expt).await?;
        Ok(false)
    }

    async fn next_tick(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        next_tick: bool,
    ) -> Result<(), Error> {
        if !next_tick {
            return Ok(());
        }
        ctx.deps
            .repo
            .update_experiment(
                event.space_id,
                event.experiment_id,
                ExperimentUpdate {
                    last_tick_at: Some(ctx.now),
                    ..Default::default()
                },
            )
            .await?;
        let next = ExptScheduleEvent {
            retry_times: 0,
            ..event.clone()
        };
        ctx.deps
            .publisher
            .publish(
                EngineEvent::ExptSchedule(next),
                Some(ctx.config.exec_conf(event.space_id).daemon_interval()),
            )
            .await
    }
}

/// Runs every item of the bound eval-set version from scratch.
pub struct SubmitMode;

/// Re-runs the items whose last attempt failed with a retryable error.
pub struct FailRetryMode;

/// Runs the items added to the eval set since they were last scanned. Online experiments
/// keep scanning until they are drained.
pub struct AppendMode;

pub fn scheduler_mode(run_mode: RunMode) -> &'static dyn ExptSchedulerMode {
    match run_mode {
        RunMode::Submit => &SubmitMode,
        RunMode::FailRetry => &FailRetryMode,
        RunMode::Append => &AppendMode,
    }
}

#[async_trait]
impl ExptSchedulerMode for SubmitMode {
    fn run_mode(&self) -> RunMode {
        RunMode::Submit
    }

    async fn prepare_items(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
    ) -> Result<(), Error> {
        let eval_set_items = list_eval_set_items(ctx, expt).await?;
        let items: Vec<ExptEvalItem> = eval_set_items
            .iter()
            .enumerate()
            .map(|(idx, item)| new_item(ctx, expt, event.run_id, idx, item))
            .collect();
        let total_turns = items.iter().map(|item| item.turn_cnt).sum();
        ctx.deps
            .repo
            .replace_items(expt.space_id, expt.id, items)
            .await?;
        ctx.deps
            .repo
            .init_stats(expt.space_id, expt.id, total_turns)
            .await?;
        debug!(total_turns, "Seeded items");
        Ok(())
    }
}

#[async_trait]
impl ExptSchedulerMode for FailRetryMode {
    fn run_mode(&self) -> RunMode {
        RunMode::FailRetry
    }

    async fn prepare_items(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
    ) -> Result<(), Error> {
        let items = ctx.deps.repo.list_items(expt.space_id, expt.id).await?;
        let retry_ctrl = ErrRetryController::new(&ctx.config);
        let mut delta = StatsDelta::default();
        for item in items
            .iter()
            .filter(|item| item.state == ItemRunState::Fail)
        {
            // A new run starts with a fresh retry budget
            let err = deserialize_err(&item.err_msg);
            if retry_ctrl.should_retry(expt.space_id, &err, 0).is_none() {
                debug!(item_id = item.item_id, "Leaving permanently failed item");
                continue;
            }
            let requeued = ctx
                .deps
                .repo
                .cas_item_state(
                    expt.space_id,
                    expt.id,
                    item.item_id,
                    ItemStateUpdate {
                        from: vec![ItemRunState::Fail],
                        to: ItemRunState::Queueing,
                        run_id: Some(event.run_id),
                        err_msg: Some(String::new()),
                        updated_before: None,
                    },
                )
                .await?;
            if requeued {
                // Counters hold the split of the run that failed the item
                let success_turns = ctx
                    .deps
                    .repo
                    .list_turn_results(expt.space_id, expt.id, item.run_id, item.item_id)
                    .await?
                    .iter()
                    .filter(|turn| turn.status == TurnRunState::Success)
                    .count();
                let success_turns =
                    i32::try_from(success_turns).unwrap_or(i32::MAX).min(item.turn_cnt);
                let moved = StatsDelta::requeue_failed(item.turn_cnt, success_turns);
                delta.pending += moved.pending;
                delta.success += moved.success;
                delta.fail += moved.fail;
            }
        }
        if !delta.is_empty() {
            ctx.deps
                .repo
                .apply_stats_delta(expt.space_id, expt.id, delta)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExptSchedulerMode for AppendMode {
    fn run_mode(&self) -> RunMode {
        RunMode::Append
    }

    async fn prepare_items(
        &self,
        _ctx: &ScheduleCtx<'_>,
        _event: &ExptScheduleEvent,
        _expt: &Experiment,
    ) -> Result<(), Error> {
        // New items are picked up by every scan
        Ok(())
    }

    async fn scan_eval_items(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
    ) -> Result<ScanResult, Error> {
        if expt.status != ExptStatus::Draining {
            let eval_set_items = list_eval_set_items(ctx, expt).await?;
            let known = ctx.deps.repo.list_items(expt.space_id, expt.id).await?;
            let next_idx = known.iter().map(|item| item.item_idx + 1).max().unwrap_or(0);
            let candidates: Vec<ExptEvalItem> = eval_set_items
                .iter()
                .filter(|item| !known.iter().any(|k| k.item_id == item.id))
                .enumerate()
                .map(|(offset, item)| {
                    let mut row = new_item(ctx, expt, event.run_id, offset, item);
                    row.item_idx = next_idx.saturating_add(row.item_idx);
                    row
                })
                .collect();
            if !candidates.is_empty() {
                let inserted = ctx
                    .deps
                    .repo
                    .insert_items_if_absent(expt.space_id, expt.id, candidates)
                    .await?;
                let turns: i32 = inserted.iter().map(|item| item.turn_cnt).sum();
                if turns > 0 {
                    ctx.deps
                        .repo
                        .apply_stats_delta(expt.space_id, expt.id, StatsDelta::enqueue(turns))
                        .await?;
                    info!(items = inserted.len(), "Appended new items");
                }
            }
        }
        reclaim_zombie_items(ctx, expt).await?;
        classify_items(ctx, expt).await
    }

    async fn expt_end(
        &self,
        ctx: &ScheduleCtx<'_>,
        event: &ExptScheduleEvent,
        expt: &Experiment,
        to_submit: usize,
        incomplete: usize,
    ) -> Result<bool, Error> {
        let keeps_listening =
            expt.expt_type == ExptType::Online && expt.status != ExptStatus::Draining;
        if keeps_listening || to_submit > 0 || incomplete > 0 {
            return Ok(true);
        }
        finalize_run(ctx, event, expt).await?;
        Ok(false)
    }
}

fn new_item(
    ctx: &ScheduleCtx<'_>,
    expt: &Experiment,
    run_id: i64,
    idx: usize,
    item: &EvalSetItem,
) -> ExptEvalItem {
    ExptEvalItem {
        space_id: expt.space_id,
        experiment_id: expt.id,
        eval_set_version_id: expt.eval_set_version_id,
        item_id: item.id,
        item_idx: i32::try_from(idx).unwrap_or(i32::MAX),
        turn_cnt: item.turn_cnt(),
        state: ItemRunState::Queueing,
        run_id,
        err_msg: String::new(),
        updated_at: ctx.now,
    }
}

async fn list_eval_set_items(
    ctx: &ScheduleCtx<'_>,
    expt: &Experiment,
) -> Result<Vec<EvalSetItem>, Error> {
    list_all_items(
        ctx.deps.eval_set.as_ref(),
        expt.space_id,
        expt.eval_set_id,
        expt.eval_set_version_id,
    )
    .await
}

/// Rejects configurations that cannot route fields into the target or an evaluator.
pub fn validate_eval_conf(expt: &Experiment) -> Result<(), Error> {
    let invalid = |message: String| Error::new(ErrorDetails::InvalidEvaluationConfig { message });
    let target_conf = expt
        .eval_conf
        .target_conf
        .as_ref()
        .ok_or_else(|| invalid("missing target configuration".to_string()))?;
    if target_conf.target_version_id != expt.target_version_id {
        return Err(invalid(format!(
            "target configuration references version {} but the experiment binds {}",
            target_conf.target_version_id, expt.target_version_id
        )));
    }
    if target_conf
        .ingress_conf
        .as_ref()
        .is_none_or(|ingress| ingress.eval_set_adapter.is_empty())
    {
        return Err(invalid("target ingress adapter is empty".to_string()));
    }
    if expt.evaluator_refs.is_empty() {
        return Err(invalid("experiment has no evaluators".to_string()));
    }
    for evaluator_version_id in expt.evaluator_version_ids() {
        let conf = expt
            .eval_conf
            .evaluator_conf(evaluator_version_id)
            .ok_or_else(|| {
                invalid(format!(
                    "missing configuration for evaluator version {evaluator_version_id}"
                ))
            })?;
        if conf.ingress_conf.as_ref().is_none_or(|ingress| {
            ingress.eval_set_adapter.is_empty() && ingress.target_adapter.is_empty()
        }) {
            return Err(invalid(format!(
                "ingress adapter of evaluator version {evaluator_version_id} is empty"
            )));
        }
    }
    Ok(())
}

async fn admit(ctx: &ScheduleCtx<'_>, expt: &Experiment) -> Result<(), Error> {
    validate_eval_conf(expt)?;

    if !expt.tag_key_ids.is_empty() {
        let tags = ctx
            .deps
            .tags
            .batch_get_tags(expt.space_id, expt.tag_key_ids.clone())
            .await?;
        for tag_key_id in &expt.tag_key_ids {
            match tags.iter().find(|tag| tag.tag_key_id == *tag_key_id) {
                Some(tag) if tag.status == TagStatus::Active => {}
                Some(tag) => {
                    return Err(Error::new(ErrorDetails::InvalidEvaluationConfig {
                        message: format!("tag `{}` is {:?}", tag.name, tag.status),
                    }));
                }
                None => {
                    return Err(Error::new(ErrorDetails::InvalidEvaluationConfig {
                        message: format!("tag {tag_key_id} does not exist"),
                    }));
                }
            }
        }
    }

    let exec_conf = ctx.config.exec_conf(expt.space_id);
    let ttl = expt
        .max_alive_time
        .map(Duration::from_secs)
        .unwrap_or_else(|| exec_conf.expt_zombie());
    let admitted = ctx
        .deps
        .idem
        .try_add_member(
            &space_running_key(expt.space_id),
            &expt.id.to_string(),
            ttl,
            exec_conf.space_expt_concur_limit,
        )
        .await?;
    if !admitted {
        return Err(Error::new(ErrorDetails::AdmissionDenied {
            message: format!(
                "space {} already runs {} experiments",
                expt.space_id, exec_conf.space_expt_concur_limit
            ),
        }));
    }
    Ok(())
}

async fn release_space_slot(ctx: &ScheduleCtx<'_>, expt: &Experiment) -> Result<(), Error> {
    ctx.deps
        .idem
        .remove_member(&space_running_key(expt.space_id), &expt.id.to_string())
        .await
}

/// Puts items stuck in `Processing` for longer than the zombie interval back in the queue.
async fn reclaim_zombie_items(ctx: &ScheduleCtx<'_>, expt: &Experiment) -> Result<(), Error> {
    let zombie = ctx.config.item_eval_conf(expt.space_id).zombie();
    let zombie = chrono::Duration::from_std(zombie).unwrap_or(chrono::Duration::MAX);
    let cutoff = ctx.now.checked_sub_signed(zombie).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let items = ctx.deps.repo.list_items(expt.space_id, expt.id).await?;
    let mut delta = StatsDelta::default();
    for item in items.iter().filter(|item| {
        item.state == ItemRunState::Processing && item.updated_at < cutoff
    }) {
        let reclaimed = ctx
            .deps
            .repo
            .cas_item_state(
                expt.space_id,
                expt.id,
                item.item_id,
                ItemStateUpdate {
                    from: vec![ItemRunState::Processing],
                    to: ItemRunState::Queueing,
                    run_id: None,
                    err_msg: None,
                    updated_before: Some(cutoff),
                },
            )
            .await?;
        if reclaimed {
            info!(item_id = item.item_id, "Reclaimed zombie item");
            let moved = StatsDelta::requeue_processing(item.turn_cnt);
            delta.pending += moved.pending;
            delta.processing += moved.processing;
        }
    }
    if !delta.is_empty() {
        ctx.deps
            .repo
            .apply_stats_delta(expt.space_id, expt.id, delta)
            .await?;
    }
    Ok(())
}

async fn classify_items(ctx: &ScheduleCtx<'_>, expt: &Experiment) -> Result<ScanResult, Error> {
    let items = ctx.deps.repo.list_items(expt.space_id, expt.id).await?;
    let mut scan = ScanResult::default();
    for item in items {
        match item.state {
            ItemRunState::Queueing => scan.to_submit.push(item),
            ItemRunState::Processing => scan.incomplete.push(item),
            _ => scan.complete.push(item),
        }
    }
    Ok(scan)
}

async fn finalize_run(
    ctx: &ScheduleCtx<'_>,
    event: &ExptScheduleEvent,
    expt: &Experiment,
) -> Result<(), Error> {
    let items = ctx.deps.repo.list_items(expt.space_id, expt.id).await?;
    let status = derive_final_status(expt, event.run_id, &items, ctx.now);
    let status_message = match status {
        ExptStatus::Failed => items
            .iter()
            .filter(|item| item.state == ItemRunState::Fail)
            .min_by_key(|item| item.run_id != event.run_id)
            .map(|item| {
                ResultErrConverter::new(&ctx.config).user_message(&deserialize_err(&item.err_msg))
            })
            .unwrap_or_default(),
        _ => String::new(),
    };
    complete_expt(
        ctx.deps,
        expt,
        event.run_id,
        status,
        &status_message,
        Some(&format!("run_end:{}", event.run_id)),
    )
    .await?;
    Ok(())
}
