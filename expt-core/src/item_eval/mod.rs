//! Item evaluation worker.
//!
//! One [`ExptItemEvalEvent`] evaluates every turn of one eval-set item: the target runs on the
//! turn, then all evaluators grade its output. Turns run in order because later turns see the
//! earlier ones as conversation history. Turns that already completed in this run are
//! skipped, so a redelivered event resumes where the previous attempt stopped.

mod adapter;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use crate::clients::{EvalBenefitRequest, ExecuteTargetRequest, RunEvaluatorRequest};
use crate::config::{EngineConfig, MAX_EVALUATOR_CONCURRENCY, RetryConf};
use crate::engine::EngineDeps;
use crate::error::{DenyReason, Error, ErrorDetails, serialize_err};
use crate::events::{
    AggrCalculateEvent, EXT_RETRY_IN_DEBT, EngineEvent, ExptItemEvalEvent, OnlineExptResultEvent,
};
use crate::idem::{item_eval_key, quota_deduct_key};
use crate::llm::{Message, TokenUsage};
use crate::observability::{ITEM_EVAL_TOTAL, TURN_ERRORS_TOTAL};
use crate::repo::{
    ExperimentQueries, ItemQueries, ItemStateUpdate, RecordQueries, RunLogQueries, StatsQueries,
    TurnResultQueries,
};
use crate::retry_ctrl::{ErrRetryController, ResultErrConverter};
use crate::types::{
    Content, EvalTargetRecord, EvaluatorOutput, EvaluatorRecord, EvaluatorRunStatus, Experiment,
    ExptEvalItem, ExptItemResultRunLog, ExptTurnResult, ExptTurnResultRunLog, ExptType,
    ItemRunState, RecordError, ResultState, StatsDelta, TargetRunStatus, Turn, TurnRunState,
};
use crate::utils::id::new_log_id;

pub use adapter::{
    apply_field_adapter, build_evaluator_input, build_target_input, extend_history, turn_fields,
};

/// Everything a single invocation works against. The config snapshot is held for the whole
/// invocation.
struct ItemCtx<'a> {
    config: &'a EngineConfig,
    event: &'a ExptItemEvalEvent,
    expt: &'a Experiment,
    item: &'a ExptEvalItem,
    log_id: String,
}

enum ItemOutcome {
    Finished,
    AlreadyResulted,
    Redeliver(RetryConf),
}

enum TurnStep {
    Done(TurnOutcome),
    Redeliver(RetryConf),
}

#[derive(Default)]
struct TurnOutcome {
    error: Option<Error>,
    input_tokens: i64,
    output_tokens: i64,
    evaluated: Vec<i64>,
}

impl TurnOutcome {
    fn add_usage(&mut self, usage: &TokenUsage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
    }
}

/// Per-item accumulation of turn outcomes.
#[derive(Default)]
struct ItemTally {
    success_turns: i32,
    first_error: Option<Error>,
    input_tokens: i64,
    output_tokens: i64,
    evaluated: BTreeSet<i64>,
}

impl ItemTally {
    fn add(&mut self, outcome: TurnOutcome) {
        self.input_tokens += outcome.input_tokens;
        self.output_tokens += outcome.output_tokens;
        self.evaluated.extend(outcome.evaluated);
        match outcome.error {
            None => self.success_turns += 1,
            Some(err) => {
                if self.first_error.is_none() {
                    self.first_error = Some(err);
                }
            }
        }
    }
}

struct EvaluatorRun {
    evaluator_version_id: i64,
    record_id: i64,
    score: Option<f64>,
    usage: TokenUsage,
    error: Option<Error>,
}

#[derive(Clone)]
pub struct ItemEvaluator {
    deps: EngineDeps,
}

impl ItemEvaluator {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip_all, fields(space_id = event.space_id, experiment_id = event.experiment_id, run_id = event.run_id, item_id = event.eval_set_item_id, retry_times = event.retry_times))]
    pub async fn evaluate(&self, event: ExptItemEvalEvent) -> Result<(), Error> {
        let config = self.deps.config.snapshot();
        let repo = &self.deps.repo;
        let expt = repo
            .get_experiment(event.space_id, event.experiment_id)
            .await?;
        if expt.latest_run_id != event.run_id || expt.status.is_terminal() {
            debug!(status = %expt.status, latest_run_id = expt.latest_run_id, "Dropping item event of an inactive run");
            return Ok(());
        }
        let Some(item) = repo
            .get_item(event.space_id, event.experiment_id, event.eval_set_item_id)
            .await?
        else {
            warn!("Item row not found, dropping event");
            return Ok(());
        };
        if item.state != ItemRunState::Processing || item.run_id != event.run_id {
            debug!(state = %item.state, item_run_id = item.run_id, "Item is not processing in this run");
            return Ok(());
        }

        let key = item_eval_key(event.run_id, item.item_id);
        let zombie = config.item_eval_conf(event.space_id).zombie();
        if !self.deps.idem.set_nx(&key, zombie).await? {
            debug!("Item is already being evaluated");
            return Ok(());
        }

        let ctx = ItemCtx {
            config: &config,
            event: &event,
            expt: &expt,
            item: &item,
            log_id: new_log_id(),
        };
        let result = self.evaluate_item(&ctx).await;
        if let Err(e) = self.deps.idem.del(&key).await {
            warn!("Failed to release item evaluation key: {e}");
        }

        match result {
            Ok(ItemOutcome::Finished) => Ok(()),
            Ok(ItemOutcome::AlreadyResulted) => {
                info!("Item already has a result in this run");
                Ok(())
            }
            Ok(ItemOutcome::Redeliver(conf)) => {
                self.redeliver(&event, conf.is_in_debt, conf.interval()).await
            }
            // The item stays Processing; without a retry it is reclaimed once it turns zombie
            Err(e) => match ErrRetryController::new(&config).should_retry(
                event.space_id,
                &e,
                event.retry_times,
            ) {
                Some(conf) => {
                    warn!("Item evaluation failed, redelivering: {e}");
                    let delay = config.item_eval_conf(event.space_id).interval();
                    self.redeliver(&event, conf.is_in_debt, delay).await
                }
                None => Err(e),
            },
        }
    }

    async fn redeliver(
        &self,
        event: &ExptItemEvalEvent,
        in_debt: bool,
        delay: Duration,
    ) -> Result<(), Error> {
        let mut retry = ExptItemEvalEvent {
            retry_times: event.retry_times.saturating_add(1),
            ..event.clone()
        };
        if in_debt {
            retry
                .ext
                .insert(EXT_RETRY_IN_DEBT.to_string(), "1".to_string());
        }
        self.deps
            .publisher
            .publish(EngineEvent::ExptItemEval(retry), Some(delay))
            .await
    }

    /// Charges the item's quota once per run. Returns the deny reason if the account refused.
    async fn deduct_quota(&self, ctx: &ItemCtx<'_>) -> Result<Option<DenyReason>, Error> {
        let event = ctx.event;
        let key = quota_deduct_key(event.run_id, ctx.item.item_id);
        let ttl = ctx.config.exec_conf(event.space_id).expt_zombie();
        if !self.deps.idem.set_nx(&key, ttl).await? {
            debug!("Quota already deducted for this run");
            return Ok(None);
        }
        let benefit = self
            .deps
            .quota
            .check_and_deduct_eval_benefit(EvalBenefitRequest {
                connector_uid: event.session.user_id.clone(),
                space_id: event.space_id,
                experiment_id: ctx.expt.id,
                ext: event.ext.clone(),
            })
            .await;
        match benefit {
            Ok(benefit) => Ok(benefit.deny_reason),
            Err(e) => {
                if let Err(del_err) = self.deps.idem.del(&key).await {
                    warn!("Failed to release quota key: {del_err}");
                }
                Err(e)
            }
        }
    }

    async fn evaluate_item(&self, ctx: &ItemCtx<'_>) -> Result<ItemOutcome, Error> {
        let repo = &self.deps.repo;
        let (event, expt, item) = (ctx.event, ctx.expt, ctx.item);
        if let Some(log) = repo
            .get_item_run_log(event.space_id, expt.id, event.run_id, item.item_id)
            .await?
            && log.result_state == ResultState::Resulted
        {
            return Ok(ItemOutcome::AlreadyResulted);
        }
        self.save_item_log(ctx, ItemRunState::Processing, String::new(), ResultState::Logged)
            .await?;

        let eval_set_item = match self
            .deps
            .eval_set
            .get_items(
                event.space_id,
                expt.eval_set_id,
                item.eval_set_version_id,
                vec![item.item_id],
            )
            .await
        {
            Ok(items) => items.into_iter().find(|found| found.id == item.item_id),
            Err(e) if matches!(e.get_details(), ErrorDetails::EvalSetItemNotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let Some(eval_set_item) = eval_set_item else {
            let tally = ItemTally {
                first_error: Some(Error::new(ErrorDetails::EvalSetItemNotFound {
                    item_id: item.item_id,
                })),
                ..Default::default()
            };
            self.finalize_item(ctx, tally).await?;
            return Ok(ItemOutcome::Finished);
        };

        let existing: HashMap<i64, ExptTurnResult> = repo
            .list_turn_results(event.space_id, expt.id, event.run_id, item.item_id)
            .await?
            .into_iter()
            .map(|result| (result.turn_id, result))
            .collect();
        let evaluator_ids = expt.evaluator_version_ids();

        if !event.is_in_debt_retry()
            && let Some(reason) = self.deduct_quota(ctx).await?
        {
            let err = Error::new(ErrorDetails::QuotaDenied { reason });
            let mut tally = ItemTally::default();
            for (turn_idx, turn) in eval_set_item.turns.iter().enumerate() {
                let prior = existing.get(&turn.id);
                if prior.is_some_and(|prior| prior.is_complete_for(&evaluator_ids)) {
                    tally.success_turns += 1;
                    continue;
                }
                let evaluator_results =
                    prior.map(|p| p.evaluator_results.clone()).unwrap_or_default();
                let target_result_id = prior.map_or(0, |p| p.target_result_id);
                self.record_turn(
                    ctx,
                    turn_idx,
                    turn.id,
                    target_result_id,
                    evaluator_results,
                    Some(&err),
                )
                .await?;
            }
            tally.first_error = Some(err);
            self.finalize_item(ctx, tally).await?;
            return Ok(ItemOutcome::Finished);
        }

        let mut history = Vec::new();
        let mut tally = ItemTally::default();
        for (turn_idx, turn) in eval_set_item.turns.iter().enumerate() {
            let step = self
                .evaluate_turn(
                    ctx,
                    turn_idx,
                    turn,
                    existing.get(&turn.id),
                    &evaluator_ids,
                    &mut history,
                )
                .await?;
            match step {
                TurnStep::Done(outcome) => tally.add(outcome),
                TurnStep::Redeliver(conf) => return Ok(ItemOutcome::Redeliver(conf)),
            }
        }
        self.finalize_item(ctx, tally).await?;
        Ok(ItemOutcome::Finished)
    }

    #[instrument(skip_all, fields(turn_id = turn.id, turn_idx = turn_idx))]
    async fn evaluate_turn(
        &self,
        ctx: &ItemCtx<'_>,
        turn_idx: usize,
        turn: &Turn,
        prior: Option<&ExptTurnResult>,
        evaluator_ids: &[i64],
        history: &mut Vec<Message>,
    ) -> Result<TurnStep, Error> {
        let repo = &self.deps.repo;
        let space_id = ctx.event.space_id;
        let prior_target = match prior.filter(|prior| prior.target_result_id != 0) {
            Some(prior) => repo
                .get_target_record(space_id, prior.target_result_id)
                .await?
                .filter(|record| record.status == TargetRunStatus::Success),
            None => None,
        };
        if let Some(prior) = prior
            && prior.is_complete_for(evaluator_ids)
        {
            if let Some(record) = &prior_target {
                extend_history(history, &record.input, &record.output);
            }
            debug!("Turn already complete");
            return Ok(TurnStep::Done(TurnOutcome::default()));
        }

        let fields = turn_fields(turn);
        let mut outcome = TurnOutcome::default();
        let mut evaluator_results = prior
            .map(|prior| prior.evaluator_results.clone())
            .unwrap_or_default();

        let target_record = match prior_target {
            Some(record) => record,
            None => match self.run_target(ctx, turn.id, &fields, history).await? {
                Ok(record) => {
                    outcome.add_usage(&record.output.usage);
                    record
                }
                Err(err) => {
                    if let Some(conf) = ErrRetryController::new(ctx.config).should_retry(
                        space_id,
                        &err,
                        ctx.event.retry_times,
                    ) {
                        info!("Target call failed, item will be redelivered: {err}");
                        return Ok(TurnStep::Redeliver(conf));
                    }
                    self.record_turn(ctx, turn_idx, turn.id, 0, evaluator_results, Some(&err))
                        .await?;
                    outcome.error = Some(err);
                    return Ok(TurnStep::Done(outcome));
                }
            },
        };

        if target_record.status != TargetRunStatus::Success {
            let message = target_record
                .output
                .error
                .as_ref()
                .map_or_else(|| "target run failed".to_string(), |e| e.message.clone());
            let err = Error::new(ErrorDetails::TargetResult {
                message,
                cause: None,
            });
            self.record_turn(
                ctx,
                turn_idx,
                turn.id,
                target_record.id,
                evaluator_results,
                Some(&err),
            )
            .await?;
            outcome.error = Some(err);
            return Ok(TurnStep::Done(outcome));
        }

        let mut scores = BTreeMap::new();
        let mut pending = Vec::new();
        for &evaluator_version_id in evaluator_ids {
            let kept = match evaluator_results.get(&evaluator_version_id) {
                Some(&record_id) => repo
                    .get_evaluator_record(space_id, record_id)
                    .await?
                    .filter(|record| {
                        record.status == EvaluatorRunStatus::Success
                            && record.target_record_id == target_record.id
                    }),
                None => None,
            };
            match kept {
                Some(record) => {
                    scores.insert(evaluator_version_id, record.get_score());
                }
                None => pending.push(evaluator_version_id),
            }
        }

        let concurrency = ctx.expt.eval_conf.evaluator_concur_num.map_or_else(
            || {
                ctx.config
                    .item_eval_conf(space_id)
                    .bounded_evaluator_concurrency()
            },
            |n| n.clamp(1, MAX_EVALUATOR_CONCURRENCY),
        );
        let shared_history: &[Message] = history;
        let mut runs = stream::iter(pending.into_iter().map(|evaluator_version_id| {
            self.run_evaluator(
                ctx,
                evaluator_version_id,
                turn.id,
                &fields,
                &target_record,
                shared_history,
            )
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, Error>>()?;
        runs.sort_by_key(|run| run.evaluator_version_id);

        for run in runs {
            evaluator_results.insert(run.evaluator_version_id, run.record_id);
            scores.insert(run.evaluator_version_id, run.score);
            outcome.add_usage(&run.usage);
            outcome.evaluated.push(run.evaluator_version_id);
            if outcome.error.is_none() {
                outcome.error = run.error;
            }
        }

        self.record_turn(
            ctx,
            turn_idx,
            turn.id,
            target_record.id,
            evaluator_results,
            outcome.error.as_ref(),
        )
        .await?;

        if ctx.expt.expt_type == ExptType::Online {
            self.deps
                .publisher
                .publish(
                    EngineEvent::OnlineExptResult(OnlineExptResultEvent {
                        space_id,
                        experiment_id: ctx.expt.id,
                        item_id: ctx.item.item_id,
                        turn_id: turn.id,
                        evaluator_scores: scores,
                    }),
                    None,
                )
                .await?;
        }
        extend_history(history, &target_record.input, &target_record.output);
        Ok(TurnStep::Done(outcome))
    }

    /// Runs and stores the target. The inner `Err` is a failed call, the outer one a
    /// storage failure.
    async fn run_target(
        &self,
        ctx: &ItemCtx<'_>,
        turn_id: i64,
        fields: &BTreeMap<String, Content>,
        history: &[Message],
    ) -> Result<Result<EvalTargetRecord, Error>, Error> {
        let expt = ctx.expt;
        let ingress = expt
            .eval_conf
            .target_conf
            .as_ref()
            .and_then(|conf| conf.ingress_conf.as_ref());
        let input = build_target_input(ingress, fields, history);
        let request = ExecuteTargetRequest {
            space_id: expt.space_id,
            target_id: expt.target_id,
            target_version_id: expt.target_version_id,
            experiment_run_id: ctx.event.run_id,
            item_id: ctx.item.item_id,
            turn_id,
            input,
        };
        let mut record = match self.deps.target.execute(request).await {
            Ok(record) => record,
            Err(e) => {
                return Ok(Err(Error::new(ErrorDetails::TargetResult {
                    message: e.to_string(),
                    cause: Some(e),
                })));
            }
        };
        record.space_id = expt.space_id;
        record.target_id = expt.target_id;
        record.target_version_id = expt.target_version_id;
        record.experiment_run_id = ctx.event.run_id;
        record.item_id = ctx.item.item_id;
        record.turn_id = turn_id;
        record.id = self.deps.repo.save_target_record(record.clone()).await?;
        Ok(Ok(record))
    }

    #[instrument(skip_all, fields(evaluator_version_id = evaluator_version_id))]
    async fn run_evaluator(
        &self,
        ctx: &ItemCtx<'_>,
        evaluator_version_id: i64,
        turn_id: i64,
        fields: &BTreeMap<String, Content>,
        target_record: &EvalTargetRecord,
        history: &[Message],
    ) -> Result<EvaluatorRun, Error> {
        let expt = ctx.expt;
        let input = build_evaluator_input(
            expt.eval_conf.evaluator_conf(evaluator_version_id),
            fields,
            &target_record.output,
            history,
        );
        let request = RunEvaluatorRequest {
            space_id: expt.space_id,
            experiment_id: expt.id,
            experiment_run_id: ctx.event.run_id,
            evaluator_version_id,
            item_id: ctx.item.item_id,
            turn_id,
            target_record_id: target_record.id,
            input: input.clone(),
        };
        let (mut record, error) = match self.deps.evaluator.run(request).await {
            Ok(record) if record.status == EvaluatorRunStatus::Success => (record, None),
            Ok(record) => {
                let message = record
                    .output
                    .error
                    .as_ref()
                    .map_or_else(|| "evaluator run failed".to_string(), |e| e.message.clone());
                let err = Error::new(ErrorDetails::EvaluatorResult {
                    evaluator_version_id,
                    message,
                    cause: None,
                });
                (record, Some(err))
            }
            Err(e) => {
                let now = Utc::now();
                let record = EvaluatorRecord {
                    log_id: new_log_id(),
                    input,
                    output: EvaluatorOutput {
                        error: Some(RecordError {
                            code: e.code(),
                            message: e.to_string(),
                        }),
                        ..Default::default()
                    },
                    status: EvaluatorRunStatus::Fail,
                    created_at: Some(now),
                    updated_at: Some(now),
                    ..Default::default()
                };
                let err = Error::new(ErrorDetails::EvaluatorResult {
                    evaluator_version_id,
                    message: e.to_string(),
                    cause: Some(e),
                });
                (record, Some(err))
            }
        };
        record.space_id = expt.space_id;
        record.experiment_id = expt.id;
        record.experiment_run_id = ctx.event.run_id;
        record.item_id = ctx.item.item_id;
        record.turn_id = turn_id;
        record.evaluator_version_id = evaluator_version_id;
        record.target_record_id = target_record.id;
        let score = record.get_score();
        let usage = record.output.usage.clone();
        let record_id = self.deps.repo.save_evaluator_record(record).await?;
        Ok(EvaluatorRun {
            evaluator_version_id,
            record_id,
            score,
            usage,
            error,
        })
    }

    async fn record_turn(
        &self,
        ctx: &ItemCtx<'_>,
        turn_idx: usize,
        turn_id: i64,
        target_result_id: i64,
        evaluator_results: BTreeMap<i64, i64>,
        error: Option<&Error>,
    ) -> Result<(), Error> {
        let status = match error {
            None => TurnRunState::Success,
            Some(_) => TurnRunState::Fail,
        };
        let now = Utc::now();
        let err_msg = error
            .map(|err| ResultErrConverter::new(ctx.config).user_message(err))
            .unwrap_or_default();
        self.deps
            .repo
            .upsert_turn_result(ExptTurnResult {
                id: 0,
                space_id: ctx.event.space_id,
                experiment_id: ctx.expt.id,
                run_id: ctx.event.run_id,
                item_id: ctx.item.item_id,
                turn_id,
                turn_idx: i32::try_from(turn_idx).unwrap_or(i32::MAX),
                target_result_id,
                evaluator_results: evaluator_results.clone(),
                status,
                err_msg,
                log_id: ctx.log_id.clone(),
                updated_at: Some(now),
            })
            .await?;
        self.deps
            .repo
            .save_turn_run_log(ExptTurnResultRunLog {
                space_id: ctx.event.space_id,
                experiment_id: ctx.expt.id,
                run_id: ctx.event.run_id,
                item_id: ctx.item.item_id,
                turn_id,
                target_result_id,
                evaluator_results,
                status,
                err_msg: error.map(serialize_err).unwrap_or_default(),
                log_id: ctx.log_id.clone(),
                updated_at: now,
            })
            .await?;
        if let Some(err) = error {
            counter!(
                TURN_ERRORS_TOTAL,
                "kind" => err.kind(),
                "affect_stability" => err.affect_stability().to_string(),
            )
            .increment(1);
        }
        Ok(())
    }

    async fn save_item_log(
        &self,
        ctx: &ItemCtx<'_>,
        status: ItemRunState,
        err_msg: String,
        result_state: ResultState,
    ) -> Result<(), Error> {
        self.deps
            .repo
            .save_item_run_log(ExptItemResultRunLog {
                space_id: ctx.event.space_id,
                experiment_id: ctx.expt.id,
                run_id: ctx.event.run_id,
                item_id: ctx.item.item_id,
                status,
                err_msg,
                log_id: ctx.log_id.clone(),
                result_state,
                updated_at: Utc::now(),
            })
            .await
    }

    /// Moves the item out of Processing and settles its turns in the stats counters.
    async fn finalize_item(&self, ctx: &ItemCtx<'_>, tally: ItemTally) -> Result<(), Error> {
        let (event, expt, item) = (ctx.event, ctx.expt, ctx.item);
        let turn_cnt = item.turn_cnt;
        let (state, success_turns) = match tally.first_error {
            None => (ItemRunState::Success, turn_cnt),
            Some(_) => (ItemRunState::Fail, tally.success_turns.min(turn_cnt)),
        };
        let err_blob = tally
            .first_error
            .as_ref()
            .map(serialize_err)
            .unwrap_or_default();

        let applied = self
            .deps
            .repo
            .cas_item_state(
                event.space_id,
                expt.id,
                item.item_id,
                ItemStateUpdate {
                    from: vec![ItemRunState::Processing],
                    to: state,
                    run_id: Some(event.run_id),
                    err_msg: Some(err_blob.clone()),
                    updated_before: None,
                },
            )
            .await?;
        if applied {
            self.deps
                .repo
                .apply_stats_delta(
                    event.space_id,
                    expt.id,
                    StatsDelta {
                        processing: -turn_cnt,
                        success: success_turns,
                        fail: turn_cnt - success_turns,
                        input_tokens: tally.input_tokens,
                        output_tokens: tally.output_tokens,
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            debug!("Item left Processing concurrently, stats untouched");
        }

        self.save_item_log(ctx, state, err_blob, ResultState::Resulted)
            .await?;
        counter!(ITEM_EVAL_TOTAL, "status" => state.to_string()).increment(1);
        info!(status = %state, success_turns, turn_cnt, "Item evaluated");

        let events = tally
            .evaluated
            .into_iter()
            .map(|evaluator_version_id| {
                EngineEvent::AggrCalculate(AggrCalculateEvent::for_evaluator(
                    event.space_id,
                    expt.id,
                    evaluator_version_id,
                ))
            })
            .collect::<Vec<_>>();
        if events.is_empty() {
            return Ok(());
        }
        self.deps.publisher.batch_publish(events).await
    }
}
