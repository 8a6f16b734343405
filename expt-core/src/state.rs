//! Experiment status lifecycle.
//!
//! ```text
//! Pending ──▶ Processing ──▶ Success | Failed | UserTerminated | SystemTerminated
//!                 └──▶ Draining (online only) ──▶ Success | Failed | *Terminated
//! ```
//!
//! Terminal statuses are absorbing for [`complete_expt`]. The only way out of `Success` or
//! `Failed` is starting a new FailRetry or Append run, see [`reopenable_from`].

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{info, instrument};

use crate::engine::EngineDeps;
use crate::error::{Error, ErrorDetails};
use crate::events::{AggrCalculateEvent, CalculateType, EngineEvent};
use crate::idem::space_running_key;
use crate::observability::FINISHED_TOTAL;
use crate::repo::{
    ExperimentQueries, ItemQueries, ItemStateUpdate, RunQueries, RunUpdate, StatsQueries,
    StatusUpdate,
};
use crate::types::{ExptEvalItem, ExptStatus, ExptType, Experiment, ItemRunState, RunMode, StatsDelta};
use crate::utils::clamp_chars;

pub const MAX_STATUS_MESSAGE_CHARS: usize = 200;

fn illegal(from: ExptStatus, to: ExptStatus) -> Error {
    Error::new(ErrorDetails::IllegalStatusTransition {
        from: from.to_string(),
        to: to.to_string(),
    })
}

/// Checks a status change requested through the lifecycle operations.
pub fn validate_transition(
    expt_type: ExptType,
    from: ExptStatus,
    to: ExptStatus,
) -> Result<(), Error> {
    use ExptStatus::{
        Draining, Failed, Pending, Processing, Success, SystemTerminated, UserTerminated,
    };
    let allowed = match (from, to) {
        (Pending, Processing | Failed | UserTerminated | SystemTerminated) => true,
        (Processing, Success | Failed | UserTerminated | SystemTerminated) => true,
        (Processing, Draining) => expt_type == ExptType::Online,
        (Draining, Success | Failed | UserTerminated | SystemTerminated) => true,
        _ => false,
    };
    if allowed { Ok(()) } else { Err(illegal(from, to)) }
}

/// Statuses from which a run of `run_mode` may start.
pub fn reopenable_from(run_mode: RunMode) -> &'static [ExptStatus] {
    match run_mode {
        RunMode::Submit => &[ExptStatus::Pending],
        RunMode::FailRetry => &[ExptStatus::Failed],
        RunMode::Append => &[ExptStatus::Pending, ExptStatus::Success, ExptStatus::Failed],
    }
}

/// Status an experiment finishes with once a run has nothing left to do.
///
/// Only items last scheduled by `run_id` count, so a FailRetry run succeeds when every item
/// it retried succeeded. A run that scheduled no item leaves the outcome of earlier runs in
/// place.
pub fn derive_final_status(
    expt: &Experiment,
    run_id: i64,
    items: &[ExptEvalItem],
    now: DateTime<Utc>,
) -> ExptStatus {
    if expt.terminate_requested {
        ExptStatus::UserTerminated
    } else if expt.deadline_exceeded(now) {
        ExptStatus::SystemTerminated
    } else {
        let scheduled_any = items.iter().any(|item| item.run_id == run_id);
        let failed = items.iter().any(|item| {
            item.state == ItemRunState::Fail && (item.run_id == run_id || !scheduled_any)
        });
        if failed {
            ExptStatus::Failed
        } else {
            ExptStatus::Success
        }
    }
}

/// Moves every unfinished item to `Terminal` and accounts its turns as terminated.
pub async fn terminate_unfinished_items(deps: &EngineDeps, expt: &Experiment) -> Result<(), Error> {
    let items = deps.repo.list_items(expt.space_id, expt.id).await?;
    let mut delta = StatsDelta::default();
    for item in items.iter().filter(|item| !item.state.is_finished()) {
        let moved = deps
            .repo
            .cas_item_state(
                expt.space_id,
                expt.id,
                item.item_id,
                ItemStateUpdate {
                    from: vec![item.state],
                    to: ItemRunState::Terminal,
                    run_id: None,
                    err_msg: None,
                    updated_before: None,
                },
            )
            .await?;
        if !moved {
            continue;
        }
        match item.state {
            ItemRunState::Processing => delta.processing -= item.turn_cnt,
            _ => delta.pending -= item.turn_cnt,
        }
        delta.terminated += item.turn_cnt;
    }
    if !delta.is_empty() {
        deps.repo
            .apply_stats_delta(expt.space_id, expt.id, delta)
            .await?;
    }
    Ok(())
}

/// Drives an experiment into a terminal status.
///
/// The `cid` is recorded only once every step has succeeded, so a call that failed part way
/// can be repeated with the same `cid` and picks up where it stopped. After that, repeating
/// the `cid` is a no-op, as is completing an experiment into the status it already has
/// without a `cid`. Returns whether this call changed the status. Whatever the outcome,
/// `run_id` is marked ended and the experiment's space slot is released.
#[instrument(skip_all, fields(space_id = expt.space_id, experiment_id = expt.id, run_id = run_id, status = %status))]
pub async fn complete_expt(
    deps: &EngineDeps,
    expt: &Experiment,
    run_id: i64,
    status: ExptStatus,
    status_message: &str,
    cid: Option<&str>,
) -> Result<bool, Error> {
    if !status.is_terminal() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: format!("{status} is not a terminal status"),
        }));
    }
    if let Some(cid) = cid
        && deps
            .repo
            .has_completion_cid(expt.space_id, expt.id, cid)
            .await?
    {
        info!(cid, "Completion already applied");
        return Ok(false);
    }

    let current = deps.repo.get_experiment(expt.space_id, expt.id).await?;
    let changed = if current.status == status {
        false
    } else {
        validate_transition(current.expt_type, current.status, status)?;
        let now = Utc::now();
        let applied = deps
            .repo
            .cas_experiment_status(
                expt.space_id,
                expt.id,
                StatusUpdate {
                    from: vec![current.status],
                    to: status,
                    status_message: Some(clamp_chars(status_message, MAX_STATUS_MESSAGE_CHARS)),
                    end_at: Some(now),
                },
            )
            .await?;
        if !applied {
            return Err(Error::new(ErrorDetails::ConcurrentModification {
                message: format!("status of experiment {} moved during completion", expt.id),
            }));
        }
        true
    };

    if matches!(
        status,
        ExptStatus::UserTerminated | ExptStatus::SystemTerminated
    ) {
        terminate_unfinished_items(deps, &current).await?;
    }
    // A repeated cid whose status already landed still owes the final aggregation
    let resumed = !changed && cid.is_some() && current.status == status;
    if changed || resumed {
        deps.publisher
            .publish(
                EngineEvent::AggrCalculate(AggrCalculateEvent {
                    space_id: expt.space_id,
                    experiment_id: expt.id,
                    calculate_type: CalculateType::CreateAll,
                }),
                None,
            )
            .await?;
    }
    deps.idem
        .remove_member(&space_running_key(expt.space_id), &expt.id.to_string())
        .await?;
    // Ended last so a tick of a half-finished run still reaches the completion again
    if run_id != 0 {
        deps.repo
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
            .await?;
    }
    if let Some(cid) = cid {
        deps.repo
            .insert_completion_cid(expt.space_id, expt.id, cid)
            .await?;
    }
    if changed {
        counter!(FINISHED_TOTAL, "status" => status.to_string()).increment(1);
        info!("Experiment finished");
    }
    Ok(changed)
}
