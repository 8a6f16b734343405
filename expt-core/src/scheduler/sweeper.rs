use chrono::Utc;
use tracing::{info, warn};

use crate::engine::EngineDeps;
use crate::error::Error;
use crate::repo::ExperimentQueries;
use crate::state::complete_expt;
use crate::types::ExptStatus;

/// Terminates running experiments that stopped ticking or outlived `max_alive_time`.
///
/// Returns how many experiments were terminated.
pub async fn sweep_zombie_experiments(deps: &EngineDeps) -> Result<usize, Error> {
    let config = deps.config.snapshot();
    let now = Utc::now();
    let mut terminated = 0;
    for expt in deps.repo.list_running_experiments().await? {
        let zombie = chrono::Duration::from_std(config.exec_conf(expt.space_id).expt_zombie())
            .unwrap_or(chrono::Duration::MAX);
        let stale = expt
            .last_tick_at
            .or(expt.start_at)
            .is_some_and(|last| now.signed_duration_since(last) > zombie);
        let message = if expt.deadline_exceeded(now) {
            "maximum alive time exceeded"
        } else if stale {
            "experiment stopped making progress"
        } else {
            continue;
        };

        let cid = format!("sweep:{}", expt.latest_run_id);
        match complete_expt(
            deps,
            &expt,
            expt.latest_run_id,
            ExptStatus::SystemTerminated,
            message,
            Some(&cid),
        )
        .await
        {
            Ok(true) => {
                info!(experiment_id = expt.id, message, "Terminated zombie experiment");
                terminated += 1;
            }
            Ok(false) => {}
            Err(e) => warn!(experiment_id = expt.id, "Failed to terminate zombie experiment: {e}"),
        }
    }
    Ok(terminated)
}
