//! Persistence of experiments and everything they own.
//!
//! The traits are split by entity the way a SQL backend would split its tables. Every write
//! that races between workers is expressed as a conditional update returning whether it
//! applied; counters only ever move through relative deltas.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::types::{
    Correction, EvalTargetRecord, EvaluatorRecord, ExptAggrResult, ExptEvalItem,
    ExptItemResultRunLog, ExptRun, ExptStats, ExptStatus, ExptTurnResult, ExptTurnResultRunLog,
    Experiment, FieldType, ItemRunState, StatsDelta,
};

pub use memory::MemoryExptStore;

/// Fields of an experiment row that change after creation. `None` leaves a field untouched.
#[derive(Clone, Debug, Default)]
pub struct ExperimentUpdate {
    pub latest_run_id: Option<i64>,
    pub start_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub terminate_requested: Option<bool>,
}

/// Conditional status write: applies only while the current status is one of `from`.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub from: Vec<ExptStatus>,
    pub to: ExptStatus,
    pub status_message: Option<String>,
    pub end_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct RunUpdate {
    pub status: Option<ExptStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Conditional item state write.
#[derive(Clone, Debug)]
pub struct ItemStateUpdate {
    pub from: Vec<ItemRunState>,
    pub to: ItemRunState,
    pub run_id: Option<i64>,
    pub err_msg: Option<String>,
    /// Applies only if the row was last touched before this instant.
    pub updated_before: Option<DateTime<Utc>>,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait ExperimentQueries: Send + Sync {
    async fn create_experiment(&self, experiment: Experiment) -> Result<(), Error>;

    async fn get_experiment(&self, space_id: i64, experiment_id: i64)
    -> Result<Experiment, Error>;

    async fn update_experiment(
        &self,
        space_id: i64,
        experiment_id: i64,
        update: ExperimentUpdate,
    ) -> Result<(), Error>;

    async fn cas_experiment_status(
        &self,
        space_id: i64,
        experiment_id: i64,
        update: StatusUpdate,
    ) -> Result<bool, Error>;

    /// Experiments in `Processing` or `Draining`.
    async fn list_running_experiments(&self) -> Result<Vec<Experiment>, Error>;

    async fn has_completion_cid(
        &self,
        space_id: i64,
        experiment_id: i64,
        cid: &str,
    ) -> Result<bool, Error>;

    /// Records a completion id. Returns false if it was already recorded.
    async fn insert_completion_cid(
        &self,
        space_id: i64,
        experiment_id: i64,
        cid: &str,
    ) -> Result<bool, Error>;
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait RunQueries: Send + Sync {
    async fn create_run(&self, run: ExptRun) -> Result<(), Error>;

    async fn get_run(&self, space_id: i64, experiment_id: i64, run_id: i64)
    -> Result<ExptRun, Error>;

    async fn update_run(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
        update: RunUpdate,
    ) -> Result<(), Error>;

    async fn list_runs(&self, space_id: i64, experiment_id: i64) -> Result<Vec<ExptRun>, Error>;
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait ItemQueries: Send + Sync {
    /// Replaces every item row of the experiment.
    async fn replace_items(
        &self,
        space_id: i64,
        experiment_id: i64,
        items: Vec<ExptEvalItem>,
    ) -> Result<(), Error>;

    /// Inserts the rows whose item is not yet tracked and returns those that were inserted.
    async fn insert_items_if_absent(
        &self,
        space_id: i64,
        experiment_id: i64,
        items: Vec<ExptEvalItem>,
    ) -> Result<Vec<ExptEvalItem>, Error>;

    /// Ordered by `item_idx`.
    async fn list_items(&self, space_id: i64, experiment_id: i64)
    -> Result<Vec<ExptEvalItem>, Error>;

    async fn get_item(
        &self,
        space_id: i64,
        experiment_id: i64,
        item_id: i64,
    ) -> Result<Option<ExptEvalItem>, Error>;

    async fn cas_item_state(
        &self,
        space_id: i64,
        experiment_id: i64,
        item_id: i64,
        update: ItemStateUpdate,
    ) -> Result<bool, Error>;
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait TurnResultQueries: Send + Sync {
    /// Writes the row for `(experiment_id, run_id, item_id, turn_id)`, keeping the id of an
    /// existing row. Returns the stored row.
    async fn upsert_turn_result(&self, result: ExptTurnResult) -> Result<ExptTurnResult, Error>;

    async fn list_turn_results(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
        item_id: i64,
    ) -> Result<Vec<ExptTurnResult>, Error>;

    async fn list_experiment_turn_results(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Vec<ExptTurnResult>, Error>;
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait RunLogQueries: Send + Sync {
    async fn get_item_run_log(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
        item_id: i64,
    ) -> Result<Option<ExptItemResultRunLog>, Error>;

    async fn save_item_run_log(&self, log: ExptItemResultRunLog) -> Result<(), Error>;

    async fn list_turn_run_logs(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
        item_id: i64,
    ) -> Result<Vec<ExptTurnResultRunLog>, Error>;

    async fn save_turn_run_log(&self, log: ExptTurnResultRunLog) -> Result<(), Error>;
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait RecordQueries: Send + Sync {
    /// Stores a target record, assigning an id when it has none. Returns the id.
    async fn save_target_record(&self, record: EvalTargetRecord) -> Result<i64, Error>;

    async fn get_target_record(
        &self,
        space_id: i64,
        record_id: i64,
    ) -> Result<Option<EvalTargetRecord>, Error>;

    /// Stores an evaluator record. A record for the same
    /// `(run, item, turn, evaluator_version)` is overwritten in place and keeps its id.
    async fn save_evaluator_record(&self, record: EvaluatorRecord) -> Result<i64, Error>;

    async fn get_evaluator_record(
        &self,
        space_id: i64,
        record_id: i64,
    ) -> Result<Option<EvaluatorRecord>, Error>;

    async fn list_evaluator_records(
        &self,
        space_id: i64,
        experiment_id: i64,
        evaluator_version_id: i64,
    ) -> Result<Vec<EvaluatorRecord>, Error>;

    /// Sets the correction of a record, leaving its raw output untouched.
    async fn update_evaluator_correction(
        &self,
        space_id: i64,
        record_id: i64,
        correction: Correction,
    ) -> Result<EvaluatorRecord, Error>;
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait StatsQueries: Send + Sync {
    /// Resets the counters with every expected turn pending.
    async fn init_stats(
        &self,
        space_id: i64,
        experiment_id: i64,
        pending_turn_cnt: i32,
    ) -> Result<(), Error>;

    async fn get_stats(&self, space_id: i64, experiment_id: i64) -> Result<ExptStats, Error>;

    async fn apply_stats_delta(
        &self,
        space_id: i64,
        experiment_id: i64,
        delta: StatsDelta,
    ) -> Result<(), Error>;
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait AggrQueries: Send + Sync {
    async fn get_aggr_result(
        &self,
        space_id: i64,
        experiment_id: i64,
        field_type: FieldType,
        field_key: String,
    ) -> Result<Option<ExptAggrResult>, Error>;

    /// Inserts the row at its version. Returns false if a row already exists.
    async fn create_aggr_result(&self, result: ExptAggrResult) -> Result<bool, Error>;

    /// Replaces the row if its stored version is still `expected_version`, storing
    /// `expected_version + 1`. Returns false on a version mismatch.
    async fn update_aggr_result_if_version(
        &self,
        result: ExptAggrResult,
        expected_version: i64,
    ) -> Result<bool, Error>;

    async fn list_aggr_results(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Vec<ExptAggrResult>, Error>;
}

/// Everything the engine persists.
pub trait ExptRepository:
    ExperimentQueries
    + RunQueries
    + ItemQueries
    + TurnResultQueries
    + RunLogQueries
    + RecordQueries
    + StatsQueries
    + AggrQueries
    + Send
    + Sync
{
}

impl<T> ExptRepository for T where
    T: ExperimentQueries
        + RunQueries
        + ItemQueries
        + TurnResultQueries
        + RunLogQueries
        + RecordQueries
        + StatsQueries
        + AggrQueries
        + Send
        + Sync
{
}
