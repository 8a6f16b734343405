use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    AggrQueries, ExperimentQueries, ExperimentUpdate, ItemQueries, ItemStateUpdate,
    RecordQueries, RunLogQueries, RunQueries, RunUpdate, StatsQueries, StatusUpdate,
    TurnResultQueries,
};
use crate::error::{Error, ErrorDetails};
use crate::types::{
    Correction, EvalTargetRecord, EvaluatorRecord, ExptAggrResult, ExptEvalItem,
    ExptItemResultRunLog, ExptRun, ExptStats, ExptTurnResult, ExptTurnResultRunLog, Experiment,
    FieldType, StatsDelta,
};
use crate::utils::id::IdGenerator;

type TurnKey = (i64, i64, i64, i64);
type AggrKey = (i64, FieldType, String);

#[derive(Default)]
struct Tables {
    experiments: HashMap<i64, Experiment>,
    completion_cids: HashSet<(i64, String)>,
    runs: BTreeMap<(i64, i64), ExptRun>,
    items: HashMap<i64, BTreeMap<i64, ExptEvalItem>>,
    turn_results: BTreeMap<TurnKey, ExptTurnResult>,
    item_run_logs: HashMap<(i64, i64, i64), ExptItemResultRunLog>,
    turn_run_logs: BTreeMap<TurnKey, ExptTurnResultRunLog>,
    target_records: HashMap<i64, EvalTargetRecord>,
    evaluator_records: BTreeMap<i64, EvaluatorRecord>,
    /// `(run, item, turn, evaluator_version) -> record id`
    evaluator_record_keys: HashMap<TurnKey, i64>,
    stats: HashMap<i64, ExptStats>,
    aggr_results: HashMap<AggrKey, ExptAggrResult>,
}

/// Repository kept entirely in process memory.
///
/// Each call holds the table lock for its whole duration, which gives every conditional
/// write the atomicity a transactional backend would.
#[derive(Clone)]
pub struct MemoryExptStore {
    tables: Arc<RwLock<Tables>>,
    ids: IdGenerator,
}

impl Default for MemoryExptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExptStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            ids: IdGenerator::starting_at(1),
        }
    }

    /// Overrides when an item row was last touched.
    pub async fn set_item_updated_at(
        &self,
        experiment_id: i64,
        item_id: i64,
        updated_at: DateTime<Utc>,
    ) {
        let mut tables = self.tables.write().await;
        if let Some(item) = tables
            .items
            .get_mut(&experiment_id)
            .and_then(|items| items.get_mut(&item_id))
        {
            item.updated_at = updated_at;
        }
    }
}

fn experiment_not_found(experiment_id: i64) -> Error {
    Error::new(ErrorDetails::ExperimentNotFound { experiment_id })
}

impl Tables {
    fn experiment_mut(
        &mut self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<&mut Experiment, Error> {
        self.experiments
            .get_mut(&experiment_id)
            .filter(|expt| expt.space_id == space_id)
            .ok_or_else(|| experiment_not_found(experiment_id))
    }
}

#[async_trait]
impl ExperimentQueries for MemoryExptStore {
    async fn create_experiment(&self, experiment: Experiment) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        if tables.experiments.contains_key(&experiment.id) {
            return Err(Error::new(ErrorDetails::Repository {
                message: format!("Experiment {} already exists", experiment.id),
            }));
        }
        tables.experiments.insert(experiment.id, experiment);
        Ok(())
    }

    async fn get_experiment(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Experiment, Error> {
        let tables = self.tables.read().await;
        tables
            .experiments
            .get(&experiment_id)
            .filter(|expt| expt.space_id == space_id)
            .cloned()
            .ok_or_else(|| experiment_not_found(experiment_id))
    }

    async fn update_experiment(
        &self,
        space_id: i64,
        experiment_id: i64,
        update: ExperimentUpdate,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let expt = tables.experiment_mut(space_id, experiment_id)?;
        if let Some(run_id) = update.latest_run_id {
            expt.latest_run_id = run_id;
        }
        if let Some(start_at) = update.start_at {
            expt.start_at = Some(start_at);
        }
        if let Some(last_tick_at) = update.last_tick_at {
            expt.last_tick_at = Some(last_tick_at);
        }
        if let Some(terminate_requested) = update.terminate_requested {
            expt.terminate_requested = terminate_requested;
        }
        Ok(())
    }

    async fn cas_experiment_status(
        &self,
        space_id: i64,
        experiment_id: i64,
        update: StatusUpdate,
    ) -> Result<bool, Error> {
        let mut tables = self.tables.write().await;
        let expt = tables.experiment_mut(space_id, experiment_id)?;
        if !update.from.contains(&expt.status) {
            return Ok(false);
        }
        expt.status = update.to;
        if let Some(message) = update.status_message {
            expt.status_message = message;
        }
        if update.end_at.is_some() {
            expt.end_at = update.end_at;
        }
        Ok(true)
    }

    async fn list_running_experiments(&self) -> Result<Vec<Experiment>, Error> {
        let tables = self.tables.read().await;
        let mut running: Vec<Experiment> = tables
            .experiments
            .values()
            .filter(|expt| expt.status.is_running())
            .cloned()
            .collect();
        running.sort_by_key(|expt| expt.id);
        Ok(running)
    }

    async fn has_completion_cid(
        &self,
        _space_id: i64,
        experiment_id: i64,
        cid: &str,
    ) -> Result<bool, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .completion_cids
            .contains(&(experiment_id, cid.to_string())))
    }

    async fn insert_completion_cid(
        &self,
        _space_id: i64,
        experiment_id: i64,
        cid: &str,
    ) -> Result<bool, Error> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .completion_cids
            .insert((experiment_id, cid.to_string())))
    }
}

#[async_trait]
impl RunQueries for MemoryExptStore {
    async fn create_run(&self, run: ExptRun) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables.runs.insert((run.experiment_id, run.id), run);
        Ok(())
    }

    async fn get_run(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
    ) -> Result<ExptRun, Error> {
        let tables = self.tables.read().await;
        tables
            .runs
            .get(&(experiment_id, run_id))
            .filter(|run| run.space_id == space_id)
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorDetails::RunNotFound {
                    experiment_id,
                    run_id,
                })
            })
    }

    async fn update_run(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
        update: RunUpdate,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let run = tables
            .runs
            .get_mut(&(experiment_id, run_id))
            .filter(|run| run.space_id == space_id)
            .ok_or_else(|| {
                Error::new(ErrorDetails::RunNotFound {
                    experiment_id,
                    run_id,
                })
            })?;
        if let Some(status) = update.status {
            run.status = status;
        }
        if update.started_at.is_some() {
            run.started_at = update.started_at;
        }
        if update.ended_at.is_some() {
            run.ended_at = update.ended_at;
        }
        Ok(())
    }

    async fn list_runs(&self, space_id: i64, experiment_id: i64) -> Result<Vec<ExptRun>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .runs
            .range((experiment_id, i64::MIN)..=(experiment_id, i64::MAX))
            .map(|(_, run)| run)
            .filter(|run| run.space_id == space_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ItemQueries for MemoryExptStore {
    async fn replace_items(
        &self,
        _space_id: i64,
        experiment_id: i64,
        items: Vec<ExptEvalItem>,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let rows = items.into_iter().map(|item| (item.item_id, item)).collect();
        tables.items.insert(experiment_id, rows);
        Ok(())
    }

    async fn insert_items_if_absent(
        &self,
        _space_id: i64,
        experiment_id: i64,
        items: Vec<ExptEvalItem>,
    ) -> Result<Vec<ExptEvalItem>, Error> {
        let mut tables = self.tables.write().await;
        let rows = tables.items.entry(experiment_id).or_default();
        let mut inserted = Vec::new();
        for item in items {
            if rows.contains_key(&item.item_id) {
                continue;
            }
            rows.insert(item.item_id, item.clone());
            inserted.push(item);
        }
        Ok(inserted)
    }

    async fn list_items(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Vec<ExptEvalItem>, Error> {
        let tables = self.tables.read().await;
        let mut items: Vec<ExptEvalItem> = tables
            .items
            .get(&experiment_id)
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter(|item| item.space_id == space_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.item_idx, item.item_id));
        Ok(items)
    }

    async fn get_item(
        &self,
        space_id: i64,
        experiment_id: i64,
        item_id: i64,
    ) -> Result<Option<ExptEvalItem>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .get(&experiment_id)
            .and_then(|rows| rows.get(&item_id))
            .filter(|item| item.space_id == space_id)
            .cloned())
    }

    async fn cas_item_state(
        &self,
        space_id: i64,
        experiment_id: i64,
        item_id: i64,
        update: ItemStateUpdate,
    ) -> Result<bool, Error> {
        let mut tables = self.tables.write().await;
        let Some(item) = tables
            .items
            .get_mut(&experiment_id)
            .and_then(|rows| rows.get_mut(&item_id))
            .filter(|item| item.space_id == space_id)
        else {
            return Ok(false);
        };
        if !update.from.contains(&item.state) {
            return Ok(false);
        }
        if update
            .updated_before
            .is_some_and(|before| item.updated_at >= before)
        {
            return Ok(false);
        }
        item.state = update.to;
        if let Some(run_id) = update.run_id {
            item.run_id = run_id;
        }
        if let Some(err_msg) = update.err_msg {
            item.err_msg = err_msg;
        }
        item.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl TurnResultQueries for MemoryExptStore {
    async fn upsert_turn_result(
        &self,
        mut result: ExptTurnResult,
    ) -> Result<ExptTurnResult, Error> {
        let mut tables = self.tables.write().await;
        let key = (
            result.experiment_id,
            result.run_id,
            result.item_id,
            result.turn_id,
        );
        result.id = match tables.turn_results.get(&key) {
            Some(existing) => existing.id,
            None if result.id != 0 => result.id,
            None => self.ids.gen_id(),
        };
        result.updated_at = Some(Utc::now());
        tables.turn_results.insert(key, result.clone());
        Ok(result)
    }

    async fn list_turn_results(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
        item_id: i64,
    ) -> Result<Vec<ExptTurnResult>, Error> {
        let tables = self.tables.read().await;
        let mut results: Vec<ExptTurnResult> = tables
            .turn_results
            .range((experiment_id, run_id, item_id, i64::MIN)..=(experiment_id, run_id, item_id, i64::MAX))
            .map(|(_, result)| result)
            .filter(|result| result.space_id == space_id)
            .cloned()
            .collect();
        results.sort_by_key(|result| result.turn_idx);
        Ok(results)
    }

    async fn list_experiment_turn_results(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Vec<ExptTurnResult>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .turn_results
            .range((experiment_id, i64::MIN, i64::MIN, i64::MIN)..=(experiment_id, i64::MAX, i64::MAX, i64::MAX))
            .map(|(_, result)| result)
            .filter(|result| result.space_id == space_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunLogQueries for MemoryExptStore {
    async fn get_item_run_log(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
        item_id: i64,
    ) -> Result<Option<ExptItemResultRunLog>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .item_run_logs
            .get(&(experiment_id, run_id, item_id))
            .filter(|log| log.space_id == space_id)
            .cloned())
    }

    async fn save_item_run_log(&self, log: ExptItemResultRunLog) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables
            .item_run_logs
            .insert((log.experiment_id, log.run_id, log.item_id), log);
        Ok(())
    }

    async fn list_turn_run_logs(
        &self,
        space_id: i64,
        experiment_id: i64,
        run_id: i64,
        item_id: i64,
    ) -> Result<Vec<ExptTurnResultRunLog>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .turn_run_logs
            .range((experiment_id, run_id, item_id, i64::MIN)..=(experiment_id, run_id, item_id, i64::MAX))
            .map(|(_, log)| log)
            .filter(|log| log.space_id == space_id)
            .cloned()
            .collect())
    }

    async fn save_turn_run_log(&self, log: ExptTurnResultRunLog) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables.turn_run_logs.insert(
            (log.experiment_id, log.run_id, log.item_id, log.turn_id),
            log,
        );
        Ok(())
    }
}

#[async_trait]
impl RecordQueries for MemoryExptStore {
    async fn save_target_record(&self, mut record: EvalTargetRecord) -> Result<i64, Error> {
        let mut tables = self.tables.write().await;
        if record.id == 0 {
            record.id = self.ids.gen_id();
        }
        let id = record.id;
        tables.target_records.insert(id, record);
        Ok(id)
    }

    async fn get_target_record(
        &self,
        space_id: i64,
        record_id: i64,
    ) -> Result<Option<EvalTargetRecord>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .target_records
            .get(&record_id)
            .filter(|record| record.space_id == space_id)
            .cloned())
    }

    async fn save_evaluator_record(&self, mut record: EvaluatorRecord) -> Result<i64, Error> {
        let mut tables = self.tables.write().await;
        let key = (
            record.experiment_run_id,
            record.item_id,
            record.turn_id,
            record.evaluator_version_id,
        );
        record.id = match tables.evaluator_record_keys.get(&key) {
            Some(id) => *id,
            None if record.id != 0 => record.id,
            None => self.ids.gen_id(),
        };
        let id = record.id;
        tables.evaluator_record_keys.insert(key, id);
        tables.evaluator_records.insert(id, record);
        Ok(id)
    }

    async fn get_evaluator_record(
        &self,
        space_id: i64,
        record_id: i64,
    ) -> Result<Option<EvaluatorRecord>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .evaluator_records
            .get(&record_id)
            .filter(|record| record.space_id == space_id)
            .cloned())
    }

    async fn list_evaluator_records(
        &self,
        space_id: i64,
        experiment_id: i64,
        evaluator_version_id: i64,
    ) -> Result<Vec<EvaluatorRecord>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .evaluator_records
            .values()
            .filter(|record| {
                record.space_id == space_id
                    && record.experiment_id == experiment_id
                    && record.evaluator_version_id == evaluator_version_id
            })
            .cloned()
            .collect())
    }

    async fn update_evaluator_correction(
        &self,
        space_id: i64,
        record_id: i64,
        correction: Correction,
    ) -> Result<EvaluatorRecord, Error> {
        let mut tables = self.tables.write().await;
        let record = tables
            .evaluator_records
            .get_mut(&record_id)
            .filter(|record| record.space_id == space_id)
            .ok_or_else(|| Error::new(ErrorDetails::EvaluatorRecordNotFound { record_id }))?;
        record.correction = Some(correction);
        record.updated_at = Some(Utc::now());
        Ok(record.clone())
    }
}

#[async_trait]
impl StatsQueries for MemoryExptStore {
    async fn init_stats(
        &self,
        space_id: i64,
        experiment_id: i64,
        pending_turn_cnt: i32,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables.stats.insert(
            experiment_id,
            ExptStats {
                space_id,
                experiment_id,
                pending_turn_cnt,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn get_stats(&self, space_id: i64, experiment_id: i64) -> Result<ExptStats, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .stats
            .get(&experiment_id)
            .cloned()
            .unwrap_or_else(|| ExptStats {
                space_id,
                experiment_id,
                ..Default::default()
            }))
    }

    async fn apply_stats_delta(
        &self,
        space_id: i64,
        experiment_id: i64,
        delta: StatsDelta,
    ) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        tables
            .stats
            .entry(experiment_id)
            .or_insert_with(|| ExptStats {
                space_id,
                experiment_id,
                ..Default::default()
            })
            .apply(&delta);
        Ok(())
    }
}

#[async_trait]
impl AggrQueries for MemoryExptStore {
    async fn get_aggr_result(
        &self,
        space_id: i64,
        experiment_id: i64,
        field_type: FieldType,
        field_key: String,
    ) -> Result<Option<ExptAggrResult>, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .aggr_results
            .get(&(experiment_id, field_type, field_key))
            .filter(|result| result.space_id == space_id)
            .cloned())
    }

    async fn create_aggr_result(&self, result: ExptAggrResult) -> Result<bool, Error> {
        let mut tables = self.tables.write().await;
        let key = (
            result.experiment_id,
            result.field_type,
            result.field_key.clone(),
        );
        if tables.aggr_results.contains_key(&key) {
            return Ok(false);
        }
        tables.aggr_results.insert(key, result);
        Ok(true)
    }

    async fn update_aggr_result_if_version(
        &self,
        mut result: ExptAggrResult,
        expected_version: i64,
    ) -> Result<bool, Error> {
        let mut tables = self.tables.write().await;
        let key = (
            result.experiment_id,
            result.field_type,
            result.field_key.clone(),
        );
        match tables.aggr_results.get(&key) {
            Some(current) if current.version == expected_version => {
                result.version = expected_version + 1;
                tables.aggr_results.insert(key, result);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_aggr_results(
        &self,
        space_id: i64,
        experiment_id: i64,
    ) -> Result<Vec<ExptAggrResult>, Error> {
        let tables = self.tables.read().await;
        let mut results: Vec<ExptAggrResult> = tables
            .aggr_results
            .values()
            .filter(|result| result.space_id == space_id && result.experiment_id == experiment_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.field_key.cmp(&b.field_key));
        Ok(results)
    }
}
