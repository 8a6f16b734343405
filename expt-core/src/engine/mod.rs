//! Engine wiring: the dependencies every handler shares, event dispatch, and the consumer
//! pools that drain the bus.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::aggregator::ResultAggregator;
use crate::clients::{EvalSetService, EvaluatorService, QuotaService, TagService, TargetService};
use crate::config::ConfigHandle;
use crate::consumer::{EventHandler, run_pool};
use crate::correction::CorrectionHandler;
use crate::error::{Error, ErrorDetails};
use crate::events::{BusReceivers, EngineEvent, EventPublisher, Topic};
use crate::idem::IdempotencyStore;
use crate::item_eval::ItemEvaluator;
use crate::manage::ExptManager;
use crate::repo::ExptRepository;
use crate::scheduler::{ExptScheduler, sweep_zombie_experiments};
use crate::utils::id::IdGenerator;


/// Collaborators shared by every handler. Cloning is cheap.
#[derive(Clone)]
pub struct EngineDeps {
    pub config: ConfigHandle,
    pub repo: Arc<dyn ExptRepository>,
    pub idem: Arc<dyn IdempotencyStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub eval_set: Arc<dyn EvalSetService>,
    pub target: Arc<dyn TargetService>,
    pub evaluator: Arc<dyn EvaluatorService>,
    pub quota: Arc<dyn QuotaService>,
    pub tags: Arc<dyn TagService>,
    pub ids: IdGenerator,
}

#[derive(Clone)]
pub struct Engine {
    deps: EngineDeps,
    scheduler: ExptScheduler,
    item_evaluator: ItemEvaluator,
    aggregator: ResultAggregator,
    corrections: CorrectionHandler,
}

impl Engine {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            scheduler: ExptScheduler::new(deps.clone()),
            item_evaluator: ItemEvaluator::new(deps.clone()),
            aggregator: ResultAggregator::new(deps.clone()),
            corrections: CorrectionHandler::new(deps.clone()),
            deps,
        }
    }

    pub fn deps(&self) -> &EngineDeps {
        &self.deps
    }

    pub fn manager(&self) -> ExptManager {
        ExptManager::new(self.deps.clone())
    }

    /// Routes one event to its handler.
    pub async fn dispatch(&self, event: EngineEvent) -> Result<(), Error> {
        match event {
            EngineEvent::ExptSchedule(event) => self.scheduler.schedule(event).await,
            EngineEvent::ExptItemEval(event) => self.item_evaluator.evaluate(event).await,
            EngineEvent::AggrCalculate(event) => self.aggregator.calculate(event).await,
            EngineEvent::EvaluatorCorrection(event) => self.corrections.apply(event).await,
            EngineEvent::OnlineExptResult(event) => {
                debug!(
                    experiment_id = event.experiment_id,
                    item_id = event.item_id,
                    turn_id = event.turn_id,
                    "Online result has no in-process consumer"
                );
                Ok(())
            }
        }
    }

    /// Consumes the bus until `cancel_token` fires, then waits for in-flight handlers.
    ///
    /// Schedule, item and aggregate/correction topics get their own pools, sized from the
    /// config snapshot taken at startup. Take the online result receiver out of `receivers`
    /// beforehand to consume those events elsewhere; otherwise they are drained here. The
    /// experiment zombie sweeper runs alongside on the daemon interval.
    pub async fn run(
        &self,
        mut receivers: BusReceivers,
        cancel_token: CancellationToken,
    ) -> Result<(), Error> {
        let config = self.deps.config.snapshot();
        let handler: Arc<dyn EventHandler> = Arc::new(self.clone());
        let pools = [
            (Topic::ExptSchedule, config.expt_exec_worker_num),
            (Topic::ExptItemEval, config.expt_item_eval_worker_num),
            (Topic::AggrCalculate, config.expt_aggr_worker_num),
            (Topic::EvaluatorCorrection, config.expt_aggr_worker_num),
        ];
        let mut channels = Vec::with_capacity(pools.len() + 1);
        for (topic, worker_num) in &pools {
            let rx = receivers.take(*topic).ok_or_else(|| {
                Error::new(ErrorDetails::MessageBus {
                    message: format!("Receiver for topic `{topic}` was already taken"),
                })
            })?;
            channels.push((*topic, rx, *worker_num));
        }
        if let Some(rx) = receivers.take(Topic::OnlineExptResult) {
            channels.push((Topic::OnlineExptResult, rx, 1));
        }

        let pool_count = channels.len();
        let tracker = TaskTracker::new();
        for (topic, rx, worker_num) in channels {
            tracker.spawn(run_pool(
                topic.into(),
                rx,
                handler.clone(),
                worker_num,
                cancel_token.clone(),
            ));
        }
        tracker.spawn(sweep_loop(self.deps.clone(), cancel_token.clone()));
        tracker.close();
        info!(pools = pool_count, "Engine started");
        tracker.wait().await;
        info!("Engine stopped");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Engine {
    async fn handle(&self, event: EngineEvent) -> Result<(), Error> {
        self.dispatch(event).await
    }
}

async fn sweep_loop(deps: EngineDeps, cancel_token: CancellationToken) {
    loop {
        let interval = deps.config.snapshot().expt_exec_conf.daemon_interval();
        tokio::select! {
            () = cancel_token.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        match sweep_zombie_experiments(&deps).await {
            Ok(0) => {}
            Ok(terminated) => info!(terminated, "Swept zombie experiments"),
            Err(e) => warn!("Zombie sweep failed: {e}"),
        }
    }
}
